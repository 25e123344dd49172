use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::services::conversation::engine::MemoryProvider;
use crate::services::conversation::types::{RecallResult, RecalledMemoryItem, UserProfile};

/// Client for the external memory engine: relevance-ranked recall plus
/// fire-and-forget conversation sync for background extraction.
#[derive(Clone)]
pub struct MemoryService {
    client: Client,
    config: MemoryConfig,
}

impl MemoryService {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }
}

/// The gateway's payloads are loosely shaped; coerce them into typed
/// structures here at the boundary, dropping (and logging) anything
/// malformed instead of failing the whole recall.
fn coerce_recall_result(raw: Value) -> RecallResult {
    let merged: Vec<RecalledMemoryItem> = raw
        .get("merged")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match serde_json::from_value(item.clone()) {
                    Ok(parsed) => Some(parsed),
                    Err(err) => {
                        warn!("dropping malformed memory item: {}", err);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let graph_context: Vec<String> = raw
        .get("graph_context")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let user_profile: UserProfile = raw
        .get("user_profile")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    RecallResult {
        merged,
        graph_context,
        user_profile,
    }
}

#[async_trait]
impl MemoryProvider for MemoryService {
    async fn recall(&self, user_id: Uuid, query: &str, limit: usize) -> Result<RecallResult> {
        let response = self
            .client
            .post(format!("{}/api/v1/recall", self.config.base_url))
            .json(&json!({
                "user_id": user_id,
                "query": query,
                "limit": limit,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("failed to call memory engine: {}", e))?;

        if !response.status().is_success() {
            anyhow::bail!("memory engine recall error: {}", response.status());
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("failed to parse recall response: {}", e))?;

        let result = coerce_recall_result(raw);
        debug!(
            "Recalled {} memories, {} graph facts for user {}",
            result.merged.len(),
            result.graph_context.len(),
            user_id
        );
        Ok(result)
    }

    async fn add_conversation_message(
        &self,
        user_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/api/v1/conversations/messages",
                self.config.base_url
            ))
            .json(&json!({
                "user_id": user_id,
                "role": role,
                "content": content,
            }))
            .send()
            .await
            .map_err(|e| anyhow!("failed to sync conversation message: {}", e))?;

        if !response.status().is_success() {
            anyhow::bail!("memory engine sync error: {}", response.status());
        }

        Ok(())
    }
}
