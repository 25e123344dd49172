use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::debug;

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::services::conversation::engine::LlmProvider;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
struct ChoiceChunk {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// One parsed `data:` line of the completion SSE stream.
#[derive(Debug, PartialEq)]
enum SsePayload {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SsePayload {
    let Some(json_str) = line.trim().strip_prefix("data: ") else {
        return SsePayload::Skip;
    };
    if json_str == "[DONE]" {
        return SsePayload::Done;
    }
    match serde_json::from_str::<ChatCompletionChunk>(json_str) {
        Ok(chunk) => chunk
            .choices
            .first()
            .and_then(|c| c.delta.content.clone())
            .filter(|content| !content.is_empty())
            .map(SsePayload::Delta)
            .unwrap_or(SsePayload::Skip),
        Err(_) => SsePayload::Skip,
    }
}

/// Client for an OpenAI-compatible chat-completions backend.
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }

    async fn send_completion_request(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature,
            max_tokens,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("failed to call LLM API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error: {} - {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl LlmProvider for LlmService {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String> {
        debug!("Chat generation with {} messages", messages.len());

        let response = self
            .send_completion_request(messages, temperature, max_tokens, false)
            .await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("failed to parse LLM response: {}", e))?;

        completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("no choices returned from LLM"))
    }

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
        debug!("Chat stream with {} messages", messages.len());

        let response = self
            .send_completion_request(messages, temperature, max_tokens, true)
            .await?;

        let mut bytes = response.bytes_stream();
        let parsed = async_stream::try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| anyhow!("stream error: {}", e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Network chunks do not align with SSE lines; drain whole
                // lines and keep the remainder buffered.
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    match parse_sse_line(&line) {
                        SsePayload::Delta(content) => yield content,
                        SsePayload::Done => return,
                        SsePayload::Skip => {}
                    }
                }
            }
        };

        Ok(Box::pin(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_delta_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line), SsePayload::Delta("Hel".to_string()));
    }

    #[test]
    fn test_parse_sse_done_sentinel() {
        assert_eq!(parse_sse_line("data: [DONE]"), SsePayload::Done);
    }

    #[test]
    fn test_parse_sse_ignores_noise() {
        assert_eq!(parse_sse_line(""), SsePayload::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SsePayload::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{}}]}"#),
            SsePayload::Skip
        );
        assert_eq!(parse_sse_line("data: not-json"), SsePayload::Skip);
    }
}
