use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::ChatMessage;

// ===== Turn policy constants =====
//
// Fixed per-turn generation policy; deliberately not user-tunable.

pub const TURN_TEMPERATURE: f32 = 0.8;
pub const TURN_MAX_TOKENS: u32 = 500;
pub const RECALL_LIMIT: usize = 5;
pub const HISTORY_WINDOW: usize = 20;

/// Valence thresholds for the aggregate emotional hint.
pub const VALENCE_NEGATIVE_THRESHOLD: f32 = -0.3;
pub const VALENCE_POSITIVE_THRESHOLD: f32 = 0.3;

/// Content prefix length for memory previews in the streaming terminal event.
pub const MEMORY_PREVIEW_CHARS: usize = 120;

/// What the user sees when a turn fails after the point of no return.
pub const FALLBACK_RESPONSE: &str =
    "Sorry, I ran into a problem on my end. Please try again in a moment.";

// ===== Memory gateway payloads =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Episodic,
    Insight,
    #[default]
    #[serde(other)]
    Other,
}

/// One recalled memory as returned by the gateway. Copied verbatim into the
/// assistant message's `recalled_memories` snapshot at persistence time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledMemoryItem {
    pub content: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub memory_type: MemoryType,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RecalledMemoryItem {
    /// Emotional tone attached by the memory engine, if any.
    pub fn emotion(&self) -> Option<EmotionTag> {
        let emotion = self.metadata.get("emotion")?.as_object()?;
        Some(EmotionTag {
            label: emotion
                .get("label")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            valence: emotion.get("valence").and_then(Value::as_f64).map(|v| v as f32),
            arousal: emotion.get("arousal").and_then(Value::as_f64).map(|v| v as f32),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmotionTag {
    pub label: Option<String>,
    pub valence: Option<f32>,
    pub arousal: Option<f32>,
}

/// Long-term user profile maintained by the memory engine. Known fields are
/// explicit; anything else passes through `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub occupation: Option<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub personality: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.identity.is_none()
            && self.occupation.is_none()
            && self.interests.is_empty()
            && self.values.is_empty()
            && self.relationships.is_empty()
            && self.personality.is_empty()
            && self.extra.is_empty()
    }
}

/// Unified recall result: relevance-ranked memories plus ancillary context.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecallResult {
    #[serde(default)]
    pub merged: Vec<RecalledMemoryItem>,
    #[serde(default)]
    pub graph_context: Vec<String>,
    #[serde(default)]
    pub user_profile: UserProfile,
}

// ===== Persisted assistant provenance =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMeta {
    pub memories_count: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub model_name: String,
    pub history_messages_count: usize,
}

// ===== Turn results =====

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub session_id: Option<Uuid>,
    pub response: String,
    pub memories_recalled: usize,
    pub history_messages_count: usize,
    pub debug_info: Option<DebugInfo>,
    pub error: Option<String>,
}

impl TurnReply {
    /// Normalized envelope for a failed turn: the fixed apology plus the
    /// underlying cause, never the raw error as the user-facing text.
    pub fn fallback(session_id: Option<Uuid>, error: impl std::fmt::Display) -> Self {
        Self {
            session_id,
            response: FALLBACK_RESPONSE.to_string(),
            memories_recalled: 0,
            history_messages_count: 0,
            debug_info: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugInfo {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub message_count: usize,
    pub history_count: usize,
    pub messages: Vec<ChatMessage>,
    pub timings: TurnTimings,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnTimings {
    pub recall_ms: u64,
    pub generation_ms: u64,
    pub persistence_ms: u64,
    pub total_ms: u64,
}

// ===== Streaming events =====

/// Events emitted by the streaming turn path. Token fragments arrive in
/// generation order; exactly one terminal event (`Done` or `Error`) follows
/// them and is always the last event of the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnStreamEvent {
    Token {
        content: String,
    },
    Done {
        session_id: Uuid,
        memories_recalled: usize,
        history_messages_count: usize,
        memories: Vec<MemoryPreview>,
        #[serde(skip_serializing_if = "Option::is_none")]
        debug_info: Option<DebugInfo>,
    },
    Error {
        error: String,
    },
}

impl TurnStreamEvent {
    /// SSE event name for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnStreamEvent::Token { .. } => "token",
            TurnStreamEvent::Done { .. } => "done",
            TurnStreamEvent::Error { .. } => "error",
        }
    }
}

/// Truncated view of a recalled memory for the terminal event.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryPreview {
    pub content: String,
    pub score: f32,
    pub memory_type: MemoryType,
}

impl MemoryPreview {
    pub fn from_item(item: &RecalledMemoryItem) -> Self {
        Self {
            content: item.content.chars().take(MEMORY_PREVIEW_CHARS).collect(),
            score: (item.score * 100.0).round() / 100.0,
            memory_type: item.memory_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item_with_metadata(metadata: Value) -> RecalledMemoryItem {
        RecalledMemoryItem {
            content: "test".to_string(),
            score: 0.5,
            memory_type: MemoryType::Fact,
            created_at: None,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_memory_type_parses_unknown_as_other() {
        let item: RecalledMemoryItem =
            serde_json::from_value(json!({"content": "x", "memory_type": "reflection"})).unwrap();
        assert_eq!(item.memory_type, MemoryType::Other);

        let item: RecalledMemoryItem =
            serde_json::from_value(json!({"content": "x", "memory_type": "episodic"})).unwrap();
        assert_eq!(item.memory_type, MemoryType::Episodic);
    }

    #[test]
    fn test_emotion_extraction() {
        let item = item_with_metadata(json!({
            "emotion": {"label": "joyful", "valence": 0.8, "arousal": 0.4}
        }));
        let emotion = item.emotion().unwrap();
        assert_eq!(emotion.label.as_deref(), Some("joyful"));
        assert_eq!(emotion.valence, Some(0.8));

        let item = item_with_metadata(json!({"emotion": {"valence": -0.6}}));
        let emotion = item.emotion().unwrap();
        assert_eq!(emotion.label, None);
        assert_eq!(emotion.valence, Some(-0.6));

        let item = item_with_metadata(json!({"source": "import"}));
        assert!(item.emotion().is_none());
    }

    #[test]
    fn test_memory_preview_truncates_and_rounds() {
        let long = "x".repeat(500);
        let item = RecalledMemoryItem {
            content: long,
            score: 0.87654,
            memory_type: MemoryType::Insight,
            created_at: None,
            metadata: Default::default(),
        };
        let preview = MemoryPreview::from_item(&item);
        assert_eq!(preview.content.chars().count(), MEMORY_PREVIEW_CHARS);
        assert_eq!(preview.score, 0.88);
    }

    #[test]
    fn test_recall_result_tolerates_missing_fields() {
        let result: RecallResult = serde_json::from_value(json!({})).unwrap();
        assert!(result.merged.is_empty());
        assert!(result.graph_context.is_empty());
        assert!(result.user_profile.is_empty());
    }
}
