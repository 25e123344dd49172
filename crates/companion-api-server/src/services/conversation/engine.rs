use anyhow::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::models::SessionMeta;
use crate::models::ChatMessage;

use super::prompt_composer::PromptComposer;
use super::types::{
    AssistantMeta, DebugInfo, MemoryPreview, RecallResult, RecalledMemoryItem, TurnReply,
    TurnStreamEvent, TurnTimings, HISTORY_WINDOW, RECALL_LIMIT, TURN_MAX_TOKENS,
    TURN_TEMPERATURE,
};

/// Trait for the external memory subsystem (recall + background learning).
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn recall(&self, user_id: Uuid, query: &str, limit: usize) -> Result<RecallResult>;

    async fn add_conversation_message(
        &self,
        user_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<()>;
}

/// Trait for the text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;

    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>>;
}

/// Trait for the relational store, seen through the turn's lens.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Session by id, only if owned by `user_id`.
    async fn find_session(&self, session_id: Uuid, user_id: Uuid) -> Result<Option<SessionMeta>>;

    /// The most recent `limit` messages of a session, ascending by creation
    /// time. A sliding window, not full history.
    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Open the write unit for one turn. All writes buffer until `commit`;
    /// dropping the transaction rolls them back.
    async fn begin_turn(&self) -> Result<Box<dyn TurnTransaction>>;
}

#[async_trait]
pub trait TurnTransaction: Send {
    async fn create_session(&mut self, user_id: Uuid) -> Result<Uuid>;

    async fn insert_user_message(
        &mut self,
        session_id: Uuid,
        user_id: Uuid,
        content: &str,
    ) -> Result<()>;

    async fn insert_assistant_message(&mut self, draft: AssistantMessageDraft) -> Result<()>;

    async fn touch_session(&mut self, session_id: Uuid) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Everything persisted with an assistant reply: the exact composed prompt
/// and the recalled-memory snapshot are the audit trail proving what context
/// produced the reply.
#[derive(Debug, Clone)]
pub struct AssistantMessageDraft {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub system_prompt: String,
    pub recalled_memories: Vec<RecalledMemoryItem>,
    pub meta: AssistantMeta,
}

/// Closed failure taxonomy of the turn pipeline. Only `SessionNotFound`
/// surfaces structurally to the caller; everything else is normalized into
/// the fallback envelope by `process_turn`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    fn persistence(err: anyhow::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }

    fn generation(err: anyhow::Error) -> Self {
        EngineError::Generation(err.to_string())
    }
}

/// State carried between turn preparation (steps 1-5) and the generation /
/// persistence tail, shared by the batch and streaming paths.
struct PreparedTurn {
    session_id: Uuid,
    txn: Box<dyn TurnTransaction>,
    history: Vec<ChatMessage>,
    recall: RecallResult,
    system_prompt: String,
    messages: Vec<ChatMessage>,
    recall_ms: u64,
}

/// The conversation engine: coordinates history, recall, prompt composition,
/// generation, and durable recording of each turn.
pub struct ConversationEngine {
    store: Arc<dyn TurnStore>,
    memory: Arc<dyn MemoryProvider>,
    llm: Arc<dyn LlmProvider>,
    composer: PromptComposer,
    model_name: String,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn TurnStore>,
        memory: Arc<dyn MemoryProvider>,
        llm: Arc<dyn LlmProvider>,
        model_name: String,
    ) -> Self {
        Self {
            store,
            memory,
            llm,
            composer: PromptComposer::new(),
            model_name,
        }
    }

    /// Process one turn end to end (non-streaming).
    ///
    /// Returns `Err` only for an unknown or foreign session, before any side
    /// effect. Every other failure rolls the turn back and comes back as an
    /// `Ok` fallback envelope with the cause in `error`.
    pub async fn process_turn(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        message: String,
        debug: bool,
    ) -> Result<TurnReply, EngineError> {
        match self.run_turn(user_id, session_id, &message, debug).await {
            Ok(reply) => Ok(reply),
            Err(EngineError::SessionNotFound(id)) => Err(EngineError::SessionNotFound(id)),
            Err(err) => {
                error!("turn failed for user {}: {}", user_id, err);
                Ok(TurnReply::fallback(session_id, err))
            }
        }
    }

    async fn run_turn(
        &self,
        user_id: Uuid,
        requested_session: Option<Uuid>,
        message: &str,
        debug: bool,
    ) -> Result<TurnReply, EngineError> {
        let turn_started = Instant::now();
        let prepared = self.prepare_turn(user_id, requested_session, message).await?;

        let generation_started = Instant::now();
        let response = self
            .llm
            .generate(&prepared.messages, TURN_TEMPERATURE, TURN_MAX_TOKENS)
            .await
            .map_err(EngineError::generation)?;
        let generation_ms = generation_started.elapsed().as_millis() as u64;

        let persistence_started = Instant::now();
        let PreparedTurn {
            session_id,
            txn,
            history,
            recall,
            system_prompt,
            messages,
            recall_ms,
        } = prepared;
        self.persist_and_sync(
            txn,
            session_id,
            user_id,
            message,
            &response,
            &system_prompt,
            &recall,
            history.len(),
        )
        .await?;
        let persistence_ms = persistence_started.elapsed().as_millis() as u64;

        info!(
            "turn complete: user={}, session={}, memories={}, history={}",
            user_id,
            session_id,
            recall.merged.len(),
            history.len()
        );

        let debug_info = debug.then(|| DebugInfo {
            model: self.model_name.clone(),
            temperature: TURN_TEMPERATURE,
            max_tokens: TURN_MAX_TOKENS,
            message_count: messages.len(),
            history_count: history.len(),
            messages,
            timings: TurnTimings {
                recall_ms,
                generation_ms,
                persistence_ms,
                total_ms: turn_started.elapsed().as_millis() as u64,
            },
        });

        Ok(TurnReply {
            session_id: Some(session_id),
            response,
            memories_recalled: recall.merged.len(),
            history_messages_count: history.len(),
            debug_info,
            error: None,
        })
    }

    /// Process one turn with incremental token delivery.
    ///
    /// Yields token fragments in generation order, then exactly one terminal
    /// event (`Done` or `Error`), always last. Dropping the stream before the
    /// terminal event abandons the turn's transaction, so a cancelled stream
    /// never commits a truncated reply.
    pub fn stream_turn(
        self: Arc<Self>,
        user_id: Uuid,
        requested_session: Option<Uuid>,
        message: String,
        debug: bool,
    ) -> Pin<Box<dyn Stream<Item = TurnStreamEvent> + Send>> {
        let engine = self;
        Box::pin(async_stream::stream! {
            let turn_started = Instant::now();

            let prepared = match engine.prepare_turn(user_id, requested_session, &message).await {
                Ok(prepared) => prepared,
                Err(err) => {
                    warn!("streaming turn aborted before generation: {}", err);
                    yield TurnStreamEvent::Error { error: err.to_string() };
                    return;
                }
            };
            let PreparedTurn {
                session_id,
                txn,
                history,
                recall,
                system_prompt,
                messages,
                recall_ms,
            } = prepared;

            let generation_started = Instant::now();
            let mut llm_stream = match engine
                .llm
                .generate_stream(&messages, TURN_TEMPERATURE, TURN_MAX_TOKENS)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to open generation stream: {}", err);
                    yield TurnStreamEvent::Error {
                        error: EngineError::generation(err).to_string(),
                    };
                    return;
                }
            };

            let mut full_text = String::new();
            while let Some(fragment) = llm_stream.next().await {
                match fragment {
                    Ok(delta) => {
                        if delta.is_empty() {
                            continue;
                        }
                        full_text.push_str(&delta);
                        yield TurnStreamEvent::Token { content: delta };
                    }
                    Err(err) => {
                        error!("generation stream failed mid-turn: {}", err);
                        yield TurnStreamEvent::Error {
                            error: EngineError::generation(err).to_string(),
                        };
                        return;
                    }
                }
            }
            let generation_ms = generation_started.elapsed().as_millis() as u64;

            let persistence_started = Instant::now();
            if let Err(err) = engine
                .persist_and_sync(
                    txn,
                    session_id,
                    user_id,
                    &message,
                    &full_text,
                    &system_prompt,
                    &recall,
                    history.len(),
                )
                .await
            {
                error!("streaming turn failed to persist: {}", err);
                yield TurnStreamEvent::Error { error: err.to_string() };
                return;
            }
            let persistence_ms = persistence_started.elapsed().as_millis() as u64;

            let debug_info = debug.then(|| DebugInfo {
                model: engine.model_name.clone(),
                temperature: TURN_TEMPERATURE,
                max_tokens: TURN_MAX_TOKENS,
                message_count: messages.len(),
                history_count: history.len(),
                messages,
                timings: TurnTimings {
                    recall_ms,
                    generation_ms,
                    persistence_ms,
                    total_ms: turn_started.elapsed().as_millis() as u64,
                },
            });

            yield TurnStreamEvent::Done {
                session_id,
                memories_recalled: recall.merged.len(),
                history_messages_count: history.len(),
                memories: recall.merged.iter().map(MemoryPreview::from_item).collect(),
                debug_info,
            };
        })
    }

    /// Steps 1-5 of the turn: resolve the session, fetch the history window,
    /// buffer the inbound message, join the concurrent recall, and compose
    /// the system prompt.
    async fn prepare_turn(
        &self,
        user_id: Uuid,
        requested_session: Option<Uuid>,
        message: &str,
    ) -> Result<PreparedTurn, EngineError> {
        // Ownership is checked before any write; a foreign session id is
        // indistinguishable from a missing one.
        let existing = match requested_session {
            Some(id) => Some(
                self.store
                    .find_session(id, user_id)
                    .await
                    .map_err(EngineError::persistence)?
                    .ok_or(EngineError::SessionNotFound(id))?,
            ),
            None => None,
        };

        // Recall runs concurrently with the store work below; it is joined
        // right before prompt composition.
        let recall_started = Instant::now();
        let recall_task = {
            let memory = Arc::clone(&self.memory);
            let query = message.to_string();
            tokio::spawn(async move { memory.recall(user_id, &query, RECALL_LIMIT).await })
        };

        let history = match &existing {
            Some(session) => match self.store.recent_messages(session.id, HISTORY_WINDOW).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!("history fetch failed, continuing with empty history: {}", err);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut txn = self
            .store
            .begin_turn()
            .await
            .map_err(EngineError::persistence)?;
        let session_id = match &existing {
            Some(session) => session.id,
            None => txn
                .create_session(user_id)
                .await
                .map_err(EngineError::persistence)?,
        };
        txn.insert_user_message(session_id, user_id, message)
            .await
            .map_err(EngineError::persistence)?;

        let recall = match recall_task.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!("memory recall failed, continuing without context: {}", err);
                RecallResult::default()
            }
            Err(err) => {
                warn!("memory recall task aborted: {}", err);
                RecallResult::default()
            }
        };
        let recall_ms = recall_started.elapsed().as_millis() as u64;

        let system_prompt =
            self.composer
                .compose(&recall.merged, &recall.graph_context, &recall.user_profile);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&system_prompt));
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(message));

        Ok(PreparedTurn {
            session_id,
            txn,
            history,
            recall,
            system_prompt,
            messages,
            recall_ms,
        })
    }

    /// Steps 7-10: record the reply with full provenance, bump the session,
    /// commit, then forward the user utterance for background extraction.
    async fn persist_and_sync(
        &self,
        mut txn: Box<dyn TurnTransaction>,
        session_id: Uuid,
        user_id: Uuid,
        message: &str,
        response: &str,
        system_prompt: &str,
        recall: &RecallResult,
        history_count: usize,
    ) -> Result<(), EngineError> {
        let draft = AssistantMessageDraft {
            session_id,
            user_id,
            content: response.to_string(),
            system_prompt: system_prompt.to_string(),
            recalled_memories: recall.merged.clone(),
            meta: AssistantMeta {
                memories_count: recall.merged.len(),
                temperature: TURN_TEMPERATURE,
                max_tokens: TURN_MAX_TOKENS,
                model_name: self.model_name.clone(),
                history_messages_count: history_count,
            },
        };

        txn.insert_assistant_message(draft)
            .await
            .map_err(EngineError::persistence)?;
        txn.touch_session(session_id)
            .await
            .map_err(EngineError::persistence)?;
        txn.commit().await.map_err(EngineError::persistence)?;

        // The turn is durable; failure to sync only costs future extraction.
        if let Err(err) = self
            .memory
            .add_conversation_message(user_id, "user", message)
            .await
        {
            warn!("post-commit memory sync failed: {}", err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conversation::types::{MemoryType, FALLBACK_RESPONSE};
    use chrono::Utc;
    use std::sync::Mutex;

    // ===== Mock store =====

    #[derive(Clone, Debug)]
    struct StoredRow {
        session_id: Uuid,
        role: String,
        content: String,
        system_prompt: Option<String>,
        memories_count: Option<usize>,
    }

    #[derive(Default)]
    struct StoreState {
        sessions: Vec<(Uuid, Uuid)>, // (session_id, user_id)
        messages: Vec<StoredRow>,
        touched: Vec<Uuid>,
    }

    struct MockStore {
        state: Arc<Mutex<StoreState>>,
        prior_history: Vec<ChatMessage>,
        fail_history: bool,
        fail_assistant_insert: bool,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(StoreState::default())),
                prior_history: Vec::new(),
                fail_history: false,
                fail_assistant_insert: false,
            }
        }

        fn with_session(self, session_id: Uuid, user_id: Uuid) -> Self {
            self.state
                .lock()
                .unwrap()
                .sessions
                .push((session_id, user_id));
            self
        }
    }

    #[async_trait]
    impl TurnStore for MockStore {
        async fn find_session(
            &self,
            session_id: Uuid,
            user_id: Uuid,
        ) -> Result<Option<SessionMeta>> {
            let found = self
                .state
                .lock()
                .unwrap()
                .sessions
                .iter()
                .any(|(sid, uid)| *sid == session_id && *uid == user_id);
            Ok(found.then(|| SessionMeta {
                id: session_id,
                user_id,
                title: None,
                pinned: false,
                created_at: Utc::now(),
                last_active_at: Utc::now(),
            }))
        }

        async fn recent_messages(
            &self,
            _session_id: Uuid,
            limit: usize,
        ) -> Result<Vec<ChatMessage>> {
            if self.fail_history {
                anyhow::bail!("history query timed out");
            }
            let skip = self.prior_history.len().saturating_sub(limit);
            Ok(self.prior_history[skip..].to_vec())
        }

        async fn begin_turn(&self) -> Result<Box<dyn TurnTransaction>> {
            Ok(Box::new(MockTxn {
                state: Arc::clone(&self.state),
                staged_sessions: Vec::new(),
                staged_messages: Vec::new(),
                staged_touches: Vec::new(),
                fail_assistant_insert: self.fail_assistant_insert,
            }))
        }
    }

    struct MockTxn {
        state: Arc<Mutex<StoreState>>,
        staged_sessions: Vec<(Uuid, Uuid)>,
        staged_messages: Vec<StoredRow>,
        staged_touches: Vec<Uuid>,
        fail_assistant_insert: bool,
    }

    #[async_trait]
    impl TurnTransaction for MockTxn {
        async fn create_session(&mut self, user_id: Uuid) -> Result<Uuid> {
            let id = Uuid::new_v4();
            self.staged_sessions.push((id, user_id));
            Ok(id)
        }

        async fn insert_user_message(
            &mut self,
            session_id: Uuid,
            _user_id: Uuid,
            content: &str,
        ) -> Result<()> {
            self.staged_messages.push(StoredRow {
                session_id,
                role: "user".to_string(),
                content: content.to_string(),
                system_prompt: None,
                memories_count: None,
            });
            Ok(())
        }

        async fn insert_assistant_message(&mut self, draft: AssistantMessageDraft) -> Result<()> {
            if self.fail_assistant_insert {
                anyhow::bail!("constraint violation");
            }
            self.staged_messages.push(StoredRow {
                session_id: draft.session_id,
                role: "assistant".to_string(),
                content: draft.content,
                system_prompt: Some(draft.system_prompt),
                memories_count: Some(draft.recalled_memories.len()),
            });
            Ok(())
        }

        async fn touch_session(&mut self, session_id: Uuid) -> Result<()> {
            self.staged_touches.push(session_id);
            Ok(())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.sessions.extend(self.staged_sessions);
            state.messages.extend(self.staged_messages);
            state.touched.extend(self.staged_touches);
            Ok(())
        }
    }

    // ===== Mock gateways =====

    struct MockMemory {
        result: RecallResult,
        fail_recall: bool,
        fail_sync: bool,
        synced: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl MockMemory {
        fn new() -> Self {
            Self {
                result: RecallResult::default(),
                fail_recall: false,
                fail_sync: false,
                synced: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_memories(mut self, items: Vec<RecalledMemoryItem>) -> Self {
            self.result.merged = items;
            self
        }
    }

    #[async_trait]
    impl MemoryProvider for MockMemory {
        async fn recall(&self, _user_id: Uuid, _query: &str, _limit: usize) -> Result<RecallResult> {
            if self.fail_recall {
                anyhow::bail!("memory engine unreachable");
            }
            Ok(self.result.clone())
        }

        async fn add_conversation_message(
            &self,
            _user_id: Uuid,
            role: &str,
            content: &str,
        ) -> Result<()> {
            if self.fail_sync {
                anyhow::bail!("sync endpoint down");
            }
            self.synced
                .lock()
                .unwrap()
                .push((role.to_string(), content.to_string()));
            Ok(())
        }
    }

    struct MockLlm {
        reply: String,
        fragments: Vec<Result<String, String>>,
        fail: bool,
        last_request: Arc<Mutex<Vec<ChatMessage>>>,
    }

    impl MockLlm {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fragments: reply
                    .split_inclusive(' ')
                    .map(|s| Ok(s.to_string()))
                    .collect(),
                fail: false,
                last_request: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn failing() -> Self {
            let mut llm = Self::new("");
            llm.fail = true;
            llm
        }
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String> {
            *self.last_request.lock().unwrap() = messages.to_vec();
            if self.fail {
                anyhow::bail!("model endpoint returned 503");
            }
            Ok(self.reply.clone())
        }

        async fn generate_stream(
            &self,
            messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<String>> + Send>>> {
            *self.last_request.lock().unwrap() = messages.to_vec();
            if self.fail {
                anyhow::bail!("model endpoint returned 503");
            }
            let items: Vec<Result<String>> = self
                .fragments
                .clone()
                .into_iter()
                .map(|f| f.map_err(|e| anyhow::anyhow!(e)))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn memory_item(content: &str, memory_type: MemoryType) -> RecalledMemoryItem {
        RecalledMemoryItem {
            content: content.to_string(),
            score: 0.8,
            memory_type,
            created_at: None,
            metadata: Default::default(),
        }
    }

    fn engine(
        store: MockStore,
        memory: MockMemory,
        llm: MockLlm,
    ) -> (Arc<ConversationEngine>, Arc<Mutex<StoreState>>) {
        let state = Arc::clone(&store.state);
        let engine = Arc::new(ConversationEngine::new(
            Arc::new(store),
            Arc::new(memory),
            Arc::new(llm),
            "deepseek-chat".to_string(),
        ));
        (engine, state)
    }

    // ===== Non-streaming path =====

    #[tokio::test]
    async fn test_first_turn_creates_session_and_both_rows() {
        let memory = MockMemory::new().with_memories(vec![
            memory_item("likes basketball", MemoryType::Fact),
            memory_item("moved last spring", MemoryType::Episodic),
        ]);
        let (engine, state) = engine(MockStore::new(), memory, MockLlm::new("Hi there!"));
        let user_id = Uuid::new_v4();

        let reply = engine
            .process_turn(user_id, None, "Hello".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, "Hi there!");
        assert_eq!(reply.memories_recalled, 2);
        assert_eq!(reply.history_messages_count, 0);
        assert!(reply.session_id.is_some());
        assert!(reply.error.is_none());

        let state = state.lock().unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.messages.len(), 2);
        assert!(state
            .messages
            .iter()
            .all(|m| m.session_id == reply.session_id.unwrap()));
        assert_eq!(state.messages[0].role, "user");
        assert_eq!(state.messages[0].content, "Hello");
        assert_eq!(state.messages[1].role, "assistant");
        assert_eq!(state.messages[1].memories_count, Some(2));
        assert!(state.messages[1]
            .system_prompt
            .as_deref()
            .unwrap()
            .contains("likes basketball"));
        assert_eq!(state.touched, vec![reply.session_id.unwrap()]);
    }

    #[tokio::test]
    async fn test_foreign_session_rejected_with_zero_writes() {
        let session_id = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let store = MockStore::new().with_session(session_id, owner);
        let (engine, state) = engine(store, MockMemory::new(), MockLlm::new("nope"));

        let result = engine
            .process_turn(intruder, Some(session_id), "hi".to_string(), false)
            .await;

        assert!(matches!(result, Err(EngineError::SessionNotFound(id)) if id == session_id));
        let state = state.lock().unwrap();
        assert!(state.messages.is_empty());
        assert!(state.touched.is_empty());
    }

    #[tokio::test]
    async fn test_recall_failure_degrades_to_empty_context() {
        let mut memory = MockMemory::new();
        memory.fail_recall = true;
        let (engine, state) = engine(MockStore::new(), memory, MockLlm::new("still here"));

        let reply = engine
            .process_turn(Uuid::new_v4(), None, "hi".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, "still here");
        assert_eq!(reply.memories_recalled, 0);
        assert!(reply.error.is_none());
        assert_eq!(state.lock().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_history_failure_degrades_to_empty_history() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut store = MockStore::new().with_session(session_id, user_id);
        store.fail_history = true;
        let (engine, _) = engine(store, MockMemory::new(), MockLlm::new("ok"));

        let reply = engine
            .process_turn(user_id, Some(session_id), "hi".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, "ok");
        assert_eq!(reply.history_messages_count, 0);
        assert!(reply.error.is_none());
    }

    #[tokio::test]
    async fn test_generation_failure_rolls_back_and_returns_fallback() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let store = MockStore::new().with_session(session_id, user_id);
        let (engine, state) = engine(store, MockMemory::new(), MockLlm::failing());

        let reply = engine
            .process_turn(user_id, Some(session_id), "hi".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, FALLBACK_RESPONSE);
        assert_eq!(reply.session_id, Some(session_id));
        assert!(reply.error.as_deref().unwrap().contains("503"));
        // No orphaned user message survives the rollback.
        assert!(state.lock().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_discards_generated_text() {
        let mut store = MockStore::new();
        store.fail_assistant_insert = true;
        let (engine, state) = engine(store, MockMemory::new(), MockLlm::new("generated"));

        let reply = engine
            .process_turn(Uuid::new_v4(), None, "hi".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, FALLBACK_RESPONSE);
        assert!(reply.session_id.is_none());
        assert!(reply.error.is_some());
        assert!(state.lock().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_history_window_caps_at_twenty_most_recent_ascending() {
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut store = MockStore::new().with_session(session_id, user_id);
        store.prior_history = (0..25)
            .map(|i| ChatMessage::user(format!("msg-{}", i)))
            .collect();
        let llm = MockLlm::new("ok");
        let request = Arc::clone(&llm.last_request);
        let (engine, _) = engine(store, MockMemory::new(), llm);

        let reply = engine
            .process_turn(user_id, Some(session_id), "now".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.history_messages_count, 20);
        let request = request.lock().unwrap();
        // system + 20 history + current user message
        assert_eq!(request.len(), 22);
        assert_eq!(request[0].role, "system");
        assert_eq!(request[1].content, "msg-5");
        assert_eq!(request[20].content, "msg-24");
        assert_eq!(request[21].content, "now");
    }

    #[tokio::test]
    async fn test_post_commit_sync_gets_user_utterance_only() {
        let memory = MockMemory::new();
        let synced = Arc::clone(&memory.synced);
        let (engine, _) = engine(MockStore::new(), memory, MockLlm::new("reply"));

        engine
            .process_turn(Uuid::new_v4(), None, "remember this".to_string(), false)
            .await
            .unwrap();

        let synced = synced.lock().unwrap();
        assert_eq!(
            *synced,
            vec![("user".to_string(), "remember this".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sync_failure_does_not_affect_outcome() {
        let mut memory = MockMemory::new();
        memory.fail_sync = true;
        let (engine, state) = engine(MockStore::new(), memory, MockLlm::new("reply"));

        let reply = engine
            .process_turn(Uuid::new_v4(), None, "hi".to_string(), false)
            .await
            .unwrap();

        assert_eq!(reply.response, "reply");
        assert!(reply.error.is_none());
        assert_eq!(state.lock().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_debug_info_carries_transcript_and_policy() {
        let (engine, _) = engine(MockStore::new(), MockMemory::new(), MockLlm::new("reply"));

        let reply = engine
            .process_turn(Uuid::new_v4(), None, "hi".to_string(), true)
            .await
            .unwrap();

        let debug = reply.debug_info.unwrap();
        assert_eq!(debug.model, "deepseek-chat");
        assert_eq!(debug.temperature, TURN_TEMPERATURE);
        assert_eq!(debug.max_tokens, TURN_MAX_TOKENS);
        assert_eq!(debug.history_count, 0);
        assert_eq!(debug.message_count, 2);
        assert_eq!(debug.messages[0].role, "system");
        assert_eq!(debug.messages[1].content, "hi");
    }

    // ===== Streaming path =====

    #[tokio::test]
    async fn test_stream_fragments_concatenate_to_persisted_content() {
        let (engine, state) = engine(
            MockStore::new(),
            MockMemory::new(),
            MockLlm::new("hello from the stream"),
        );

        let events: Vec<TurnStreamEvent> = engine
            .stream_turn(Uuid::new_v4(), None, "hi".to_string(), false)
            .collect()
            .await;

        let terminal_count = events
            .iter()
            .filter(|e| !matches!(e, TurnStreamEvent::Token { .. }))
            .count();
        assert_eq!(terminal_count, 1);
        assert!(matches!(events.last().unwrap(), TurnStreamEvent::Done { .. }));

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                TurnStreamEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "hello from the stream");

        let state = state.lock().unwrap();
        assert_eq!(state.messages[1].role, "assistant");
        assert_eq!(state.messages[1].content, "hello from the stream");
    }

    #[tokio::test]
    async fn test_stream_mid_generation_failure_emits_error_and_rolls_back() {
        let mut llm = MockLlm::new("partial answer");
        llm.fragments = vec![
            Ok("partial ".to_string()),
            Err("connection reset".to_string()),
        ];
        let (engine, state) = engine(MockStore::new(), MockMemory::new(), llm);

        let events: Vec<TurnStreamEvent> = engine
            .stream_turn(Uuid::new_v4(), None, "hi".to_string(), false)
            .collect()
            .await;

        assert!(matches!(events.last().unwrap(), TurnStreamEvent::Error { .. }));
        let tokens = events
            .iter()
            .filter(|e| matches!(e, TurnStreamEvent::Token { .. }))
            .count();
        assert_eq!(tokens, 1);
        assert!(state.lock().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_stream_unknown_session_emits_error_event() {
        let (engine, state) = engine(MockStore::new(), MockMemory::new(), MockLlm::new("x"));

        let events: Vec<TurnStreamEvent> = engine
            .stream_turn(Uuid::new_v4(), Some(Uuid::new_v4()), "hi".to_string(), false)
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TurnStreamEvent::Error { error } if error.contains("not found")));
        assert!(state.lock().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_commits_nothing() {
        let (engine, state) = engine(
            MockStore::new(),
            MockMemory::new(),
            MockLlm::new("a long reply in several parts"),
        );

        let mut stream = engine.stream_turn(Uuid::new_v4(), None, "hi".to_string(), false);
        let first = stream.next().await;
        assert!(matches!(first, Some(TurnStreamEvent::Token { .. })));
        drop(stream);

        let state = state.lock().unwrap();
        assert!(state.messages.is_empty());
        assert!(state.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_stream_done_event_reports_recall_summary() {
        let long_content = "x".repeat(400);
        let memory = MockMemory::new().with_memories(vec![RecalledMemoryItem {
            content: long_content,
            score: 0.876,
            memory_type: MemoryType::Fact,
            created_at: None,
            metadata: Default::default(),
        }]);
        let (engine, _) = engine(MockStore::new(), memory, MockLlm::new("ok"));

        let events: Vec<TurnStreamEvent> = engine
            .stream_turn(Uuid::new_v4(), None, "hi".to_string(), true)
            .collect()
            .await;

        match events.last().unwrap() {
            TurnStreamEvent::Done {
                memories_recalled,
                memories,
                debug_info,
                ..
            } => {
                assert_eq!(*memories_recalled, 1);
                assert_eq!(memories.len(), 1);
                assert!(memories[0].content.chars().count() <= 120);
                assert_eq!(memories[0].score, 0.88);
                assert!(debug_info.is_some());
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
