// src/conversation.rs
// Universal conversation tracking shared by every chatbot in the fleet.
// All operations on one session are serialized through that session's mutex.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::error::{HivemindError, Result};
use crate::types::{
    Conversation, ConversationStatus, ConversationSummary, ConversationTurn, Metadata,
};

/// Lifecycle event emitted by the conversation manager.
///
/// Event names are a stable external contract: `conversation_started`,
/// `turn_appended`, `conversation_ended`.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Started {
        session_id: String,
        chatbot_name: String,
        device_id: String,
    },
    TurnAppended {
        session_id: String,
        turn_id: String,
        user_message: String,
        bot_response: String,
        tokens_used: i64,
        metadata: Metadata,
    },
    Ended {
        session_id: String,
        chatbot_name: String,
        device_id: String,
    },
}

impl ConversationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConversationEvent::Started { .. } => "conversation_started",
            ConversationEvent::TurnAppended { .. } => "turn_appended",
            ConversationEvent::Ended { .. } => "conversation_ended",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            ConversationEvent::Started {
                session_id,
                chatbot_name,
                device_id,
            }
            | ConversationEvent::Ended {
                session_id,
                chatbot_name,
                device_id,
            } => serde_json::json!({
                "session_id": session_id,
                "chatbot_name": chatbot_name,
                "device_id": device_id,
            }),
            ConversationEvent::TurnAppended {
                session_id,
                turn_id,
                user_message,
                bot_response,
                tokens_used,
                metadata,
            } => serde_json::json!({
                "session_id": session_id,
                "turn_id": turn_id,
                "user_message": user_message,
                "bot_response": bot_response,
                "tokens_used": tokens_used,
                "metadata": metadata,
            }),
        }
    }
}

/// Receives conversation lifecycle events. A failing listener is logged and
/// skipped; it never affects the operation or the other listeners.
#[async_trait]
pub trait ConversationListener: Send + Sync {
    async fn on_event(&self, event: &ConversationEvent) -> anyhow::Result<()>;
}

/// Shared conversation tracking across all chatbots.
pub struct ConversationManager {
    brain: Arc<Brain>,
    active: Mutex<HashMap<String, Conversation>>,
    /// One mutex per live session; evicted on end_conversation so the map
    /// does not grow unboundedly.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    listeners: RwLock<Vec<Arc<dyn ConversationListener>>>,
}

impl ConversationManager {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self {
            brain,
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn ConversationListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a new conversation session. When no id is given, one is derived
    /// from the chatbot name plus a short random suffix.
    pub async fn start_conversation(
        &self,
        chatbot_name: &str,
        session_id: Option<&str>,
    ) -> Result<String> {
        let session_id = session_id.map(str::to_string).unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{chatbot_name}_{}", &suffix[..8])
        });

        let lock = self.session_lock(&session_id).await;
        let _guard = lock.lock().await;

        let conversation = Conversation::new(&session_id, chatbot_name, self.brain.device_id());
        self.brain.store_conversation(&conversation).await?;
        self.active
            .lock()
            .await
            .insert(session_id.clone(), conversation);

        info!(session_id = %session_id, chatbot = %chatbot_name, "Conversation started");
        self.dispatch(ConversationEvent::Started {
            session_id: session_id.clone(),
            chatbot_name: chatbot_name.to_string(),
            device_id: self.brain.device_id().to_string(),
        })
        .await;

        Ok(session_id)
    }

    /// Append a turn. Unknown sessions are loaded from storage, or
    /// reconstructed from the session id when storage has never seen them.
    pub async fn add_turn(
        &self,
        session_id: &str,
        user_message: &str,
        bot_response: &str,
        tokens_used: i64,
        metadata: Option<Metadata>,
    ) -> Result<ConversationTurn> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let started_event = self.ensure_session_loaded(session_id).await?;

        let turn = ConversationTurn::new(
            user_message,
            bot_response,
            tokens_used,
            metadata.unwrap_or_default(),
        );

        let snapshot = {
            let mut active = self.active.lock().await;
            let conversation = active
                .get_mut(session_id)
                .ok_or_else(|| HivemindError::NotFound(format!("session {session_id}")))?;
            conversation.turns.push(turn.clone());
            conversation.clone()
        };
        self.brain.store_conversation(&snapshot).await?;

        if let Some(event) = started_event {
            self.dispatch(event).await;
        }
        self.dispatch(ConversationEvent::TurnAppended {
            session_id: session_id.to_string(),
            turn_id: turn.turn_id.clone(),
            user_message: turn.user_message.clone(),
            bot_response: turn.bot_response.clone(),
            tokens_used: turn.tokens_used,
            metadata: turn.metadata.clone(),
        })
        .await;

        Ok(turn)
    }

    /// Get up to the last `max_turns` turns of a session. Missing sessions
    /// yield an empty list.
    pub async fn get_conversation_history(
        &self,
        session_id: &str,
        max_turns: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        {
            let active = self.active.lock().await;
            if let Some(conversation) = active.get(session_id) {
                return Ok(tail(&conversation.turns, max_turns));
            }
        }

        match self.brain.load_conversation(session_id).await? {
            Some(conversation) => {
                let turns = tail(&conversation.turns, max_turns);
                self.active
                    .lock()
                    .await
                    .insert(session_id.to_string(), conversation);
                Ok(turns)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Summary statistics for one session, or None when unknown.
    pub async fn get_conversation_summary(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationSummary>> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        if let Some(conversation) = self.active.lock().await.get(session_id) {
            return Ok(Some(summarize(conversation)));
        }

        Ok(self
            .brain
            .load_conversation(session_id)
            .await?
            .map(|conversation| summarize(&conversation)))
    }

    /// Complete a session: set the end time, persist, drop the in-memory
    /// entry and its lock. Unknown sessions are ignored.
    pub async fn end_conversation(&self, session_id: &str) -> Result<()> {
        let lock = self.session_lock(session_id).await;
        let ended = {
            let _guard = lock.lock().await;

            let Some(mut conversation) = self.active.lock().await.remove(session_id) else {
                // Nothing in memory; forget the lock we just created
                self.locks.lock().await.remove(session_id);
                return Ok(());
            };

            conversation.end_time = Some(Utc::now());
            conversation.status = ConversationStatus::Completed;
            self.brain.store_conversation(&conversation).await?;

            self.locks.lock().await.remove(session_id);
            info!(session_id = %session_id, turns = conversation.turns.len(), "Conversation ended");

            ConversationEvent::Ended {
                session_id: session_id.to_string(),
                chatbot_name: conversation.chatbot_name.clone(),
                device_id: conversation.device_id.clone(),
            }
        };

        self.dispatch(ended).await;
        Ok(())
    }

    /// Summaries of every session currently held in memory.
    pub async fn list_active_conversations(&self) -> Vec<ConversationSummary> {
        self.active
            .lock()
            .await
            .values()
            .map(summarize)
            .collect()
    }

    /// Recent conversations from storage merged with active sessions,
    /// de-duplicated by session id and trimmed to `limit`.
    pub async fn list_all_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let mut summaries: Vec<ConversationSummary> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for summary in self.list_active_conversations().await {
            seen.insert(summary.session_id.clone());
            summaries.push(summary);
        }

        for conversation in self.brain.list_conversations(limit).await? {
            if seen.insert(conversation.session_id.clone()) {
                summaries.push(summarize(&conversation));
            }
        }

        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Serialized view of a session including its summary.
    pub async fn export_conversation_snapshot(
        &self,
        session_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let conversation = {
            let active = self.active.lock().await;
            match active.get(session_id) {
                Some(conversation) => Some(conversation.clone()),
                None => self.brain.load_conversation(session_id).await?,
            }
        };

        let Some(conversation) = conversation else {
            return Ok(None);
        };

        let mut snapshot = serde_json::to_value(&conversation)?;
        snapshot["summary"] = serde_json::to_value(summarize(&conversation))?;
        Ok(Some(snapshot))
    }

    /// Make sure the session is in the active map. Returns a started event
    /// when a brand-new conversation had to be reconstructed.
    ///
    /// Callers must hold the session lock.
    async fn ensure_session_loaded(&self, session_id: &str) -> Result<Option<ConversationEvent>> {
        if self.active.lock().await.contains_key(session_id) {
            return Ok(None);
        }

        if let Some(conversation) = self.brain.load_conversation(session_id).await? {
            debug!(session_id = %session_id, "Loaded conversation from storage");
            self.active
                .lock()
                .await
                .insert(session_id.to_string(), conversation);
            return Ok(None);
        }

        // Never persisted: reconstruct a minimal conversation, deriving the
        // chatbot name from the id prefix.
        let chatbot_name = session_id
            .split_once('_')
            .map(|(name, _)| name)
            .unwrap_or("unknown")
            .to_string();

        let conversation = Conversation::new(session_id, &chatbot_name, self.brain.device_id());
        self.brain.store_conversation(&conversation).await?;
        self.active
            .lock()
            .await
            .insert(session_id.to_string(), conversation);

        debug!(session_id = %session_id, chatbot = %chatbot_name, "Reconstructed conversation");
        Ok(Some(ConversationEvent::Started {
            session_id: session_id.to_string(),
            chatbot_name,
            device_id: self.brain.device_id().to_string(),
        }))
    }

    /// Deliver an event to every listener, serially. Listener failures are
    /// logged and never propagate.
    async fn dispatch(&self, event: ConversationEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!(event = event.name(), "Conversation listener failed: {e}");
            }
        }
    }
}

fn tail(turns: &[ConversationTurn], max_turns: usize) -> Vec<ConversationTurn> {
    let start = turns.len().saturating_sub(max_turns);
    turns[start..].to_vec()
}

fn summarize(conversation: &Conversation) -> ConversationSummary {
    let total_turns = conversation.turns.len();
    let total_tokens: i64 = conversation.turns.iter().map(|t| t.tokens_used).sum();

    let duration_seconds = match conversation.end_time {
        Some(end) => Some((end - conversation.start_time).num_milliseconds() as f64 / 1000.0),
        None if total_turns > 0 => {
            Some((Utc::now() - conversation.start_time).num_milliseconds() as f64 / 1000.0)
        }
        None => None,
    };

    ConversationSummary {
        session_id: conversation.session_id.clone(),
        chatbot_name: conversation.chatbot_name.clone(),
        device_id: conversation.device_id.clone(),
        start_time: conversation.start_time,
        end_time: conversation.end_time,
        status: conversation.status,
        total_turns,
        total_tokens,
        duration_seconds,
        average_tokens_per_turn: if total_turns > 0 {
            total_tokens as f64 / total_turns as f64
        } else {
            0.0
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HivemindConfig;
    use crate::llm::mock::MockGenerator;
    use crate::storage::{SqliteStorage, Storage};
    use crate::sync::NoopTransport;
    use std::sync::Mutex as StdMutex;

    async fn test_manager() -> ConversationManager {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HivemindConfig::default();
        config.data_dir = Some(dir.path().to_path_buf());
        config.embeddings.dimensions = 2;
        config.brain.device_id = Some("test-device".to_string());
        config.brain.enable_sync = false;
        config.brain.enable_summarizer = false;

        let brain = Arc::new(Brain::with_parts(
            config,
            Storage::new(Arc::new(SqliteStorage::in_memory()), None),
            Arc::new(MockGenerator::new("s")),
            Arc::new(NoopTransport),
        ));
        brain.initialize().await.unwrap();
        ConversationManager::new(brain)
    }

    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ConversationListener for RecordingListener {
        async fn on_event(&self, event: &ConversationEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.name().to_string());
            Ok(())
        }
    }

    struct FailingListener;

    #[async_trait]
    impl ConversationListener for FailingListener {
        async fn on_event(&self, _event: &ConversationEvent) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    #[tokio::test]
    async fn test_conversation_lifecycle() {
        let manager = test_manager().await;

        let session = manager.start_conversation("nano", None).await.unwrap();
        assert!(session.starts_with("nano_"));

        manager
            .add_turn(&session, "u1", "b1", 10, None)
            .await
            .unwrap();
        manager
            .add_turn(&session, "u2", "b2", 20, None)
            .await
            .unwrap();

        let summary = manager
            .get_conversation_summary(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_turns, 2);
        assert_eq!(summary.total_tokens, 30);
        assert_eq!(summary.status, ConversationStatus::Active);
        assert_eq!(summary.average_tokens_per_turn, 15.0);
        assert!(summary.duration_seconds.is_some());

        manager.end_conversation(&session).await.unwrap();

        // Reload from storage: completed with end_time set
        let stored = manager
            .brain
            .load_conversation(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, ConversationStatus::Completed);
        assert!(stored.end_time.is_some());
        assert_eq!(stored.turns.len(), 2);

        // Ending again is a no-op
        manager.end_conversation(&session).await.unwrap();
    }

    #[tokio::test]
    async fn test_history_truncation_and_order() {
        let manager = test_manager().await;
        let session = manager.start_conversation("mini", None).await.unwrap();

        for i in 0..5 {
            manager
                .add_turn(&session, &format!("u{i}"), "b", 1, None)
                .await
                .unwrap();
        }

        let history = manager
            .get_conversation_history(&session, 3)
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].user_message, "u2");
        assert_eq!(history[2].user_message, "u4");
    }

    #[tokio::test]
    async fn test_add_turn_reconstructs_unknown_session() {
        let manager = test_manager().await;

        manager
            .add_turn("nano_deadbeef", "hello", "hi", 5, None)
            .await
            .unwrap();

        let summary = manager
            .get_conversation_summary("nano_deadbeef")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.chatbot_name, "nano");
        assert_eq!(summary.total_turns, 1);

        // No separator: chatbot name falls back to unknown
        manager.add_turn("bareid", "x", "y", 0, None).await.unwrap();
        let summary = manager
            .get_conversation_summary("bareid")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.chatbot_name, "unknown");
    }

    #[tokio::test]
    async fn test_add_turn_loads_persisted_session() {
        let manager = test_manager().await;
        let session = manager.start_conversation("nano", None).await.unwrap();
        manager.add_turn(&session, "u1", "b1", 1, None).await.unwrap();
        manager.end_conversation(&session).await.unwrap();

        // Session is out of memory now; a new turn must load, not reset
        manager.add_turn(&session, "u2", "b2", 1, None).await.unwrap();
        let history = manager
            .get_conversation_history(&session, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_add_turn_no_lost_updates() {
        let manager = Arc::new(test_manager().await);
        let session = manager.start_conversation("nano", None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let manager = manager.clone();
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .add_turn(&session, &format!("u{i}"), "b", 1, None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let history = manager
            .get_conversation_history(&session, 100)
            .await
            .unwrap();
        assert_eq!(history.len(), 10);

        // The persisted copy saw every turn too
        let stored = manager
            .brain
            .load_conversation(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.turns.len(), 10);
    }

    #[tokio::test]
    async fn test_events_dispatched_in_order() {
        let manager = test_manager().await;
        let listener = Arc::new(RecordingListener {
            events: StdMutex::new(Vec::new()),
        });
        manager.add_listener(listener.clone()).await;
        // A failing listener must not block the recording one
        manager.add_listener(Arc::new(FailingListener)).await;

        let session = manager.start_conversation("nano", None).await.unwrap();
        manager.add_turn(&session, "u", "b", 1, None).await.unwrap();
        manager.end_conversation(&session).await.unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["conversation_started", "turn_appended", "conversation_ended"]
        );
    }

    #[tokio::test]
    async fn test_event_payload_shapes() {
        let event = ConversationEvent::TurnAppended {
            session_id: "s".into(),
            turn_id: "t".into(),
            user_message: "u".into(),
            bot_response: "b".into(),
            tokens_used: 7,
            metadata: Metadata::new(),
        };
        let payload = event.payload();
        assert_eq!(payload["session_id"], "s");
        assert_eq!(payload["turn_id"], "t");
        assert_eq!(payload["tokens_used"], 7);

        let started = ConversationEvent::Started {
            session_id: "s".into(),
            chatbot_name: "nano".into(),
            device_id: "d".into(),
        };
        assert_eq!(started.payload()["chatbot_name"], "nano");
        assert_eq!(started.name(), "conversation_started");
    }

    #[tokio::test]
    async fn test_lock_map_evicted_on_end() {
        let manager = test_manager().await;
        let session = manager.start_conversation("nano", None).await.unwrap();
        assert_eq!(manager.locks.lock().await.len(), 1);

        manager.end_conversation(&session).await.unwrap();
        assert!(manager.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_all_merges_active_and_stored() {
        let manager = test_manager().await;

        let ended = manager.start_conversation("nano", None).await.unwrap();
        manager.add_turn(&ended, "u", "b", 1, None).await.unwrap();
        manager.end_conversation(&ended).await.unwrap();

        let live = manager.start_conversation("mini", None).await.unwrap();

        let all = manager.list_all_conversations(10).await.unwrap();
        assert_eq!(all.len(), 2);
        let ids: Vec<&str> = all.iter().map(|s| s.session_id.as_str()).collect();
        assert!(ids.contains(&ended.as_str()));
        assert!(ids.contains(&live.as_str()));

        // De-duplication: the live session appears once even though it is
        // both active and persisted
        assert_eq!(
            ids.iter().filter(|id| **id == live.as_str()).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_export_snapshot_includes_summary() {
        let manager = test_manager().await;
        let session = manager.start_conversation("nano", None).await.unwrap();
        manager.add_turn(&session, "u", "b", 3, None).await.unwrap();

        let snapshot = manager
            .export_conversation_snapshot(&session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot["session_id"], session);
        assert_eq!(snapshot["summary"]["total_tokens"], 3);
        assert!(snapshot["turns"].is_array());

        assert!(
            manager
                .export_conversation_snapshot("missing")
                .await
                .unwrap()
                .is_none()
        );
    }
}
