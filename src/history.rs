//! Conversation history persistence.
//!
//! The real backend is an external record store keyed by user identity;
//! this module only defines the seam, an in-memory implementation and the
//! timeout policy for lookups.  A lookup that times out or fails is
//! reported as "not found" so the chat keeps working without history.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::chat::ChatTurn;

pub const TITLE_CHARS: usize = 50;
pub const PREVIEW_CHARS: usize = 100;
pub const SESSION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECORD_LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub last_message_preview: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Backend(String),
    #[error("conversation {0} not found")]
    NotFound(String),
}

fn truncate_with_ellipsis(text: &str, limit: usize) -> String {
    let mut out: String = text.chars().take(limit).collect();
    if text.chars().nth(limit).is_some() {
        out.push_str("...");
    }
    out
}

/// Title shown in the conversation list: the first message cut to
/// `TITLE_CHARS` characters.
pub fn conversation_title(first_message: &str) -> String {
    truncate_with_ellipsis(first_message, TITLE_CHARS)
}

/// Preview of the latest turn, cut to `PREVIEW_CHARS` characters.
pub fn message_preview(content: &str) -> String {
    truncate_with_ellipsis(content, PREVIEW_CHARS)
}

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, HistoryError>;
    async fn create_conversation(
        &self,
        user_id: &str,
        first_message: &str,
    ) -> Result<Conversation, HistoryError>;
    async fn load_turns(&self, conversation_id: &str) -> Result<Vec<ChatTurn>, HistoryError>;
    async fn append_turn(&self, conversation_id: &str, turn: &ChatTurn) -> Result<(), HistoryError>;
    /// Remove a conversation with its turns.  Unknown ids are not an error.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), HistoryError>;
}

/// Race `fut` against `limit`.  Timeout and backend failure both come
/// back as `None`.
pub async fn lookup_with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Option<T>
where
    F: Future<Output = Result<T, HistoryError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Some(v),
        Ok(Err(err)) => {
            tracing::warn!(lookup = what, error = %err, "history lookup failed");
            None
        }
        Err(_) => {
            tracing::warn!(lookup = what, timeout_ms = limit.as_millis() as u64, "history lookup timed out");
            None
        }
    }
}

/// Key under which conversations are stored: the signed-in user from
/// `session` when it answers within `SESSION_LOOKUP_TIMEOUT`, otherwise
/// the caller's anonymous id.
pub async fn resolve_user_id<F>(session: F, anonymous_id: &str) -> String
where
    F: Future<Output = Result<Option<String>, HistoryError>>,
{
    match lookup_with_timeout("session", SESSION_LOOKUP_TIMEOUT, session).await {
        Some(Some(user_id)) if !user_id.is_empty() => user_id,
        _ => anonymous_id.to_string(),
    }
}

#[derive(Default)]
pub struct InMemoryHistoryStore {
    conversations: DashMap<String, Conversation>,
    turns: DashMap<String, Vec<ChatTurn>>,
    next_id: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, HistoryError> {
        let mut out: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.value().clone())
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn create_conversation(
        &self,
        user_id: &str,
        first_message: &str,
    ) -> Result<Conversation, HistoryError> {
        let id = format!("conv-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let title = conversation_title(first_message);
        let now = Utc::now();
        let conv = Conversation {
            id: id.clone(),
            user_id: user_id.to_string(),
            title: title.clone(),
            last_message_preview: title,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(id.clone(), conv.clone());
        self.turns.insert(id, Vec::new());
        Ok(conv)
    }

    async fn load_turns(&self, conversation_id: &str) -> Result<Vec<ChatTurn>, HistoryError> {
        self.turns
            .get(conversation_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))
    }

    async fn append_turn(&self, conversation_id: &str, turn: &ChatTurn) -> Result<(), HistoryError> {
        let mut entry = self
            .turns
            .get_mut(conversation_id)
            .ok_or_else(|| HistoryError::NotFound(conversation_id.to_string()))?;
        entry.push(turn.clone());
        drop(entry);
        if let Some(mut conv) = self.conversations.get_mut(conversation_id) {
            conv.updated_at = Utc::now();
            conv.last_message_preview = message_preview(&turn.content);
        }
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), HistoryError> {
        self.conversations.remove(conversation_id);
        self.turns.remove(conversation_id);
        Ok(())
    }
}
