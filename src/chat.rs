//! Conversation driver used by clients of the proxy.
//!
//! A session is a flat, append-only log of turns seeded with a fixed
//! greeting.  One exchange is: ask the model, run any requested tools
//! concurrently, ask the model again with the tool results, append the
//! answer.  `clear()` invalidates every exchange still in flight; their
//! results are dropped instead of being appended.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::AppError;
use crate::gemini::{AiAdapter, Content, FunctionCall, Part};
use crate::history::{lookup_with_timeout, HistoryStore, RECORD_LOOKUP_TIMEOUT};
use crate::tools::{ToolDispatcher, ToolResult};
use crate::validation::{utf16_len, MAX_MESSAGE_CHARS};

pub const GREETING: &str = "Assalamu'alaikum Warahmatullahi Wabarakatuh. Welcome to **Sahabat Quran**.\n\n\
I am your companion for exploring the words of Allah. What would you like to learn today?\n\n\
*Examples: \"Verses about inner peace\", \"The story of Prophet Musa\", or \"Show Surah Al-Fatihah\"*";

/// Sent after tool results so the model writes the final answer.
pub const FOLLOW_UP_INSTRUCTION: &str = "Please give a complete answer. Use a --- separator line \
between verses. Write the Arabic text only, without HTML tags.";

pub const TOOL_FALLBACK_TEXT: &str = "Results processed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::Function => "function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ChatTurn {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        ChatTurn {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    fn to_content(&self) -> Content {
        Content {
            role: self.role.as_str().to_string(),
            parts: vec![Part::text(self.content.clone())],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("message exceeds 2000 characters")]
    MessageTooLong,
    #[error("exchange superseded by a newer clear")]
    Superseded,
    #[error(transparent)]
    Ai(#[from] AppError),
}

struct Persistence {
    store: Arc<dyn HistoryStore>,
    conversation_id: String,
}

pub struct ChatSession {
    ai: AiAdapter,
    tools: ToolDispatcher,
    turns: Mutex<Vec<ChatTurn>>,
    generation: AtomicU64,
    persistence: Option<Persistence>,
}

impl ChatSession {
    pub fn new(ai: AiAdapter, tools: ToolDispatcher) -> Self {
        Self {
            ai,
            tools,
            turns: Mutex::new(vec![ChatTurn::text(Role::Model, GREETING)]),
            generation: AtomicU64::new(0),
            persistence: None,
        }
    }

    /// Mirror every appended turn into `store` under `conversation_id`.
    pub fn with_history(mut self, store: Arc<dyn HistoryStore>, conversation_id: &str) -> Self {
        self.persistence = Some(Persistence {
            store,
            conversation_id: conversation_id.to_string(),
        });
        self
    }

    fn lock_turns(&self) -> MutexGuard<'_, Vec<ChatTurn>> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.lock_turns().clone()
    }

    /// Drop every turn except the greeting and invalidate exchanges in
    /// flight.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut turns = self.lock_turns();
        turns.clear();
        turns.push(ChatTurn::text(Role::Model, GREETING));
    }

    /// Replace the log with the stored conversation.  A slow or failing
    /// store leaves the session untouched and returns false.
    pub async fn restore(&self) -> bool {
        let Some(p) = &self.persistence else {
            return false;
        };
        let generation = self.generation.load(Ordering::SeqCst);
        let loaded = lookup_with_timeout(
            "load_turns",
            RECORD_LOOKUP_TIMEOUT,
            p.store.load_turns(&p.conversation_id),
        )
        .await;
        match loaded {
            Some(stored) if self.is_current(generation) => {
                let mut turns = self.lock_turns();
                turns.truncate(1);
                turns.extend(stored);
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Conversation as sent upstream: everything except the greeting.
    fn upstream_history(turns: &[ChatTurn]) -> Vec<Content> {
        turns
            .iter()
            .enumerate()
            .filter(|(idx, t)| !(*idx == 0 && t.role == Role::Model))
            .map(|(_, t)| t.to_content())
            .collect()
    }

    async fn persist(&self, turn: &ChatTurn) {
        if let Some(p) = &self.persistence {
            if let Err(err) = p.store.append_turn(&p.conversation_id, turn).await {
                tracing::warn!(conversation = %p.conversation_id, error = %err, "failed to persist turn");
            }
        }
    }

    fn append_if_current(&self, generation: u64, turn: &ChatTurn) -> Result<(), ChatError> {
        let mut turns = self.lock_turns();
        // Checked under the lock so a concurrent clear cannot interleave.
        if !self.is_current(generation) {
            return Err(ChatError::Superseded);
        }
        turns.push(turn.clone());
        Ok(())
    }

    /// Run one exchange and return the model turn that was appended.
    pub async fn send(&self, message: &str) -> Result<ChatTurn, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if utf16_len(message) > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let user_turn = ChatTurn::text(Role::User, message);
        let history = {
            let mut turns = self.lock_turns();
            let history = Self::upstream_history(&turns);
            turns.push(user_turn.clone());
            history
        };
        self.persist(&user_turn).await;

        let outcome = self.exchange(generation, history, message).await;
        if !self.is_current(generation) {
            return Err(ChatError::Superseded);
        }
        let reply = match outcome {
            Ok(turn) => turn,
            Err(ChatError::Ai(err)) => {
                err.log(json!({"method": "chat", "messageLength": utf16_len(message)}));
                let turn = ChatTurn::text(Role::Model, err.user_message());
                self.append_if_current(generation, &turn)?;
                self.persist(&turn).await;
                return Err(ChatError::Ai(err));
            }
            Err(other) => return Err(other),
        };
        self.append_if_current(generation, &reply)?;
        self.persist(&reply).await;
        Ok(reply)
    }

    async fn exchange(
        &self,
        generation: u64,
        history: Vec<Content>,
        message: &str,
    ) -> Result<ChatTurn, ChatError> {
        let mut contents = history.clone();
        contents.push(Content::user_text(message));
        let first = self.ai.chat(&contents).await?;
        if !self.is_current(generation) {
            return Err(ChatError::Superseded);
        }
        if first.tool_calls.is_empty() {
            return Ok(ChatTurn::text(Role::Model, first.text));
        }

        let results = self.tools.execute_batch(&first.tool_calls).await;
        if !self.is_current(generation) {
            return Err(ChatError::Superseded);
        }

        let mut follow_up = contents;
        follow_up.push(Content {
            role: Role::Model.as_str().into(),
            parts: first.tool_calls.iter().cloned().map(Part::call).collect(),
        });
        follow_up.push(Content {
            role: Role::Function.as_str().into(),
            parts: results
                .iter()
                .map(|r| Part::response(r.name.clone(), json!({"result": r.result})))
                .collect(),
        });
        follow_up.push(Content::user_text(FOLLOW_UP_INSTRUCTION));
        let second = self.ai.chat(&follow_up).await?;

        let text = if second.text.trim().is_empty() {
            TOOL_FALLBACK_TEXT.to_string()
        } else {
            second.text
        };
        Ok(ChatTurn {
            role: Role::Model,
            content: text,
            tool_calls: first.tool_calls,
            tool_results: results,
        })
    }
}
