//! History persistence.
//!
//! Writes the user and assistant turns of a finished generation back to the
//! chat store. Each write is attempted exactly once and independently of the
//! other; the outcome says which halves landed so a caller can retry only
//! the failed one.

use crate::adapt::{ParseResult, parse_append_receipt};
use crate::error::StoreError;
use crate::retry::with_timeout;
use crate::store::ChatStore;
use crate::types::ConversationMessage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a single append.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteStatus {
    /// The store accepted the message. `message_id` is the id it reported.
    Saved { message_id: Option<Uuid> },
    /// No write was attempted.
    Skipped,
    Failed { reason: String },
}

impl WriteStatus {
    pub fn is_saved(&self) -> bool {
        matches!(self, WriteStatus::Saved { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, WriteStatus::Failed { .. })
    }
}

/// Which halves of a turn were written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceOutcome {
    pub user_message: WriteStatus,
    pub assistant_message: WriteStatus,
}

impl PersistenceOutcome {
    /// Nothing was written, by choice.
    pub fn skipped() -> Self {
        Self {
            user_message: WriteStatus::Skipped,
            assistant_message: WriteStatus::Skipped,
        }
    }

    pub fn user_message_saved(&self) -> bool {
        self.user_message.is_saved()
    }

    pub fn assistant_message_saved(&self) -> bool {
        self.assistant_message.is_saved()
    }

    /// True if either write failed.
    pub fn has_failures(&self) -> bool {
        self.user_message.is_failed() || self.assistant_message.is_failed()
    }
}

pub struct HistoryPersistence {
    store: Arc<dyn ChatStore>,
    timeout: Option<Duration>,
}

impl HistoryPersistence {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Persist a turn. Pass `None` for `user_message` when it was already
    /// saved elsewhere. The user message is written first.
    pub async fn save(
        &self,
        conversation_id: &str,
        user_message: Option<&ConversationMessage>,
        assistant_message: &ConversationMessage,
    ) -> PersistenceOutcome {
        let user_status = match user_message {
            Some(message) => self.write(conversation_id, message).await,
            None => WriteStatus::Skipped,
        };
        let assistant_status = self.write(conversation_id, assistant_message).await;

        debug!(
            conversation_id,
            user_saved = user_status.is_saved(),
            assistant_saved = assistant_status.is_saved(),
            "Persisted conversation turn"
        );
        PersistenceOutcome {
            user_message: user_status,
            assistant_message: assistant_status,
        }
    }

    async fn write(&self, conversation_id: &str, message: &ConversationMessage) -> WriteStatus {
        if message.content.trim().is_empty() {
            return WriteStatus::Skipped;
        }
        let result = with_timeout(
            self.timeout,
            self.store.append_message(
                conversation_id,
                message.role,
                &message.content,
                message.model_info.as_ref(),
            ),
            |timeout| StoreError::Timeout { timeout },
        )
        .await;

        let status = match result {
            Ok(reply) => match parse_append_receipt(&reply) {
                ParseResult::Parsed(receipt) if receipt.success => WriteStatus::Saved {
                    message_id: receipt.saved_message.map(|m| m.id),
                },
                ParseResult::Parsed(_) => WriteStatus::Failed {
                    reason: "chat store reported an unsuccessful append".into(),
                },
                ParseResult::Malformed { reason } => WriteStatus::Failed {
                    reason: format!("unreadable append reply: {reason}"),
                },
            },
            Err(e) => WriteStatus::Failed {
                reason: e.to_string(),
            },
        };

        if let WriteStatus::Failed { reason } = &status {
            warn!(
                conversation_id,
                role = %message.role,
                reason = %reason,
                "Failed to persist message"
            );
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChatStore;
    use crate::types::{ModelInfo, Role};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    fn model() -> ModelInfo {
        ModelInfo {
            name: "llama3.2".into(),
            version: None,
            provider: "ollama".into(),
        }
    }

    #[tokio::test]
    async fn test_saves_user_then_assistant() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        let persistence = HistoryPersistence::new(store.clone());

        let user = ConversationMessage::user("Hello");
        let assistant = ConversationMessage::assistant("Hi there").with_model_info(model());
        let outcome = persistence.save("c1", Some(&user), &assistant).await;

        assert!(outcome.user_message_saved());
        assert!(outcome.assistant_message_saved());
        assert_eq!(
            store.append_calls(),
            vec![("c1".to_string(), Role::User), ("c1".to_string(), Role::Assistant)]
        );
        let stored = store.stored_messages("c1");
        assert_eq!(stored[1]["modelInfo"]["name"], "llama3.2");
    }

    #[tokio::test]
    async fn test_user_failure_does_not_block_assistant() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        store.fail_appends(
            Role::User,
            StoreError::Unavailable {
                message: "down".into(),
            },
        );
        let persistence = HistoryPersistence::new(store.clone());

        let outcome = persistence
            .save(
                "c1",
                Some(&ConversationMessage::user("Hello")),
                &ConversationMessage::assistant("Hi"),
            )
            .await;
        assert!(outcome.user_message.is_failed());
        assert!(outcome.assistant_message_saved());
        assert!(outcome.has_failures());
    }

    #[tokio::test]
    async fn test_assistant_only_when_user_already_saved() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        let persistence = HistoryPersistence::new(store.clone());

        let outcome = persistence
            .save("c1", None, &ConversationMessage::assistant("Hi"))
            .await;
        assert_eq!(outcome.user_message, WriteStatus::Skipped);
        assert!(outcome.assistant_message_saved());
        assert_eq!(store.append_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_message_is_skipped() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        let persistence = HistoryPersistence::new(store.clone());

        let outcome = persistence
            .save("c1", None, &ConversationMessage::assistant("  "))
            .await;
        assert_eq!(outcome.assistant_message, WriteStatus::Skipped);
        assert!(store.append_calls().is_empty());
    }

    struct RefusingStore;

    #[async_trait]
    impl ChatStore for RefusingStore {
        async fn get_conversation(&self, _: &str) -> Result<Value, StoreError> {
            Ok(json!({ "messages": [] }))
        }

        async fn append_message(
            &self,
            _: &str,
            _: Role,
            _: &str,
            _: Option<&ModelInfo>,
        ) -> Result<Value, StoreError> {
            Ok(json!({ "success": false }))
        }
    }

    #[tokio::test]
    async fn test_unsuccessful_receipt_is_failure() {
        let persistence = HistoryPersistence::new(Arc::new(RefusingStore));
        let outcome = persistence
            .save("c1", None, &ConversationMessage::assistant("Hi"))
            .await;
        assert!(matches!(
            outcome.assistant_message,
            WriteStatus::Failed { .. }
        ));
    }
}
