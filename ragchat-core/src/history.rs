//! History context loading.
//!
//! Fetches a conversation transcript from the chat store and adapts it into
//! a [`ConversationContext`]. Stored overrides replace the configured
//! defaults field by field.

use crate::adapt::{ParseResult, parse_conversation};
use crate::error::StoreError;
use crate::retry::{RetryPolicy, retry_with_backoff, with_timeout};
use crate::store::ChatStore;
use crate::types::{ConversationContext, GenerationSettings};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// System prompt used when a conversation does not set its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the context of prior \
messages in this conversation to give accurate, relevant answers.";

/// Values applied to a conversation that carries no overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryDefaults {
    pub default_system_prompt: String,
    pub max_context_messages: usize,
    pub temperature: f32,
    pub max_response_tokens: usize,
}

impl Default for HistoryDefaults {
    fn default() -> Self {
        Self {
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_context_messages: 100,
            temperature: 0.7,
            max_response_tokens: 1024,
        }
    }
}

impl HistoryDefaults {
    fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            temperature: self.temperature,
            max_response_tokens: self.max_response_tokens,
            ..GenerationSettings::default()
        }
    }
}

/// Loads conversation history from a [`ChatStore`].
pub struct HistoryContextLoader {
    store: Arc<dyn ChatStore>,
    defaults: HistoryDefaults,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl HistoryContextLoader {
    pub fn new(store: Arc<dyn ChatStore>, defaults: HistoryDefaults) -> Self {
        Self {
            store,
            defaults,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn load(&self, conversation_id: &str) -> Result<ConversationContext, StoreError> {
        let raw = retry_with_backoff(&self.retry, "history_fetch", |_| {
            with_timeout(
                self.timeout,
                self.store.get_conversation(conversation_id),
                |timeout| StoreError::Timeout { timeout },
            )
        })
        .await?;

        let mut stored = match parse_conversation(&raw) {
            ParseResult::Parsed(stored) => stored,
            ParseResult::Malformed { reason } => return Err(StoreError::Malformed { reason }),
        };

        let mut messages = std::mem::take(&mut stored.messages);
        // Stable: equal timestamps keep stored order.
        messages.sort_by_key(|m| m.timestamp);

        let context = ConversationContext {
            messages,
            max_context_messages: stored
                .max_context_messages
                .unwrap_or(self.defaults.max_context_messages),
            system_prompt: stored
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.defaults.default_system_prompt.clone()),
            generation_settings: stored.settings_over(&self.defaults.generation_settings()),
        };
        debug!(
            conversation_id,
            messages = context.messages.len(),
            "Loaded conversation history"
        );
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChatStore;
    use crate::types::{ConversationMessage, Role};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_defaults_for_plain_conversation() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        let loader = HistoryContextLoader::new(store, HistoryDefaults::default());
        let ctx = loader.load("c1").await.unwrap();
        assert!(ctx.messages.is_empty());
        assert_eq!(ctx.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(ctx.max_context_messages, 100);
        assert_eq!(ctx.generation_settings.max_response_tokens, 1024);
    }

    #[tokio::test]
    async fn test_stored_overrides_win() {
        let store = Arc::new(InMemoryChatStore::new());
        store.insert_raw(
            "c1",
            json!({
                "messages": [],
                "systemPrompt": "Answer in French.",
                "generationSettings": {"temperature": 0.2},
                "maxContextMessages": 12
            }),
        );
        let loader = HistoryContextLoader::new(store, HistoryDefaults::default());
        let ctx = loader.load("c1").await.unwrap();
        assert_eq!(ctx.system_prompt, "Answer in French.");
        assert_eq!(ctx.generation_settings.temperature, 0.2);
        assert_eq!(ctx.generation_settings.max_response_tokens, 1024);
        assert_eq!(ctx.max_context_messages, 12);
    }

    #[tokio::test]
    async fn test_messages_sorted_with_stable_ties() {
        let now = Utc::now();
        let earlier = now - ChronoDuration::seconds(10);
        let store = Arc::new(InMemoryChatStore::new());
        store.insert_messages(
            "c1",
            &[
                ConversationMessage::user("second").with_timestamp(now),
                ConversationMessage::assistant("third").with_timestamp(now),
                ConversationMessage::user("first").with_timestamp(earlier),
            ],
        );
        let loader = HistoryContextLoader::new(store, HistoryDefaults::default());
        let ctx = loader.load("c1").await.unwrap();
        let contents: Vec<_> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(ctx.messages[2].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_missing_conversation_is_not_retried() {
        let store = Arc::new(InMemoryChatStore::new());
        let loader = HistoryContextLoader::new(store.clone(), HistoryDefaults::default())
            .with_retry(fast_retry());
        let err = loader.load("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        store.fail_next_fetch(StoreError::Unavailable {
            message: "restarting".into(),
        });
        let loader = HistoryContextLoader::new(store.clone(), HistoryDefaults::default())
            .with_retry(fast_retry());
        assert!(loader.load("c1").await.is_ok());
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_transcript() {
        let store = Arc::new(InMemoryChatStore::new());
        store.insert_raw("c1", json!({"messages": [{"role": "robot", "content": "x"}]}));
        let loader = HistoryContextLoader::new(store, HistoryDefaults::default());
        let err = loader.load("c1").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
