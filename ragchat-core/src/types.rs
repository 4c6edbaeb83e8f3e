//! Core type definitions for the chat pipeline.
//!
//! Defines the data model shared by every stage: conversation messages,
//! the bounded conversation context, provider token limits, document
//! retrieval results and the generation request itself.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Represents a participant role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Parse a role name, ignoring ASCII case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// Label used when a transcript is rendered into prompt text.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// The model that produced an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub provider: String,
}

/// A single turn in a conversation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConversationMessage {
    /// Create a new message with auto-generated ID and current timestamp.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            model_info: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Attach model information (assistant messages only).
    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        if self.role == Role::Assistant {
            self.model_info = Some(info);
        }
        self
    }

    /// Override the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add metadata to this message.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether this message was synthesized by the budget manager.
    pub fn is_synthetic(&self) -> bool {
        self.metadata
            .get(SYNTHETIC_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Metadata key marking a message that stands in for summarized turns.
pub const SYNTHETIC_KEY: &str = "synthetic";

/// Sampling settings applied to every request for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_response_tokens: usize,
    /// Backend-specific parameters passed through untouched.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_response_tokens: 1024,
            extra: HashMap::new(),
        }
    }
}

/// The bounded view of a conversation used to build a prompt.
///
/// Stages never mutate a context in place; they build a new one with
/// [`ConversationContext::with_messages`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    /// Ordered oldest first.
    pub messages: Vec<ConversationMessage>,
    pub max_context_messages: usize,
    pub system_prompt: String,
    pub generation_settings: GenerationSettings,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            max_context_messages: 100,
            system_prompt: system_prompt.into(),
            generation_settings: GenerationSettings::default(),
        }
    }

    /// A copy of this context carrying a different message list.
    pub fn with_messages(&self, messages: Vec<ConversationMessage>) -> Self {
        Self {
            messages,
            max_context_messages: self.max_context_messages,
            system_prompt: self.system_prompt.clone(),
            generation_settings: self.generation_settings.clone(),
        }
    }
}

/// Per-backend token ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTokenLimits {
    pub max_context_tokens: usize,
    pub max_response_tokens: usize,
    /// Held back for system and formatting overhead.
    pub reserved_tokens: usize,
    /// Hard cap on message count, independent of token count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<usize>,
}

impl Default for ProviderTokenLimits {
    fn default() -> Self {
        Self {
            max_context_tokens: 8192,
            max_response_tokens: 1024,
            reserved_tokens: 256,
            max_messages: None,
        }
    }
}

impl ProviderTokenLimits {
    /// Check `reserved + max_response <= max_context`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let needed = self
            .reserved_tokens
            .checked_add(self.max_response_tokens)
            .unwrap_or(usize::MAX);
        if needed > self.max_context_tokens {
            return Err(ConfigError::InconsistentLimits {
                reserved: self.reserved_tokens,
                max_response: self.max_response_tokens,
                max_context: self.max_context_tokens,
            });
        }
        Ok(())
    }

    /// Limits for the history alone once the response, the reserve and
    /// `other_input_tokens` (documents, the new turn) are set aside.
    pub fn history_allowance(&self, other_input_tokens: usize) -> Self {
        let available = self
            .max_context_tokens
            .saturating_sub(self.reserved_tokens)
            .saturating_sub(self.max_response_tokens)
            .saturating_sub(other_input_tokens);
        Self {
            max_context_tokens: available,
            max_response_tokens: 0,
            reserved_tokens: 0,
            max_messages: self.max_messages,
        }
    }
}

/// One retrieved document excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSource {
    pub content: String,
    pub relevance_score: f32,
}

/// Result of a document-index query, ordered by descending relevance.
/// Lives for a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentContextResult {
    pub sources: Vec<DocumentSource>,
    /// Aggregate score in `[0, 1]`.
    pub confidence: f32,
}

/// Collection statistics reported by the document index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub size_bytes: u64,
    pub point_count: u64,
}

impl CollectionStats {
    pub fn is_empty(&self) -> bool {
        self.point_count == 0 || self.size_bytes == 0
    }
}

/// User text as received: a single string or ordered fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserText {
    Text(String),
    Fragments(Vec<String>),
}

impl UserText {
    /// Whether at least one non-blank piece of text is present.
    pub fn has_content(&self) -> bool {
        match self {
            UserText::Text(text) => !text.trim().is_empty(),
            UserText::Fragments(parts) => parts.iter().any(|p| !p.trim().is_empty()),
        }
    }

    /// The text sent to the model, with blank fragments skipped.
    pub fn joined(&self) -> String {
        match self {
            UserText::Text(text) => text.trim().to_string(),
            UserText::Fragments(parts) => parts
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for UserText {
    fn from(value: &str) -> Self {
        UserText::Text(value.to_string())
    }
}

impl From<String> for UserText {
    fn from(value: String) -> Self {
        UserText::Text(value)
    }
}

/// Which model backend to call and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub endpoint: String,
}

/// Retrieval parameters for the document index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQueryConfig {
    /// Signed so that negative wire values reach validation.
    pub top_k: i64,
    pub similarity_threshold: f32,
}

impl Default for DocumentQueryConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            similarity_threshold: 0.3,
        }
    }
}

/// The orchestrator's unit of work.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub user_text: UserText,
    pub backend_config: BackendConfig,
    pub document_query_config: DocumentQueryConfig,
    pub persist_history: bool,
    pub cancellation_token: CancellationToken,
}

impl GenerationRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        user_text: impl Into<UserText>,
        backend_config: BackendConfig,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_text: user_text.into(),
            backend_config,
            document_query_config: DocumentQueryConfig::default(),
            persist_history: true,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_document_query(mut self, config: DocumentQueryConfig) -> Self {
        self.document_query_config = config;
        self
    }

    pub fn with_persist_history(mut self, persist: bool) -> Self {
        self.persist_history = persist;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }
}

/// Events delivered to the caller while a request runs.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A chunk of model output, in backend order.
    Partial(String),
    /// The final (possibly partial) assistant text.
    Complete(String),
    /// A fatal failure; no `Complete` follows.
    Error(String),
}
