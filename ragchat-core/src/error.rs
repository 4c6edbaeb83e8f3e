//! Error types for the Ragchat pipeline.
//!
//! Uses `thiserror` for public API error types. Each external capability
//! (chat store, document index, model backend) has its own enum, and every
//! error reports an [`ErrorClass`] so the retry utility and the orchestrator
//! can apply the fatal/non-fatal policy without matching on variants.

use std::time::Duration;

/// Coarse classification shared by every error in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed request or payload. Never retried.
    Validation,
    /// Referenced conversation or collection is absent.
    NotFound,
    /// Network, timeout or service-unavailable. Retryable with backoff.
    Transient,
    /// Internally inconsistent configuration. Never retried.
    Configuration,
    /// A write to the chat store failed.
    Persistence,
}

impl ErrorClass {
    /// Whether an error of this class may be retried.
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Transient
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::NotFound => write!(f, "not-found"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Configuration => write!(f, "configuration"),
            ErrorClass::Persistence => write!(f, "persistence"),
        }
    }
}

/// Classify an HTTP status code.
///
/// 429 and 5xx are transient. 404 is not-found. Every other 4xx, including
/// 400 bad request, is a validation failure and must not be retried.
pub fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::Transient,
        404 => ErrorClass::NotFound,
        s if s >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Validation,
    }
}

/// Errors from the chat store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Conversation not found: {conversation_id}")]
    NotFound { conversation_id: String },

    #[error("Chat store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Chat store call timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("Chat store returned a malformed payload: {reason}")]
    Malformed { reason: String },

    #[error("Chat store rejected the write: {message}")]
    Rejected { message: String },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. } => ErrorClass::NotFound,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. } => ErrorClass::Transient,
            StoreError::Malformed { .. } => ErrorClass::Validation,
            StoreError::Rejected { .. } => ErrorClass::Persistence,
        }
    }
}

/// Errors from the document index.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("No document collection for conversation {conversation_id}")]
    CollectionNotFound { conversation_id: String },

    #[error("Document index unavailable: {message}")]
    Unavailable { message: String },

    #[error("Document index call timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("Document index returned a malformed payload: {reason}")]
    Malformed { reason: String },
}

impl IndexError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IndexError::CollectionNotFound { .. } => ErrorClass::NotFound,
            IndexError::Unavailable { .. } | IndexError::Timeout { .. } => ErrorClass::Transient,
            IndexError::Malformed { .. } => ErrorClass::Validation,
        }
    }
}

/// Errors from the model backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Model backend connection failed: {message}")]
    Connection { message: String },

    #[error("Model backend timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("Model backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Model backend returned a malformed payload: {reason}")]
    Malformed { reason: String },
}

impl BackendError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BackendError::Connection { .. } | BackendError::Timeout { .. } => {
                ErrorClass::Transient
            }
            BackendError::Http { status, .. } => classify_http_status(*status),
            BackendError::Streaming { .. } | BackendError::Malformed { .. } => {
                ErrorClass::Validation
            }
        }
    }
}

/// Errors from prompt assembly.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PromptError {
    #[error("Template '{template}' requires placeholder '{placeholder}' but no value was supplied")]
    MissingPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("Prompt template not registered: {name}")]
    UnknownTemplate { name: String },
}

/// Errors from the configuration system.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "Inconsistent token limits: reserved ({reserved}) + max_response ({max_response}) exceeds max_context ({max_context})"
    )]
    InconsistentLimits {
        reserved: usize,
        max_response: usize,
        max_context: usize,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Fatal errors that end a generation request.
///
/// Non-fatal conditions (document retrieval or persistence failures) never
/// appear here; they are reported as warnings on the outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    #[error("Conversation history unavailable: {0}")]
    History(StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Prompt assembly failed: {0}")]
    Prompt(#[from] PromptError),

    #[error("Generation failed: {0}")]
    Backend(#[from] BackendError),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Validation { .. } | PipelineError::Prompt(_) => ErrorClass::Validation,
            PipelineError::History(e) => e.class(),
            PipelineError::Config(_) => ErrorClass::Configuration,
            PipelineError::Backend(e) => e.class(),
        }
    }
}

/// A type alias for results using the top-level `PipelineError`.
pub type Result<T> = std::result::Result<T, PipelineError>;
