//! # Ragchat Core
//!
//! Retrieval-augmented chat generation pipeline.
//! Loads conversation history and document context, fits them to a token
//! budget, assembles the prompt, streams the model's answer and writes the
//! new turn back to the chat store.

pub mod adapt;
pub mod backend;
pub mod budget;
pub mod cache;
pub mod config;
pub mod documents;
pub mod error;
pub mod history;
pub mod index;
pub mod orchestrator;
pub mod persistence;
pub mod prompt;
pub mod retry;
pub mod store;
pub mod stream;
pub mod tokens;
pub mod types;
pub mod validator;

// Re-export commonly used types at the crate root.
pub use backend::{
    BackendRequest, MockModelBackend, ModelBackend, OllamaBackend, ScriptStep, StreamEvent,
};
pub use budget::{BudgetOutcome, BudgetReport, BudgetSettings, ContextBudgetManager};
pub use cache::{CachingDocumentIndex, Clock, ManualClock, SystemClock, TtlCache};
pub use config::{PipelineConfig, load_config};
pub use documents::{DocumentContext, DocumentContextLoader};
pub use error::{
    BackendError, ConfigError, ErrorClass, IndexError, PipelineError, PromptError, Result,
    StoreError,
};
pub use history::{HistoryContextLoader, HistoryDefaults};
pub use index::{DocumentIndex, InMemoryDocumentIndex};
pub use orchestrator::{
    ChatOrchestrator, ChatOrchestratorBuilder, FinishReason, GenerationOutcome, PipelineWarning,
};
pub use persistence::{HistoryPersistence, PersistenceOutcome, WriteStatus};
pub use prompt::{AssembledPrompt, PromptAssembler, PromptTemplate, PromptTemplates};
pub use retry::RetryPolicy;
pub use store::{ChatStore, InMemoryChatStore, JsonFileChatStore};
pub use stream::StreamAccumulator;
pub use tokens::{HeuristicEstimator, TiktokenEstimator, TokenEstimator};
pub use types::{
    BackendConfig, ConversationContext, ConversationMessage, DocumentContextResult,
    DocumentQueryConfig, DocumentSource, GenerationEvent, GenerationRequest, GenerationSettings,
    ModelInfo, ProviderTokenLimits, Role, UserText,
};
pub use validator::{ValidationOutcome, validate};
