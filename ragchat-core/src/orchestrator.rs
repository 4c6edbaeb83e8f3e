//! Chat generation orchestrator.
//!
//! Runs one generation request end to end:
//! validate -> load history -> load documents -> enforce budget ->
//! assemble prompt -> stream from the model -> persist.
//!
//! Validation, history, configuration and prompt failures are fatal and
//! come back as [`PipelineError`]. Document retrieval and persistence
//! failures never block an answer; they are collected as
//! [`PipelineWarning`]s on the [`GenerationOutcome`].

use crate::backend::{BackendRequest, ModelBackend};
use crate::budget::{BudgetReport, ContextBudgetManager};
use crate::cache::CachingDocumentIndex;
use crate::config::PipelineConfig;
use crate::documents::{DocumentContext, DocumentContextLoader};
use crate::error::{BackendError, ConfigError, PipelineError, Result};
use crate::history::HistoryContextLoader;
use crate::index::DocumentIndex;
use crate::persistence::{HistoryPersistence, PersistenceOutcome, WriteStatus};
use crate::prompt::{PromptAssembler, PromptTemplates, PromptWarning};
use crate::store::ChatStore;
use crate::stream::{StreamAccumulator, StreamEnd, consume_stream};
use crate::tokens::{HeuristicEstimator, MESSAGE_OVERHEAD_TOKENS, TokenEstimator};
use crate::types::{ConversationMessage, GenerationEvent, GenerationRequest, Role};
use crate::validator::{ValidationOutcome, validate};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffered chunks between a backend and the accumulator.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// How the model's answer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    /// The caller cancelled; the text is whatever arrived first.
    Cancelled,
    /// The backend failed after producing some output.
    Interrupted,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::Completed => write!(f, "completed"),
            FinishReason::Cancelled => write!(f, "cancelled"),
            FinishReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A non-fatal condition reported alongside a successful generation.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineWarning {
    /// Retrieval failed; the answer was generated without documents.
    DocumentContextUnavailable { reason: String },
    /// Older history was condensed to fit the token budget.
    HistorySummarized { summarized: usize, dropped: usize },
    /// History still exceeds its allowance after summarizing.
    ContextOverBudget { estimated: usize, allowance: usize },
    PromptTemplate(PromptWarning),
    /// The model stopped mid-answer; the text is partial.
    ResponseInterrupted { reason: String },
    PersistenceFailed { role: Role, reason: String },
    /// Nothing was generated, so no assistant message was saved.
    EmptyResponseNotPersisted,
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::DocumentContextUnavailable { reason } => {
                write!(f, "document context unavailable: {reason}")
            }
            PipelineWarning::HistorySummarized {
                summarized,
                dropped,
            } => write!(
                f,
                "history summarized ({summarized} messages condensed, {dropped} dropped)"
            ),
            PipelineWarning::ContextOverBudget {
                estimated,
                allowance,
            } => write!(
                f,
                "history uses {estimated} tokens, over its allowance of {allowance}"
            ),
            PipelineWarning::PromptTemplate(warning) => write!(f, "prompt template: {warning}"),
            PipelineWarning::ResponseInterrupted { reason } => {
                write!(f, "response interrupted: {reason}")
            }
            PipelineWarning::PersistenceFailed { role, reason } => {
                write!(f, "failed to save {role} message: {reason}")
            }
            PipelineWarning::EmptyResponseNotPersisted => {
                write!(f, "empty response was not saved")
            }
        }
    }
}

/// Summary of a settled request.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// The assistant's answer; partial when cancelled or interrupted.
    pub text: String,
    pub finish_reason: FinishReason,
    pub warnings: Vec<PipelineWarning>,
    pub persistence: PersistenceOutcome,
    /// Estimated size of the prompt sent to the model.
    pub prompt_tokens: usize,
    pub budget: BudgetReport,
    pub user_message: ConversationMessage,
    pub assistant_message: ConversationMessage,
}

impl GenerationOutcome {
    pub fn has_warning(&self, predicate: impl Fn(&PipelineWarning) -> bool) -> bool {
        self.warnings.iter().any(predicate)
    }
}

struct StreamedResponse {
    text: String,
    finish_reason: FinishReason,
    interruption: Option<String>,
}

/// Wires the pipeline stages together. Cheap to share behind an `Arc`;
/// requests for different conversations may run concurrently.
pub struct ChatOrchestrator {
    config: PipelineConfig,
    history: HistoryContextLoader,
    documents: DocumentContextLoader,
    budget: ContextBudgetManager,
    assembler: PromptAssembler,
    persistence: HistoryPersistence,
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ChatOrchestrator {
    pub fn builder(
        store: Arc<dyn ChatStore>,
        index: Arc<dyn DocumentIndex>,
    ) -> ChatOrchestratorBuilder {
        ChatOrchestratorBuilder {
            store,
            index,
            config: PipelineConfig::default(),
            estimator: None,
            templates: None,
            backends: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ids of the registered backends, sorted.
    pub fn backend_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Run a request and return its outcome.
    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        self.run_with_events(request, None).await
    }

    /// Run a request, reporting `Partial` chunks as they stream and a final
    /// `Complete` or `Error` event.
    pub async fn run_with_events(
        &self,
        request: GenerationRequest,
        events: Option<mpsc::UnboundedSender<GenerationEvent>>,
    ) -> Result<GenerationOutcome> {
        let result = self.execute(&request, events.as_ref()).await;
        if let Some(events) = &events {
            let event = match &result {
                Ok(outcome) => GenerationEvent::Complete(outcome.text.clone()),
                Err(e) => GenerationEvent::Error(e.to_string()),
            };
            let _ = events.send(event);
        }
        result
    }

    async fn execute(
        &self,
        request: &GenerationRequest,
        events: Option<&mpsc::UnboundedSender<GenerationEvent>>,
    ) -> Result<GenerationOutcome> {
        let conversation_id = request.conversation_id.as_str();

        if let ValidationOutcome::Invalid { reason } = validate(request) {
            warn!(conversation_id, reason = %reason, "Rejected generation request");
            return Err(PipelineError::Validation { reason });
        }
        let backend_id = request.backend_config.id.as_str();
        let backend = self.backends.get(backend_id).cloned().ok_or_else(|| {
            PipelineError::Validation {
                reason: format!("unknown backend '{backend_id}'"),
            }
        })?;
        let limits = self.config.limits.for_backend(backend_id);
        limits.validate()?;

        let user_text = request.user_text.joined();
        let mut warnings = Vec::new();
        debug!(conversation_id, backend = backend_id, "Starting generation");

        let context = self
            .history
            .load(conversation_id)
            .await
            .map_err(PipelineError::History)?;

        let documents = match self
            .documents
            .load(conversation_id, &user_text, &request.document_query_config)
            .await
        {
            Ok(documents) => documents,
            Err(e) => {
                warn!(
                    conversation_id,
                    error = %e,
                    "Document retrieval failed, continuing without documents"
                );
                warnings.push(PipelineWarning::DocumentContextUnavailable {
                    reason: e.to_string(),
                });
                DocumentContext::Empty
            }
        };

        let estimator = self.budget.estimator();
        let other_input = MESSAGE_OVERHEAD_TOKENS
            + estimator.estimate(&user_text)
            + estimator.estimate(documents.block());
        let allowance = limits.history_allowance(other_input);
        let budgeted = self.budget.enforce(&context, &allowance)?;
        let report = budgeted.report;
        if report.changed() {
            info!(
                conversation_id,
                summarized = report.summarized_messages,
                dropped = report.dropped_messages,
                original_tokens = report.original_tokens,
                final_tokens = report.final_tokens,
                "Summarized history to fit the token budget"
            );
            warnings.push(PipelineWarning::HistorySummarized {
                summarized: report.summarized_messages,
                dropped: report.dropped_messages,
            });
        }
        if !report.within_budget {
            warn!(
                conversation_id,
                estimated_tokens = report.final_tokens,
                allowance = allowance.max_context_tokens,
                "History still over budget"
            );
            warnings.push(PipelineWarning::ContextOverBudget {
                estimated: report.final_tokens,
                allowance: allowance.max_context_tokens,
            });
        }

        let prompt = self
            .assembler
            .build(&budgeted.context, &documents, &user_text)?;
        warnings.extend(
            prompt
                .warnings
                .iter()
                .cloned()
                .map(PipelineWarning::PromptTemplate),
        );
        let prompt_tokens = estimator.estimate(&prompt.text);

        let settings = &budgeted.context.generation_settings;
        let backend_request = BackendRequest {
            endpoint: request.backend_config.endpoint.clone(),
            prompt: prompt.text,
            temperature: settings.temperature,
            max_response_tokens: settings.max_response_tokens.min(limits.max_response_tokens),
            extra: settings.extra.clone(),
            cancellation: request.cancellation_token.clone(),
        };
        debug!(
            conversation_id,
            prompt_tokens,
            documents = documents.source_count(),
            history = budgeted.context.messages.len(),
            "Prompt assembled"
        );

        let streamed = self
            .stream_with_retry(backend.as_ref(), backend_request, events)
            .await?;
        if let Some(reason) = streamed.interruption {
            warnings.push(PipelineWarning::ResponseInterrupted { reason });
        }

        let user_message = ConversationMessage::user(user_text);
        let assistant_message = ConversationMessage::assistant(streamed.text.clone())
            .with_model_info(backend.model_info());

        let persistence = if request.persist_history {
            if streamed.text.trim().is_empty() {
                warnings.push(PipelineWarning::EmptyResponseNotPersisted);
            }
            let outcome = self
                .persistence
                .save(conversation_id, Some(&user_message), &assistant_message)
                .await;
            for (role, status) in [
                (Role::User, &outcome.user_message),
                (Role::Assistant, &outcome.assistant_message),
            ] {
                if let WriteStatus::Failed { reason } = status {
                    warnings.push(PipelineWarning::PersistenceFailed {
                        role,
                        reason: reason.clone(),
                    });
                }
            }
            outcome
        } else {
            PersistenceOutcome::skipped()
        };

        info!(
            conversation_id,
            backend = backend_id,
            finish_reason = %streamed.finish_reason,
            chars = streamed.text.len(),
            prompt_tokens,
            warnings = warnings.len(),
            "Generation finished"
        );

        Ok(GenerationOutcome {
            text: streamed.text,
            finish_reason: streamed.finish_reason,
            warnings,
            persistence,
            prompt_tokens,
            budget: report,
            user_message,
            assistant_message,
        })
    }

    /// Stream from `backend`, retrying transient failures that happen
    /// before the first chunk. Output already shown cannot be replayed, so
    /// a failure after it ends the answer early instead.
    async fn stream_with_retry(
        &self,
        backend: &dyn ModelBackend,
        request: BackendRequest,
        events: Option<&mpsc::UnboundedSender<GenerationEvent>>,
    ) -> std::result::Result<StreamedResponse, BackendError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let cancel = request.cancellation.clone();
        let limit = self.config.timeouts.model_call();
        let mut attempt = 1;

        loop {
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let mut accumulator = StreamAccumulator::with_listener(events.cloned());
            let result = consume_stream(
                backend.stream(request.clone(), tx),
                rx,
                &mut accumulator,
                &cancel,
                limit,
            )
            .await;

            match result {
                Ok(StreamEnd::Completed) => {
                    return Ok(StreamedResponse {
                        text: accumulator.into_text(),
                        finish_reason: FinishReason::Completed,
                        interruption: None,
                    });
                }
                Ok(StreamEnd::Cancelled) => {
                    info!(
                        chunks = accumulator.chunk_count(),
                        "Generation cancelled, keeping partial output"
                    );
                    return Ok(StreamedResponse {
                        text: accumulator.into_text(),
                        finish_reason: FinishReason::Cancelled,
                        interruption: None,
                    });
                }
                Err(e) if accumulator.chunk_count() > 0 => {
                    warn!(
                        chunks = accumulator.chunk_count(),
                        error = %e,
                        "Model stream failed after partial output"
                    );
                    return Ok(StreamedResponse {
                        text: accumulator.into_text(),
                        finish_reason: FinishReason::Interrupted,
                        interruption: Some(e.to_string()),
                    });
                }
                Err(e) if e.class().is_retryable() && attempt < max_attempts => {
                    let backoff = policy.delay_for(attempt);
                    info!(
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying generation after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Ok(StreamedResponse {
                                text: String::new(),
                                finish_reason: FinishReason::Cancelled,
                                interruption: None,
                            });
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(attempt, class = %e.class(), error = %e, "Generation failed");
                    return Err(e);
                }
            }
        }
    }
}

/// Assembles a [`ChatOrchestrator`] from its collaborators.
pub struct ChatOrchestratorBuilder {
    store: Arc<dyn ChatStore>,
    index: Arc<dyn DocumentIndex>,
    config: PipelineConfig,
    estimator: Option<Arc<dyn TokenEstimator>>,
    templates: Option<Arc<PromptTemplates>>,
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl ChatOrchestratorBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a [`HeuristicEstimator`] using `budget.chars_per_token`.
    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Defaults to [`PromptTemplates::with_defaults`].
    pub fn templates(mut self, templates: Arc<PromptTemplates>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Register a backend under its own id. A later backend with the same
    /// id replaces the earlier one.
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends.insert(backend.id().to_string(), backend);
        self
    }

    pub fn build(self) -> std::result::Result<ChatOrchestrator, ConfigError> {
        let config = self.config;
        config.validate()?;

        let index: Arc<dyn DocumentIndex> = if config.cache.enabled {
            Arc::new(CachingDocumentIndex::new(
                self.index,
                config.cache.capacity,
                config.cache.ttl(),
            ))
        } else {
            self.index
        };
        let estimator = self.estimator.unwrap_or_else(|| {
            Arc::new(HeuristicEstimator::new(config.budget.chars_per_token))
        });
        let templates = self
            .templates
            .unwrap_or_else(|| Arc::new(PromptTemplates::with_defaults()));

        let history = HistoryContextLoader::new(self.store.clone(), config.history.clone())
            .with_retry(config.retry.clone())
            .with_timeout(config.timeouts.history_fetch());
        let documents = DocumentContextLoader::new(index)
            .with_retry(config.retry.clone())
            .with_timeout(config.timeouts.document_query());
        let persistence = HistoryPersistence::new(self.store)
            .with_timeout(config.timeouts.persistence_write());

        Ok(ChatOrchestrator {
            history,
            documents,
            budget: ContextBudgetManager::new(estimator, config.budget.clone()),
            assembler: PromptAssembler::new(templates),
            persistence,
            backends: self.backends,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockModelBackend, ScriptStep};
    use crate::index::InMemoryDocumentIndex;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryChatStore;
    use crate::types::BackendConfig;

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 2,
        };
        config.cache.enabled = false;
        config
    }

    fn request(conversation: &str, text: &str) -> GenerationRequest {
        GenerationRequest::new(
            conversation,
            text,
            BackendConfig {
                id: "mock".into(),
                endpoint: "http://localhost:11434".into(),
            },
        )
    }

    fn orchestrator(backend: Arc<MockModelBackend>) -> (ChatOrchestrator, Arc<InMemoryChatStore>) {
        let store = Arc::new(InMemoryChatStore::new());
        store.create_conversation("c1");
        let orchestrator = ChatOrchestrator::builder(
            store.clone(),
            Arc::new(InMemoryDocumentIndex::new()),
        )
        .config(fast_config())
        .backend(backend)
        .build()
        .unwrap();
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_invalid_request_emits_error_event() {
        let backend = Arc::new(MockModelBackend::new("mock"));
        let (orchestrator, store) = orchestrator(backend.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = orchestrator
            .run_with_events(request("c1", "   "), Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert!(matches!(rx.recv().await, Some(GenerationEvent::Error(_))));
        assert_eq!(store.fetch_calls(), 0);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_rejected() {
        let backend = Arc::new(MockModelBackend::new("other"));
        let (orchestrator, store) = orchestrator(backend);
        let err = orchestrator.run(request("c1", "Hi")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation { .. }));
        assert_eq!(store.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_before_output_is_retried() {
        let backend = Arc::new(MockModelBackend::new("mock"));
        backend.queue_script(vec![ScriptStep::Fail(BackendError::Connection {
            message: "refused".into(),
        })]);
        backend.queue_chunks(&["Hi", " there"]);
        let (orchestrator, _) = orchestrator(backend.clone());

        let outcome = orchestrator.run(request("c1", "Hello")).await.unwrap();
        assert_eq!(outcome.text, "Hi there");
        assert_eq!(outcome.finish_reason, FinishReason::Completed);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let backend = Arc::new(MockModelBackend::new("mock"));
        backend.queue_script(vec![ScriptStep::Fail(BackendError::Http {
            status: 400,
            body: "bad request".into(),
        })]);
        backend.queue_chunks(&["unused"]);
        let (orchestrator, store) = orchestrator(backend.clone());

        let err = orchestrator.run(request("c1", "Hello")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Backend(BackendError::Http { .. })));
        assert_eq!(backend.call_count(), 1);
        assert!(store.append_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_output_keeps_partial_text() {
        let backend = Arc::new(MockModelBackend::new("mock"));
        backend.queue_script(vec![
            ScriptStep::Chunk("The answer".into()),
            ScriptStep::Fail(BackendError::Connection {
                message: "reset".into(),
            }),
        ]);
        let (orchestrator, store) = orchestrator(backend.clone());

        let outcome = orchestrator.run(request("c1", "Hello")).await.unwrap();
        assert_eq!(outcome.text, "The answer");
        assert_eq!(outcome.finish_reason, FinishReason::Interrupted);
        assert!(outcome.has_warning(|w| matches!(w, PipelineWarning::ResponseInterrupted { .. })));
        assert_eq!(backend.call_count(), 1);
        assert!(outcome.persistence.assistant_message_saved());
        assert_eq!(store.stored_messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_request_carries_conversation_settings() {
        let backend = Arc::new(MockModelBackend::with_chunks("mock", &["ok"]));
        let (orchestrator, _) = orchestrator(backend.clone());
        orchestrator
            .run(request("c1", "Hello").with_persist_history(false))
            .await
            .unwrap();

        let sent = &backend.requests()[0];
        assert!((sent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(sent.max_response_tokens, 1024);
        assert!(sent.prompt.ends_with("User: Hello\nAssistant:"));
        assert_eq!(sent.endpoint, "http://localhost:11434");
    }
}
