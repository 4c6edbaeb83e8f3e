//! Document context loading.
//!
//! Queries the document index for a conversation and formats the hits into
//! a numbered plain-text block for the prompt. A missing or empty
//! collection is a normal state and yields [`DocumentContext::Empty`].

use crate::adapt::{ParseResult, parse_collection_stats, parse_query_result};
use crate::error::IndexError;
use crate::index::DocumentIndex;
use crate::retry::{RetryPolicy, retry_with_backoff, with_timeout};
use crate::types::{DocumentContextResult, DocumentQueryConfig, DocumentSource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Retrieved documents for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentContext {
    /// No documents apply: no collection, an empty one, or no hits.
    Empty,
    Loaded {
        result: DocumentContextResult,
        /// Formatted text block injected into the prompt.
        block: String,
    },
}

impl DocumentContext {
    pub fn is_empty(&self) -> bool {
        matches!(self, DocumentContext::Empty)
    }

    /// The formatted block, or `""` when empty.
    pub fn block(&self) -> &str {
        match self {
            DocumentContext::Empty => "",
            DocumentContext::Loaded { block, .. } => block,
        }
    }

    pub fn source_count(&self) -> usize {
        match self {
            DocumentContext::Empty => 0,
            DocumentContext::Loaded { result, .. } => result.sources.len(),
        }
    }
}

/// Format sources as `"{n}. {content}"` entries separated by blank lines.
pub fn format_sources(sources: &[DocumentSource]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, source)| format!("{}. {}", i + 1, source.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Loads document context from a [`DocumentIndex`].
pub struct DocumentContextLoader {
    index: Arc<dyn DocumentIndex>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl DocumentContextLoader {
    pub fn new(index: Arc<dyn DocumentIndex>) -> Self {
        Self {
            index,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound each index call; `None` disables the bound.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn load(
        &self,
        conversation_id: &str,
        query_text: &str,
        config: &DocumentQueryConfig,
    ) -> Result<DocumentContext, IndexError> {
        let top_k = usize::try_from(config.top_k).unwrap_or(0);
        if top_k == 0 {
            debug!(conversation_id, "top_k is zero, skipping document retrieval");
            return Ok(DocumentContext::Empty);
        }

        let stats = retry_with_backoff(&self.retry, "document_stats", |_| {
            with_timeout(
                self.timeout,
                self.index.get_collection_stats(conversation_id),
                |timeout| IndexError::Timeout { timeout },
            )
        })
        .await;
        let stats = match stats {
            Ok(raw) => match parse_collection_stats(&raw) {
                ParseResult::Parsed(stats) => stats,
                ParseResult::Malformed { reason } => {
                    return Err(IndexError::Malformed { reason });
                }
            },
            Err(IndexError::CollectionNotFound { .. }) => {
                debug!(conversation_id, "No document collection");
                return Ok(DocumentContext::Empty);
            }
            Err(e) => return Err(e),
        };
        if stats.is_empty() {
            debug!(conversation_id, "Document collection is empty");
            return Ok(DocumentContext::Empty);
        }

        let raw = retry_with_backoff(&self.retry, "document_query", |_| {
            with_timeout(
                self.timeout,
                self.index.query(
                    conversation_id,
                    query_text,
                    top_k,
                    config.similarity_threshold,
                ),
                |timeout| IndexError::Timeout { timeout },
            )
        })
        .await;
        let raw = match raw {
            Ok(raw) => raw,
            Err(IndexError::CollectionNotFound { .. }) => return Ok(DocumentContext::Empty),
            Err(e) => return Err(e),
        };
        let payload = match parse_query_result(&raw) {
            ParseResult::Parsed(payload) => payload,
            ParseResult::Malformed { reason } => return Err(IndexError::Malformed { reason }),
        };

        let mut sources = payload.sources;
        sources.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        sources.truncate(top_k);
        if sources.is_empty() {
            debug!(conversation_id, "No documents above the similarity threshold");
            return Ok(DocumentContext::Empty);
        }

        let best = sources[0].relevance_score;
        let confidence = payload.confidence.unwrap_or(best).clamp(0.0, 1.0);
        let block = format_sources(&sources);
        info!(
            conversation_id,
            sources = sources.len(),
            confidence,
            "Loaded document context"
        );
        Ok(DocumentContext::Loaded {
            result: DocumentContextResult {
                sources,
                confidence,
            },
            block,
        })
    }
}
