//! Document index capability.
//!
//! Similarity search itself is out of scope; the pipeline only needs the
//! two calls below. Payloads are raw JSON and go through [`crate::adapt`].

use crate::error::IndexError;
use crate::types::DocumentSource;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Asynchronous access to the per-conversation document collection.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// `{ sizeBytes, pointCount }` for the conversation's collection.
    async fn get_collection_stats(&self, conversation_id: &str) -> Result<Value, IndexError>;

    /// `{ sources: [{ content, relevanceScore }], confidence }`.
    async fn query(
        &self,
        conversation_id: &str,
        text: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Value, IndexError>;
}

#[derive(Default)]
struct IndexState {
    collections: HashMap<String, Vec<DocumentSource>>,
    persistent_failure: Option<IndexError>,
    query_failures: VecDeque<IndexError>,
    stats_calls: usize,
    query_calls: usize,
}

/// Fixture index: every document carries a fixed relevance score that is
/// returned for any query text.
#[derive(Default)]
pub struct InMemoryDocumentIndex {
    state: Mutex<IndexState>,
}

impl InMemoryDocumentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty collection for a conversation.
    pub fn create_collection(&self, conversation_id: &str) {
        self.lock()
            .collections
            .entry(conversation_id.to_string())
            .or_default();
    }

    /// Add documents to a conversation's collection, creating it if needed.
    pub fn add_documents(&self, conversation_id: &str, documents: Vec<DocumentSource>) {
        self.lock()
            .collections
            .entry(conversation_id.to_string())
            .or_default()
            .extend(documents);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn set_failure(&self, error: Option<IndexError>) {
        self.lock().persistent_failure = error;
    }

    /// Fail the next `query` call with `error`.
    pub fn fail_next_query(&self, error: IndexError) {
        self.lock().query_failures.push_back(error);
    }

    pub fn stats_calls(&self) -> usize {
        self.lock().stats_calls
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }
}

#[async_trait]
impl DocumentIndex for InMemoryDocumentIndex {
    async fn get_collection_stats(&self, conversation_id: &str) -> Result<Value, IndexError> {
        let mut state = self.lock();
        state.stats_calls += 1;
        if let Some(error) = &state.persistent_failure {
            return Err(error.clone());
        }
        let documents =
            state
                .collections
                .get(conversation_id)
                .ok_or_else(|| IndexError::CollectionNotFound {
                    conversation_id: conversation_id.to_string(),
                })?;
        let size_bytes: usize = documents.iter().map(|d| d.content.len()).sum();
        Ok(json!({ "sizeBytes": size_bytes, "pointCount": documents.len() }))
    }

    async fn query(
        &self,
        conversation_id: &str,
        _text: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Value, IndexError> {
        let mut state = self.lock();
        state.query_calls += 1;
        if let Some(error) = &state.persistent_failure {
            return Err(error.clone());
        }
        if let Some(error) = state.query_failures.pop_front() {
            return Err(error);
        }
        let documents =
            state
                .collections
                .get(conversation_id)
                .ok_or_else(|| IndexError::CollectionNotFound {
                    conversation_id: conversation_id.to_string(),
                })?;

        let mut hits: Vec<&DocumentSource> = documents
            .iter()
            .filter(|d| d.relevance_score >= similarity_threshold)
            .collect();
        hits.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        hits.truncate(top_k);

        let confidence = if hits.is_empty() {
            0.0
        } else {
            hits.iter().map(|d| d.relevance_score).sum::<f32>() / hits.len() as f32
        };
        Ok(json!({ "sources": hits, "confidence": confidence }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::{parse_collection_stats, parse_query_result};

    fn doc(content: &str, score: f32) -> DocumentSource {
        DocumentSource {
            content: content.into(),
            relevance_score: score,
        }
    }

    #[tokio::test]
    async fn test_stats_for_missing_and_empty_collections() {
        let index = InMemoryDocumentIndex::new();
        let err = index.get_collection_stats("c1").await.unwrap_err();
        assert!(matches!(err, IndexError::CollectionNotFound { .. }));

        index.create_collection("c1");
        let stats = parse_collection_stats(&index.get_collection_stats("c1").await.unwrap())
            .into_result()
            .unwrap();
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_sorts_and_truncates() {
        let index = InMemoryDocumentIndex::new();
        index.add_documents(
            "c1",
            vec![doc("low", 0.1), doc("mid", 0.5), doc("high", 0.9), doc("mid2", 0.6)],
        );
        let raw = index.query("c1", "anything", 2, 0.3).await.unwrap();
        let payload = parse_query_result(&raw).into_result().unwrap();
        let contents: Vec<_> = payload.sources.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["high", "mid2"]);
        assert!((payload.confidence.unwrap() - 0.75).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let index = InMemoryDocumentIndex::new();
        index.create_collection("c1");
        index.fail_next_query(IndexError::Unavailable {
            message: "busy".into(),
        });
        assert!(index.query("c1", "q", 3, 0.0).await.is_err());
        assert!(index.query("c1", "q", 3, 0.0).await.is_ok());

        index.set_failure(Some(IndexError::Unavailable {
            message: "down".into(),
        }));
        assert!(index.get_collection_stats("c1").await.is_err());
        index.set_failure(None);
        assert!(index.get_collection_stats("c1").await.is_ok());
        assert_eq!(index.query_calls(), 2);
        assert_eq!(index.stats_calls(), 2);
    }
}
