//! Model backend capability.
//!
//! A backend streams text chunks for a prompt into an mpsc channel and
//! returns once the stream is finished. [`MockModelBackend`] replays
//! scripted chunk sequences for tests.

pub mod ollama;

pub use ollama::OllamaBackend;

use crate::error::BackendError;
use crate::types::ModelInfo;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Parameters for one streaming completion.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// Server base URL taken from the request's `BackendConfig`. Backends
    /// that talk to a server post here rather than to a fixed address.
    pub endpoint: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_response_tokens: usize,
    /// Backend-specific options passed through untouched.
    pub extra: HashMap<String, serde_json::Value>,
    /// Fires when the caller no longer wants output.
    pub cancellation: CancellationToken,
}

/// One event on the chunk channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Error(String),
}

/// A streaming text-completion service.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifier matched against `BackendConfig::id`.
    fn id(&self) -> &str;

    /// Describes the model attached to saved assistant messages.
    fn model_info(&self) -> ModelInfo;

    /// Stream a completion. Chunks go to `tx` in order; the call returns
    /// when the backend has finished or failed.
    async fn stream(
        &self,
        request: BackendRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError>;
}

/// One step of a scripted mock response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a chunk.
    Chunk(String),
    /// Stop with an error.
    Fail(BackendError),
    /// Cancel the given token, as a user would mid-stream.
    Cancel(CancellationToken),
    /// Wait before the next step.
    Pause(Duration),
}

/// Scripted backend for tests. Each call consumes the next queued script;
/// a call with nothing queued fails with a non-retryable error.
pub struct MockModelBackend {
    id: String,
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl MockModelBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A backend that answers the next call with `chunks`.
    pub fn with_chunks(id: impl Into<String>, chunks: &[&str]) -> Self {
        let backend = Self::new(id);
        backend.queue_chunks(chunks);
        backend
    }

    pub fn queue_script(&self, script: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(script);
    }

    pub fn queue_chunks(&self, chunks: &[&str]) {
        self.queue_script(
            chunks
                .iter()
                .map(|c| ScriptStep::Chunk(c.to_string()))
                .collect(),
        );
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<BackendRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ModelBackend for MockModelBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "mock-model".into(),
            version: Some("1".into()),
            provider: self.id.clone(),
        }
    }

    async fn stream(
        &self,
        request: BackendRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| BackendError::Malformed {
                reason: "mock backend has no scripted response".into(),
            })?;

        for step in script {
            match step {
                ScriptStep::Chunk(text) => {
                    if tx.send(StreamEvent::Chunk(text)).await.is_err() {
                        return Ok(());
                    }
                }
                ScriptStep::Fail(error) => return Err(error),
                ScriptStep::Cancel(token) => token.cancel(),
                ScriptStep::Pause(duration) => tokio::time::sleep(duration).await,
            }
            // Hand control back so the consumer sees each step in turn.
            tokio::task::yield_now().await;
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }
}
