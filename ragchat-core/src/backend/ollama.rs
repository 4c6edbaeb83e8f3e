//! Ollama-compatible streaming backend.
//!
//! Posts to `{endpoint}/api/generate` with `stream: true` and reads the
//! newline-delimited JSON reply, one object per line:
//! `{"response": "...", "done": false}` ... `{"done": true}`.

use super::{BackendRequest, ModelBackend, StreamEvent};
use crate::error::{BackendError, classify_http_status};
use crate::types::ModelInfo;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One decoded NDJSON line.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateLine {
    pub text: Option<String>,
    pub done: bool,
}

/// Decode one line of the `/api/generate` stream. Blank lines yield `None`.
pub fn parse_generate_line(line: &[u8]) -> Result<Option<GenerateLine>, BackendError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(trimmed).map_err(|e| BackendError::Malformed {
        reason: format!("invalid stream line: {e}"),
    })?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(BackendError::Streaming {
            message: message.to_string(),
        });
    }
    let text = value
        .get("response")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
    Ok(Some(GenerateLine { text, done }))
}

/// Map a transport error. Timeouts report the bound that fired: the connect
/// timeout for connection setup, the request timeout otherwise.
fn map_request_error(
    e: reqwest::Error,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
) -> BackendError {
    let timeout = if !e.is_timeout() {
        None
    } else if e.is_connect() {
        Some(connect_timeout)
    } else {
        request_timeout
    };
    match timeout {
        Some(timeout) => BackendError::Timeout { timeout },
        None => BackendError::Connection {
            message: e.to_string(),
        },
    }
}

/// Streams completions from an Ollama server.
///
/// Each request is posted to the endpoint it carries; the endpoint given at
/// construction is used only when a request leaves it blank.
pub struct OllamaBackend {
    id: String,
    endpoint: String,
    model: String,
    client: reqwest::Client,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl OllamaBackend {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, BackendError> {
        Self::with_timeouts(endpoint, model, CONNECT_TIMEOUT, None)
    }

    /// Build with explicit bounds. `request_timeout` caps a whole call,
    /// streamed body included; `None` leaves it to the caller.
    pub fn with_timeouts(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Option<Duration>,
    ) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| BackendError::Connection {
            message: format!("Failed to build HTTP client: {}", e),
        })?;
        Ok(Self {
            id: "ollama".into(),
            endpoint: endpoint.into(),
            model: model.into(),
            client,
            connect_timeout,
            request_timeout,
        })
    }

    /// Register under a different backend id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Generate URL on the backend's own endpoint.
    pub fn generate_url(&self) -> String {
        self.generate_url_for("")
    }

    /// Generate URL for a request endpoint, falling back to the backend's
    /// own endpoint when it is blank.
    pub fn generate_url_for(&self, endpoint: &str) -> String {
        let base = if endpoint.trim().is_empty() {
            self.endpoint.as_str()
        } else {
            endpoint.trim()
        };
        format!("{}/api/generate", base.trim_end_matches('/'))
    }

    fn map_error(&self, e: reqwest::Error) -> BackendError {
        map_request_error(e, self.connect_timeout, self.request_timeout)
    }

    fn request_body(&self, request: &BackendRequest) -> Value {
        let mut options = json!({
            "temperature": request.temperature,
            "num_predict": request.max_response_tokens,
        });
        for (key, value) in &request.extra {
            options[key] = value.clone();
        }
        json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": true,
            "options": options,
        })
    }
}

/// Send every complete line in `buffer` as events. Returns `true` once the
/// stream reports `done` or the receiver has gone away.
async fn flush_lines(
    buffer: &mut Vec<u8>,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<bool, BackendError> {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let Some(parsed) = parse_generate_line(&line)? else {
            continue;
        };
        if let Some(text) = parsed.text
            && tx.send(StreamEvent::Chunk(text)).await.is_err()
        {
            return Ok(true);
        }
        if parsed.done {
            let _ = tx.send(StreamEvent::Done).await;
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: self.model.clone(),
            version: None,
            provider: "ollama".into(),
        }
    }

    async fn stream(
        &self,
        request: BackendRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        let url = self.generate_url_for(&request.endpoint);
        debug!(url = %url, model = %self.model, "Starting generation stream");

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                class = %classify_http_status(status.as_u16()),
                "Model backend returned an error status"
            );
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let mut bytes = Box::pin(response.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let next = tokio::select! {
                _ = request.cancellation.cancelled() => {
                    debug!("Generation stream cancelled");
                    return Ok(());
                }
                next = bytes.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    if flush_lines(&mut buffer, &tx).await? {
                        return Ok(());
                    }
                }
                Some(Err(e)) if e.is_timeout() => return Err(self.map_error(e)),
                Some(Err(e)) => {
                    return Err(BackendError::Streaming {
                        message: format!("failed to read stream: {e}"),
                    });
                }
                None => break,
            }
        }

        // Trailing line without a newline.
        buffer.push(b'\n');
        flush_lines(&mut buffer, &tx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_generate_line() {
        let line = parse_generate_line(br#"{"response":"Hel","done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(line.text.as_deref(), Some("Hel"));
        assert!(!line.done);

        let line = parse_generate_line(br#"{"response":"","done":true}"#)
            .unwrap()
            .unwrap();
        assert_eq!(line.text, None);
        assert!(line.done);

        assert_eq!(parse_generate_line(b"   \n").unwrap(), None);
    }

    #[test]
    fn test_parse_generate_line_errors() {
        let err = parse_generate_line(br#"{"error":"model not found"}"#).unwrap_err();
        assert!(matches!(err, BackendError::Streaming { .. }));
        let err = parse_generate_line(b"{oops").unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_flush_lines_keeps_partial_line() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut buffer = b"{\"response\":\"a\"}\n{\"respo".to_vec();
        assert!(!flush_lines(&mut buffer, &tx).await.unwrap());
        assert_eq!(buffer, b"{\"respo".to_vec());
        assert_eq!(rx.recv().await, Some(StreamEvent::Chunk("a".into())));

        buffer.extend_from_slice(b"nse\":\"b\",\"done\":true}\n");
        assert!(flush_lines(&mut buffer, &tx).await.unwrap());
        assert_eq!(rx.recv().await, Some(StreamEvent::Chunk("b".into())));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
    }

    #[test]
    fn test_request_body_and_url() {
        let backend = OllamaBackend::new("http://localhost:11434/", "llama3.2:3b").unwrap();
        assert_eq!(backend.generate_url(), "http://localhost:11434/api/generate");
        let request = BackendRequest {
            endpoint: String::new(),
            prompt: "Hi".into(),
            temperature: 0.5,
            max_response_tokens: 128,
            extra: HashMap::from([("top_p".to_string(), json!(0.9))]),
            cancellation: CancellationToken::new(),
        };
        let body = backend.request_body(&request);
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["top_p"], 0.9);
        assert_eq!(backend.model_info().provider, "ollama");
    }

    #[test]
    fn test_request_endpoint_overrides_own_endpoint() {
        let backend = OllamaBackend::new("http://127.0.0.1:1", "llama3.2:3b").unwrap();
        assert_eq!(
            backend.generate_url_for("http://gpu-box:11434/"),
            "http://gpu-box:11434/api/generate"
        );
        assert_eq!(
            backend.generate_url_for("  "),
            "http://127.0.0.1:1/api/generate"
        );
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let backend = OllamaBackend::new("http://127.0.0.1:1", "llama3.2:3b").unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let request = BackendRequest {
            endpoint: String::new(),
            prompt: "Hi".into(),
            temperature: 0.5,
            max_response_tokens: 16,
            extra: HashMap::new(),
            cancellation: CancellationToken::new(),
        };
        let err = backend.stream(request, tx).await.unwrap_err();
        assert!(matches!(err, BackendError::Connection { .. }));
        assert!(err.class().is_retryable());
    }

    #[tokio::test]
    async fn test_request_timeout_reports_configured_bound() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let backend = OllamaBackend::with_timeouts(
            format!("http://{addr}"),
            "llama3.2:3b",
            Duration::from_secs(2),
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let request = BackendRequest {
            endpoint: String::new(),
            prompt: "Hi".into(),
            temperature: 0.5,
            max_response_tokens: 16,
            extra: HashMap::new(),
            cancellation: CancellationToken::new(),
        };
        let err = backend.stream(request, tx).await.unwrap_err();
        assert!(
            matches!(err, BackendError::Timeout { timeout } if timeout == Duration::from_millis(50)),
            "unexpected error: {err:?}"
        );
        server.abort();
    }
}
