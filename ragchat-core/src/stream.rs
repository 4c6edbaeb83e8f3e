//! Streaming response accumulation.
//!
//! [`StreamAccumulator`] concatenates chunks in arrival order and forwards
//! each one, unmodified, to an optional listener. It has two states:
//! `Accumulating` and `Done`. Once done, the text is frozen and further
//! chunks are ignored.
//!
//! [`consume_stream`] drives a backend call and its chunk channel in the
//! current task, checking cancellation before every step.

use crate::backend::StreamEvent;
use crate::error::BackendError;
use crate::types::GenerationEvent;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why accumulation stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneReason {
    Completed,
    Cancelled,
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorState {
    Accumulating,
    Done(DoneReason),
}

/// Collects streamed model output into the final response text.
#[derive(Debug)]
pub struct StreamAccumulator {
    text: String,
    chunks: usize,
    state: AccumulatorState,
    listener: Option<mpsc::UnboundedSender<GenerationEvent>>,
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            chunks: 0,
            state: AccumulatorState::Accumulating,
            listener: None,
        }
    }

    /// Forward every accepted chunk to `listener` as `GenerationEvent::Partial`.
    pub fn with_listener(listener: Option<mpsc::UnboundedSender<GenerationEvent>>) -> Self {
        Self {
            listener,
            ..Self::new()
        }
    }

    /// Append a chunk. Returns `false` if the accumulator is already done.
    pub fn on_chunk(&mut self, chunk: &str) -> bool {
        if self.is_done() {
            return false;
        }
        self.text.push_str(chunk);
        self.chunks += 1;
        if let Some(listener) = &self.listener {
            // A listener that went away does not stop accumulation.
            let _ = listener.send(GenerationEvent::Partial(chunk.to_string()));
        }
        true
    }

    /// Record an error and stop accumulating. Never panics.
    pub fn on_error(&mut self, message: impl Into<String>) {
        self.finish(DoneReason::Errored(message.into()));
    }

    pub fn complete(&mut self) {
        self.finish(DoneReason::Completed);
    }

    pub fn cancel(&mut self) {
        self.finish(DoneReason::Cancelled);
    }

    fn finish(&mut self, reason: DoneReason) {
        if !self.is_done() {
            self.state = AccumulatorState::Done(reason);
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, AccumulatorState::Done(_))
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    /// The text accumulated so far.
    pub fn full_response(&self) -> &str {
        &self.text
    }

    /// Number of chunks accepted.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// How a consumed stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

/// Poll `call` and drain `rx` into `accumulator` until the stream ends,
/// the token fires or `limit` elapses.
///
/// Cancellation wins over pending chunks: once the token fires, nothing
/// else is read and the call is dropped. Chunks buffered before a call
/// failure are still delivered, in order, before the error is recorded.
pub async fn consume_stream<F>(
    call: F,
    mut rx: mpsc::Receiver<StreamEvent>,
    accumulator: &mut StreamAccumulator,
    cancel: &CancellationToken,
    limit: Option<Duration>,
) -> Result<StreamEnd, BackendError>
where
    F: Future<Output = Result<(), BackendError>>,
{
    tokio::pin!(call);
    let deadline = limit.map(|d| tokio::time::Instant::now() + d);
    let timer = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);

    let mut call_result: Option<Result<(), BackendError>> = None;
    let mut channel_open = true;

    while channel_open || call_result.is_none() {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(chunks = accumulator.chunk_count(), "Stream cancelled");
                accumulator.cancel();
                return Ok(StreamEnd::Cancelled);
            }

            _ = &mut timer => {
                let error = BackendError::Timeout {
                    timeout: limit.unwrap_or_default(),
                };
                accumulator.on_error(error.to_string());
                return Err(error);
            }

            event = rx.recv(), if channel_open => match event {
                Some(StreamEvent::Chunk(text)) => {
                    accumulator.on_chunk(&text);
                }
                Some(StreamEvent::Done) => {
                    accumulator.complete();
                    return Ok(StreamEnd::Completed);
                }
                Some(StreamEvent::Error(message)) => {
                    accumulator.on_error(message.clone());
                    return Err(BackendError::Streaming { message });
                }
                None => channel_open = false,
            },

            result = &mut call, if call_result.is_none() => {
                call_result = Some(result);
            }
        }
    }

    match call_result {
        Some(Err(error)) => {
            accumulator.on_error(error.to_string());
            Err(error)
        }
        _ => {
            accumulator.complete();
            Ok(StreamEnd::Completed)
        }
    }
}
