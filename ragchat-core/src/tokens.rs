//! Token estimation.
//!
//! The budget manager only needs an estimate that is deterministic and
//! monotonic in text length. [`HeuristicEstimator`] divides the character
//! count; [`TiktokenEstimator`] runs a real BPE for callers who want numbers
//! closer to what the model reports.

use crate::error::ConfigError;
use crate::types::{ConversationContext, ConversationMessage};

/// Structural overhead per message (role token plus separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Maps text to an estimated token count.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in `text`.
    fn estimate(&self, text: &str) -> usize;

    /// Estimate a single message including its structural overhead.
    fn estimate_message(&self, message: &ConversationMessage) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.estimate(&message.content)
    }

    /// Estimate a list of messages.
    fn estimate_messages(&self, messages: &[ConversationMessage]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    /// Estimate the full serialized context: system prompt plus every message.
    fn estimate_context(&self, context: &ConversationContext) -> usize {
        self.estimate(&context.system_prompt) + self.estimate_messages(&context.messages)
    }
}

/// Length-based approximation: `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicEstimator {
    chars_per_token: usize,
}

impl HeuristicEstimator {
    /// A `chars_per_token` of zero is treated as one.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// BPE token counter backed by `tiktoken-rs`.
pub struct TiktokenEstimator {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenEstimator {
    /// Counter for the given model name, falling back to `cl100k_base`.
    pub fn for_model(model: &str) -> Result<Self, ConfigError> {
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => tiktoken_rs::cl100k_base().map_err(|e| ConfigError::Invalid {
                message: format!("tokenizer unavailable: {e}"),
            })?,
        };
        Ok(Self { bpe })
    }
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator").finish_non_exhaustive()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
