//! Structural validation of generation requests.
//!
//! Pure and total: the same request always yields the same outcome and no
//! check ever panics. Checks run in a fixed order and stop at the first
//! failure.

use crate::types::GenerationRequest;

/// Result of validating a [`GenerationRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid { reason: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    fn invalid(reason: impl Into<String>) -> Self {
        ValidationOutcome::Invalid {
            reason: reason.into(),
        }
    }
}

/// Validate a request before any external call is made.
pub fn validate(request: &GenerationRequest) -> ValidationOutcome {
    if request.conversation_id.trim().is_empty() {
        return ValidationOutcome::invalid("conversation id is missing or empty");
    }

    if !request.user_text.has_content() {
        return ValidationOutcome::invalid("user text is missing or empty");
    }

    let backend = &request.backend_config;
    if backend.id.trim().is_empty() {
        return ValidationOutcome::invalid("backend id is missing or empty");
    }
    if backend.endpoint.trim().is_empty() {
        return ValidationOutcome::invalid("backend endpoint is missing or empty");
    }

    let query = &request.document_query_config;
    if query.top_k < 0 {
        return ValidationOutcome::invalid(format!(
            "top_k must be non-negative, got {}",
            query.top_k
        ));
    }
    let threshold = query.similarity_threshold;
    if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
        return ValidationOutcome::invalid(format!(
            "similarity threshold must be within [0, 1], got {threshold}"
        ));
    }

    ValidationOutcome::Valid
}
