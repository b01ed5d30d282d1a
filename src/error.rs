//! Error taxonomy for the ingestion pipeline.
//!
//! Only [`StepError`] crosses the step boundary; the orchestrator decides
//! from its variant whether an attempt is retried. Application edges (CLI,
//! migrations, config) use `anyhow` instead.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Failure of a single step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StepError {
    /// Network error, rate limit, server error or timeout. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Input or output that will never succeed. Fails the run immediately.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP response from a provider or the index.
    ///
    /// 429 and 5xx are transient; every other status is permanent.
    pub fn from_status(service: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{} returned {}: {}", service, status, truncate(body, 512));
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }

    /// Classify a transport-level failure. These are always transient.
    pub fn from_transport(service: &str, err: reqwest::Error) -> Self {
        Self::Transient(format!("{} request failed: {}", service, err))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Reasons an incoming broker message is rejected at ingress.
///
/// A message that fails validation is a poison message: it is logged,
/// committed, and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message from unknown topic: {0}")]
    UnknownTopic(String),
    #[error("payload is not a JSON object: {0}")]
    Malformed(String),
    #[error("missing or non-string field: {0}")]
    MissingField(&'static str),
    #[error("invalid entity id: {0}")]
    InvalidId(String),
}

/// Errors surfaced by the run orchestrator to its callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The durable run store could not be reached. Callers must not treat
    /// the submission as accepted.
    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl OrchestratorError {
    pub fn unavailable(err: anyhow::Error) -> Self {
        Self::Unavailable(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let e = StepError::from_status("openai", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(e.is_retriable());
        let e = StepError::from_status("openai", StatusCode::BAD_GATEWAY, "");
        assert!(e.is_retriable());
        let e = StepError::from_status("openai", StatusCode::BAD_REQUEST, "bad input");
        assert!(!e.is_retriable());
        let e = StepError::from_status("opensearch", StatusCode::UNAUTHORIZED, "");
        assert!(!e.is_retriable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "é".repeat(400);
        let t = truncate(&s, 513);
        assert!(t.len() <= 513);
        assert!(s.starts_with(t));
    }

    #[test]
    fn test_step_error_serde_shape() {
        let json = serde_json::to_value(StepError::permanent("empty code")).unwrap();
        assert_eq!(json["kind"], "permanent");
        assert_eq!(json["message"], "empty code");
    }
}
