//! Public operation envelope.
//!
//! Every public operation returns a stable envelope: a status, optional
//! data, an optional human-readable error with a machine-readable kind, and
//! the reasoning steps accumulated while producing the result. Callers can
//! rely on the envelope shape regardless of which subsystem answered.

use crate::Error;
use serde::{Deserialize, Serialize};

/// Outcome status carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Operation completed fully.
    Success,
    /// Operation failed; `error` is populated.
    Error,
    /// A referenced resource was missing.
    NotFound,
    /// Operation completed but with degraded coverage.
    Partial,
}

/// Machine- and human-readable error detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error kind (`INVALID_INPUT`, `NOT_FOUND`, ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for ErrorDetail {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One step in an operation's reasoning trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Step name (`classify_query`, `entity_lookup`, ...).
    pub step: String,
    /// What happened during the step.
    pub detail: String,
}

impl ReasoningStep {
    /// Creates a reasoning step.
    #[must_use]
    pub fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
        }
    }
}

/// Stable envelope wrapping every public operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Outcome status.
    pub status: OpStatus,
    /// Payload, present on success (and sometimes on partial outcomes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error detail, present on error and not-found outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Steps taken while producing the result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasoning_steps: Vec<ReasoningStep>,
}

impl<T> Envelope<T> {
    /// Wraps a successful payload.
    #[must_use]
    pub const fn success(data: T) -> Self {
        Self {
            status: OpStatus::Success,
            data: Some(data),
            error: None,
            reasoning_steps: Vec::new(),
        }
    }

    /// Wraps a partial payload (some work succeeded, some did not).
    #[must_use]
    pub const fn partial(data: T) -> Self {
        Self {
            status: OpStatus::Partial,
            data: Some(data),
            error: None,
            reasoning_steps: Vec::new(),
        }
    }

    /// Wraps a failure, deriving status from the error kind.
    #[must_use]
    pub fn failure(err: &Error) -> Self {
        let status = if matches!(err, Error::NotFound { .. }) {
            OpStatus::NotFound
        } else {
            OpStatus::Error
        };
        Self {
            status,
            data: None,
            error: Some(ErrorDetail::from(err)),
            reasoning_steps: Vec::new(),
        }
    }

    /// Attaches reasoning steps.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<ReasoningStep>) -> Self {
        self.reasoning_steps = steps;
        self
    }

    /// Returns true when the operation succeeded (fully or partially).
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.status, OpStatus::Success | OpStatus::Partial)
    }
}

impl<T> From<crate::Result<T>> for Envelope<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let envelope = Envelope::success(42);
        assert_eq!(envelope.status, OpStatus::Success);
        assert_eq!(envelope.data, Some(42));
        assert!(envelope.error.is_none());
        assert!(envelope.is_ok());
    }

    #[test]
    fn test_not_found_maps_to_not_found_status() {
        let err = Error::not_found("entity", "Alice");
        let envelope: Envelope<()> = Envelope::failure(&err);
        assert_eq!(envelope.status, OpStatus::NotFound);
        let detail = envelope.error.unwrap_or_else(|| ErrorDetail {
            kind: String::new(),
            message: String::new(),
        });
        assert_eq!(detail.kind, "NOT_FOUND");
    }

    #[test]
    fn test_envelope_serialization_skips_empty_fields() {
        let envelope = Envelope::success("ok");
        let json = serde_json::to_string(&envelope).unwrap_or_default();
        assert!(json.contains("\"status\":\"success\""));
        assert!(!json.contains("error"));
        assert!(!json.contains("reasoning_steps"));
    }
}
