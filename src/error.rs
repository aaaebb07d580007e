// Request-level error categories surfaced to callers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic failure categories carried on failed responses.
///
/// Every failed request yields a response with one of these kinds; callers
/// can react programmatically without parsing the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Submission rejected without enqueue; the priority queue was full.
    QueueFull,
    /// Caller-side wait exceeded the request timeout.
    Timeout,
    /// Accepted request could not complete before shutdown.
    ShuttingDown,
    /// The model manager could not resolve or load a model.
    NoModelAvailable,
    /// The runtime returned an error for this request's group.
    InferenceFailed,
    /// Rejected pre-dispatch: a large model was required under thermal emergency.
    ThermalEmergency,
    /// Invariant violation; should never surface in healthy operation.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ShuttingDown => "SHUTTING_DOWN",
            ErrorKind::NoModelAvailable => "NO_MODEL_AVAILABLE",
            ErrorKind::InferenceFailed => "INFERENCE_FAILED",
            ErrorKind::ThermalEmergency => "THERMAL_EMERGENCY",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Error payload attached to a failed [`InferenceResponse`](crate::scheduler::InferenceResponse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::QueueFull).unwrap();
        assert_eq!(json, "\"QUEUE_FULL\"");
        let json = serde_json::to_string(&ErrorKind::NoModelAvailable).unwrap();
        assert_eq!(json, "\"NO_MODEL_AVAILABLE\"");
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(ErrorKind::ThermalEmergency.to_string(), "THERMAL_EMERGENCY");
    }
}
