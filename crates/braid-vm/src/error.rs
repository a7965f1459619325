//! Admission errors and outcomes.

use braid_db::StoreError;
use braid_event::{ConformError, EventError};
use braid_types::Fault;
use serde::Serialize;

/// Result of one admission attempt, as a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Admitted. Ephemeral events report sequence 0.
    Accept { sequence: u64 },
    /// Already durable, or being admitted elsewhere.
    Exists,
    /// Rejected by conformance or authorization.
    Invalid { reason: String },
    /// Failed for any other reason.
    General { reason: String },
}

impl Outcome {
    /// Builds the outcome reported for a fault code.
    pub fn from_fault(code: Fault, reason: impl Into<String>) -> Self {
        match code {
            Fault::Accept => Self::Accept { sequence: 0 },
            Fault::Exists => Self::Exists,
            Fault::Invalid => Self::Invalid {
                reason: reason.into(),
            },
            Fault::General => Self::General {
                reason: reason.into(),
            },
        }
    }

    pub fn code(&self) -> Fault {
        match self {
            Self::Accept { .. } => Fault::Accept,
            Self::Exists => Fault::Exists,
            Self::Invalid { .. } => Fault::Invalid,
            Self::General { .. } => Fault::General,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }

    /// Sequence number of an accepted event.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Accept { sequence } => Some(*sequence),
            _ => None,
        }
    }
}

/// Errors raised while admitting an event.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A classified admission fault.
    #[error("{code}: {message}")]
    Fault { code: Fault, message: String },

    /// The admission was interrupted. Never classified.
    #[error("admission interrupted")]
    Interrupted,

    #[error("conformance: {0}")]
    Conform(#[from] ConformError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl VmError {
    pub fn exists(message: impl Into<String>) -> Self {
        Self::Fault {
            code: Fault::Exists,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Fault {
            code: Fault::Invalid,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::Fault {
            code: Fault::General,
            message: message.into(),
        }
    }

    /// Maps this error to its fault code. `None` for an interruption.
    pub fn classify(&self) -> Option<Fault> {
        match self {
            Self::Fault { code, .. } => Some(*code),
            Self::Interrupted => None,
            Self::Conform(_) => Some(Fault::Invalid),
            Self::Store(_) | Self::Event(_) | Self::Join(_) => Some(Fault::General),
        }
    }

    /// Message without the code prefix, as reported in an [`Outcome`].
    pub fn reason(&self) -> String {
        match self {
            Self::Fault { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_covers_every_variant() {
        assert_eq!(VmError::exists("dup").classify(), Some(Fault::Exists));
        assert_eq!(VmError::Interrupted.classify(), None);
        assert_eq!(
            VmError::Conform(ConformError::NegativeDepth(-1)).classify(),
            Some(Fault::Invalid)
        );
        assert_eq!(
            VmError::Store(StoreError::Incomplete("room_id")).classify(),
            Some(Fault::General)
        );
    }

    #[test]
    fn outcome_keeps_the_reason() {
        let err = VmError::general("missing prev_event $x");
        let outcome = Outcome::from_fault(err.classify().unwrap(), err.reason());
        assert_eq!(
            outcome,
            Outcome::General {
                reason: "missing prev_event $x".to_string()
            }
        );
        assert_eq!(outcome.code(), Fault::General);
        assert_eq!(outcome.sequence(), None);
    }

    #[test]
    fn outcome_serialises_with_code_tag() {
        let json = serde_json::to_value(Outcome::Accept { sequence: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({ "code": "ACCEPT", "sequence": 4 }));
    }
}
