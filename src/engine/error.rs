use thiserror::Error;
use ulid::Ulid;

use crate::model::{ModelError, Span};

/// Caller-facing category of a failure. Only `StoreUnavailable` may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Conflict,
    InvalidTransition,
    StoreUnavailable,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unknown {kind}: {id}")]
    NotFound { kind: &'static str, id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Carries the appointment that owns the external reference.
    #[error("external reference already booked as {0}")]
    DuplicateExternalRef(Ulid),
    #[error("conflict with appointment {appointment_id} occupying {interval}")]
    Conflict { appointment_id: Ulid, interval: Span },
    #[error("cannot {action} {id} while {from}")]
    InvalidTransition {
        id: Ulid,
        from: &'static str,
        action: String,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Validation(_)
            | EngineError::NotFound { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::DuplicateExternalRef(_)
            | EngineError::LimitExceeded(_)
            | EngineError::Model(_) => ErrorClass::Validation,
            EngineError::Conflict { .. } => ErrorClass::Conflict,
            EngineError::InvalidTransition { .. } => ErrorClass::InvalidTransition,
            EngineError::StoreUnavailable(_) => ErrorClass::StoreUnavailable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::StoreUnavailable
    }
}
