use thiserror::Error;
use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input. Rejected before any resource is touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Overlapping booking detected at commit time; carries the colliding appointment.
    #[error("conflict with appointment: {0}")]
    Conflict(Ulid),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// Storage failure underneath the ledger. The operation had no effect.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}
