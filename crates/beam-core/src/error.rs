//! Error taxonomy for the coordination core.
//!
//! Every variant is recoverable and is reported to the originating
//! connection only; none of them crash the coordinator or affect other
//! connections.

use beam_protocol::SessionStatus;
use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown session key or unknown identity.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Session state-machine violation.
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// The publisher already owns a non-ended session.
    #[error("publisher already owns an active session")]
    PublisherBusy,

    /// Wrong role attempting a role-restricted action.
    #[error("{0}")]
    RoleConflict(String),

    /// Malformed request input.
    #[error("{0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Build a `NotFound` for an entity kind and its id.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable numeric code for the wire `Error` frame.
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            CoreError::InvalidInput(_) => 1003,
            CoreError::NotFound { .. } => 1004,
            CoreError::InvalidTransition { .. } => 1005,
            CoreError::PublisherBusy => 1006,
            CoreError::RoleConflict(_) => 1007,
        }
    }
}
