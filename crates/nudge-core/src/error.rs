//! Error taxonomy for the engine.
//!
//! Every core operation returns `Result<T, Error>`; nothing panics across a
//! component boundary. The HTTP adapter maps variants onto status codes, so
//! the discriminants here are the contract with callers.

use crate::types::Status;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// State-related refusals: the operation is well-formed but the current
/// world does not permit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("reminder not found: {0}")]
    NotFound(String),
    #[error("duplicate reminder id: {0}")]
    Duplicate(String),
    #[error("reminder is immutable in state {0}")]
    ImmutableState(Status),
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("concurrent modification")]
    Version,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Carries the offending field so callers can point
    /// at it. Never logged above `info`.
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// Transport failure worth retrying (network, rate limit, 5xx).
    #[error("transient transport failure: {message}")]
    TransportTransient {
        message: String,
        /// Server-advertised backoff, honored when larger than ours.
        retry_after: Option<Duration>,
    },

    /// Transport failure that retrying cannot fix (unknown recipient,
    /// rejected content).
    #[error("permanent transport failure: {message}")]
    TransportPermanent { message: String },

    #[error("store error: {0}")]
    Store(String),

    /// Programmer error or invariant breach. Logged at `error`; the
    /// operation fails but the process continues.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::TransportTransient {
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::TransportPermanent {
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::Conflict(Conflict::NotFound(id.into()))
    }

    /// True for store commits rejected by a version check; the caller
    /// should re-read and retry a bounded number of times.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::Conflict(Conflict::Version))
    }

    pub fn is_transient_transport(&self) -> bool {
        matches!(self, Self::TransportTransient { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransportTransient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
