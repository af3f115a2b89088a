//! Error taxonomy carried on a DTR.
//!
//! An error here is data, not a propagated failure: every state handler in
//! the scheduler branches on `(status, error)` and decides where the
//! request goes next. Only when retries are exhausted (or the kind is
//! permanent) does the error surface as the terminal `ERROR` status.

use crate::status::DtrStatus;

/// Classification of a DTR failure, used to decide retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("temporary remote error")]
    TemporaryRemote,

    #[error("transfer speed below configured limits")]
    TransferSpeed,

    #[error("internal process error")]
    InternalProcess,

    #[error("internal logic error")]
    InternalLogic,

    #[error("staging request timed out")]
    StagingTimeout,

    #[error("cache error")]
    Cache,

    #[error("permanent error")]
    Permanent,

    #[error("cannot replicate a file to itself")]
    SelfReplication,
}

impl ErrorKind {
    /// Kinds retried automatically while the retry budget lasts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TemporaryRemote | ErrorKind::TransferSpeed | ErrorKind::InternalProcess
        )
    }
}

/// Which endpoint the failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocation {
    Source,
    Destination,
    Unknown,
    None,
}

/// Failure state carried on a DTR.
#[derive(Debug, Clone)]
pub struct DtrError {
    pub kind: ErrorKind,
    pub location: ErrorLocation,
    pub message: String,
    /// Status the DTR had when the error was recorded, used to pick the
    /// retry re-entry point.
    pub last_error_state: DtrStatus,
}

impl DtrError {
    pub fn new(
        kind: ErrorKind,
        location: ErrorLocation,
        message: impl Into<String>,
        last_error_state: DtrStatus,
    ) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
            last_error_state,
        }
    }
}
