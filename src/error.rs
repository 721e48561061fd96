use thiserror::Error;

/// Errors surfaced by timer transitions and the local store.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("remote write failure: {0}")]
    RemoteWriteFailure(String),
    #[error("no authenticated user")]
    Unauthenticated,
    #[error("recovery data corrupt: {0}")]
    RecoveryDataCorrupt(String),
    #[error("state lock poisoned: {0}")]
    StateLock(String),
}

impl TimerError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        TimerError::InvalidState(msg.into())
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, TimerError::InvalidState(_))
    }
}

impl From<rusqlite::Error> for TimerError {
    fn from(e: rusqlite::Error) -> Self {
        TimerError::PersistenceFailure(e.to_string())
    }
}

impl From<LedgerError> for TimerError {
    fn from(e: LedgerError) -> Self {
        TimerError::RemoteWriteFailure(e.to_string())
    }
}

/// Errors produced by a remote ledger backend.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("ledger unreachable: {0}")]
    Unreachable(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload: {0}")]
    Payload(String),
    #[error("ledger auth: {0}")]
    Unauthenticated(String),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification platform unavailable: {0}")]
    Unavailable(String),
    #[error("notification time already passed: {0}")]
    InPast(String),
}
