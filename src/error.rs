use std::time::Duration;

/// The error taxonomy surfaced to callers of this crate.
///
/// `Config` and `Connect` only ever happen before a socket is usable;
/// `Io` happens after. `Timeout`, `Closed`, and `DuplicateActionId` are
/// waiter-local outcomes rather than socket failures.
#[derive(Debug, thiserror::Error)]
pub enum AmiError {
    #[error("invalid connection config: {0}")]
    Config(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("response timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("duplicate ActionID {0}: a waiter is already registered")]
    DuplicateActionId(String),

    #[error("key {0:?} is not part of this record's schema")]
    SchemaViolation(String),
}

pub type Result<T> = std::result::Result<T, AmiError>;
