use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatmuxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Other error: {0}")]
    Other(String),
}

/// Failures of the session lifecycle itself. Everything here is scoped to a
/// single session identifier and never propagates across sessions.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("pairing credential expired before confirmation")]
    PairingExpired,

    #[error("a start is already in flight for session {0}")]
    AlreadyStarting(i32),

    #[error("no session record with id {0}")]
    NotFound(i32),

    #[error("session {id} gave up after {attempts} failed connection attempts")]
    MaxRetriesExceeded { id: i32, attempts: u32 },

    #[error("transport reported a fatal condition: {0}")]
    TransportFatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal transport conditions stay fatal; everything else surfaces as a
/// handshake failure, which the reconnect policy treats as recoverable.
impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Fatal(reason) => SessionError::TransportFatal(reason),
            TransportError::Handshake(reason) => SessionError::Handshake(reason),
            other => SessionError::Handshake(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(i32),
}
