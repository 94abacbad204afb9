//! Error taxonomy for synchronization.
//!
//! `SyncError` is what a fetch cycle can end with. Errors that have a fallback
//! path (transport failures, "not found") are resolved inside the fetch
//! coordinator; only the ones without a fallback reach listeners.

use std::fmt;

use http::StatusCode;

/// Error produced by a synchronization cycle.
///
/// Cloneable so a single failure can be fanned out to every listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned status {status}")]
    Server { status: u16 },

    #[error("Failed to parse payload: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Payload contained no posts")]
    EmptyPayload,
}

/// Field-less classification of [`SyncError`] handed to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Server,
    Parse,
    Configuration,
    Cancelled,
    EmptyPayload,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Server => "server",
            ErrorKind::Parse => "parse",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::EmptyPayload => "empty_payload",
        };
        write!(f, "{}", name)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::Server { .. } => ErrorKind::Server,
            SyncError::Parse(_) => ErrorKind::Parse,
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::EmptyPayload => ErrorKind::EmptyPayload,
        }
    }

    /// The server answered "not found" (thread pruned or deleted)
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Server { status } if *status == StatusCode::NOT_FOUND.as_u16())
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Whether the coordinator may answer this error with a stored copy
    pub fn has_fallback(&self) -> bool {
        matches!(self, SyncError::Transport(_)) || self.is_not_found()
    }

    /// Configuration errors are reported once and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Configuration(_))
    }
}

/// Failure of the transport capability before any HTTP status was received.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        SyncError::Transport(e.to_string())
    }
}

/// Failure reported by the durable post store. Logged by the coordinator,
/// never surfaced to listeners.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by a mirror lookup. Never propagated past the coordinator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Mirror lookup failed: {0}")]
pub struct MirrorError(pub String);

/// The payload parser rejected the response body.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl From<ParseError> for SyncError {
    fn from(e: ParseError) -> Self {
        SyncError::Parse(e.0)
    }
}

/// The cache actor has stopped and can no longer answer requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Cache actor closed")]
    Closed,
}
