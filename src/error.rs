//! Error taxonomy shared by the mirror, cache and remote client.

use thiserror::Error;

/// Everything the mirror/cache core can fail with.
///
/// Nothing in the core retries; callers get the precise variant and decide
/// how to render it.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Network, auth, quota or payload failure reported by the remote API.
    #[error("remote call {operation} failed: {message}")]
    RemoteCall {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("malformed duration {0:?}")]
    MalformedDuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("invalid timestamp {value:?}: {reason}")]
    Timestamp { value: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MirrorError {
    pub fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::RemoteCall {
            operation,
            status: None,
            message: message.into(),
        }
    }

    pub fn remote_status(operation: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::RemoteCall {
            operation,
            status: Some(status),
            message: message.into(),
        }
    }
}

pub type MirrorResult<T> = std::result::Result<T, MirrorError>;
