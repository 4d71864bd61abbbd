//! Error types for the wire server.

use dbxlink_codec::CodecError;
use dbxlink_core::{CoreError, EngineError, ErrorKind};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the wire server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request bytes.
    #[error("invalid request: {0}")]
    Codec(#[from] CodecError),

    /// The handshake was rejected.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// Request body exceeds the configured limit.
    #[error("request of {len} bytes exceeds limit of {limit}")]
    RequestTooLarge {
        /// Announced body length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Too many concurrent sessions.
    #[error("connection limit of {0} reached")]
    TooManyConnections(usize),

    /// Failure while executing a request.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// The error as reported to the client in an ERROR block.
    pub fn to_engine_error(&self) -> EngineError {
        match self {
            ServerError::Core(CoreError::Engine(e)) => e.clone(),
            ServerError::Core(CoreError::NoTransaction) => {
                EngineError::new(ErrorKind::NoTransaction, "")
            }
            ServerError::Codec(e) => EngineError::new(ErrorKind::Syntax, e.to_string()),
            ServerError::Handshake(message) => {
                EngineError::new(ErrorKind::Namespace, message.clone())
            }
            other => EngineError::new(ErrorKind::Other, other.to_string()),
        }
    }

    /// Returns true if the session cannot continue after this error.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::Handshake(_)
                | ServerError::RequestTooLarge { .. }
                | ServerError::TooManyConnections(_)
        )
    }
}
