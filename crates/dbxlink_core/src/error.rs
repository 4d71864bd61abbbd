//! Error types for dbxlink core.

use crate::status::EngineError;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while carrying an operation to a backend engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The backend could not be reached or refused the session.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// Malformed or truncated frame, short read/write, or read timeout.
    ///
    /// The socket has been dropped; the connection must be reopened.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the failure.
        message: String,
    },

    /// The engine rejected a well-formed operation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A scratch buffer could not be grown.
    #[error("out of memory: could not reserve {requested} bytes")]
    OutOfMemory {
        /// Bytes that were requested.
        requested: usize,
    },

    /// The connection has been closed.
    #[error("connection is closed")]
    Closed,

    /// A transaction operation was issued with no transaction open.
    #[error("no transaction is open")]
    NoTransaction,

    /// A bounded wait expired before the work finished.
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The worker pool is shutting down.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// A deferred task or pinned transaction thread panicked.
    #[error("{what} panicked")]
    Panicked {
        /// Which thread role panicked.
        what: &'static str,
    },

    /// The pinned transaction thread is gone.
    #[error("transaction thread failed: {message}")]
    TransactionThread {
        /// Description of the failure.
        message: String,
    },

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Wire encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] dbxlink_codec::CodecError),

    /// I/O error outside an established session.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a transaction thread error.
    pub fn transaction_thread(message: impl Into<String>) -> Self {
        Self::TransactionThread {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns true if the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Connection { .. } | CoreError::Protocol { .. } | CoreError::Closed
        )
    }

    /// Returns the engine error, if this is one.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            CoreError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ErrorKind;

    #[test]
    fn fatal_classification() {
        assert!(CoreError::protocol("short read").is_fatal());
        assert!(CoreError::connection("refused").is_fatal());
        assert!(!CoreError::NoTransaction.is_fatal());
        assert!(!CoreError::from(EngineError::new(ErrorKind::Undefined, "^A")).is_fatal());
    }

    #[test]
    fn error_display() {
        let err = CoreError::Timeout {
            what: "relay reply",
            waited_ms: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("250"));
        assert!(msg.contains("relay reply"));
    }
}
