//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while framing or parsing wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ends before a header or payload is complete.
    #[error("truncated block: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to finish the read.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Payload does not fit in the 32-bit length field.
    #[error("payload of {len} bytes exceeds the block length limit")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
    },

    /// Envelope tag does not name a known command.
    #[error("unknown command code: {0}")]
    UnknownCommand(u8),

    /// A payload could not be interpreted as its declared type.
    #[error("invalid {type_name} payload: {message}")]
    InvalidPayload {
        /// Name of the declared type.
        type_name: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// Handshake banner or version reply is malformed.
    #[error("invalid handshake: {message}")]
    InvalidHandshake {
        /// Description of the problem.
        message: String,
    },
}

impl CodecError {
    /// Creates a truncated-block error.
    pub fn truncated(needed: usize, available: usize) -> Self {
        Self::Truncated { needed, available }
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(type_name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            type_name,
            message: message.into(),
        }
    }

    /// Creates an invalid handshake error.
    pub fn invalid_handshake(message: impl Into<String>) -> Self {
        Self::InvalidHandshake {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CodecError::truncated(10, 4);
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('4'));

        let err = CodecError::UnknownCommand(200);
        assert_eq!(err.to_string(), "unknown command code: 200");
    }
}
