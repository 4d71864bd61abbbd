//! Engine status codes and their mapping to error kinds.
//!
//! Engines report failures as a numeric status plus text. The dispatcher
//! folds every status into one of a small set of [`ErrorKind`]s so callers
//! can branch without knowing vendor codes. On the wire an engine error
//! travels as ERROR-block text of the form `<MNEMONIC>detail`.

use std::fmt;

/// Numeric status codes reported by engines.
pub mod codes {
    /// Node has no data.
    pub const UNDEFINED: i32 = 6;
    /// Missing or malformed subscript or global name.
    pub const SUBSCRIPT: i32 = 8;
    /// Access denied.
    pub const PROTECT: i32 = 12;
    /// Lock could not be acquired in time.
    pub const LOCK_TIMEOUT: i32 = 14;
    /// Commit or rollback with no open transaction.
    pub const NO_TRANSACTION: i32 = 17;
    /// Function or method is not registered.
    pub const NO_ROUTINE: i32 = 21;
    /// Object reference does not name a live object.
    pub const INVALID_OREF: i32 = 23;
    /// Transaction-scoped call from a thread other than the pinned one.
    pub const THREAD: i32 = 27;
    /// Malformed arguments.
    pub const SYNTAX: i32 = 31;
    /// Unknown namespace.
    pub const NAMESPACE: i32 = 33;
    /// Anything else.
    pub const OTHER: i32 = 99;
}

/// Descriptive error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Node has no data.
    Undefined,
    /// Invalid subscript or global name.
    Subscript,
    /// Access denied.
    Protect,
    /// Lock timed out.
    LockTimeout,
    /// No transaction open.
    NoTransaction,
    /// Function or method not found.
    UnknownFunction,
    /// Object reference is not valid.
    InvalidObject,
    /// Call arrived on the wrong thread for the open transaction.
    ThreadAffinity,
    /// Malformed arguments.
    Syntax,
    /// Unknown namespace.
    Namespace,
    /// Unclassified failure.
    Other,
}

const KINDS: [ErrorKind; 11] = [
    ErrorKind::Undefined,
    ErrorKind::Subscript,
    ErrorKind::Protect,
    ErrorKind::LockTimeout,
    ErrorKind::NoTransaction,
    ErrorKind::UnknownFunction,
    ErrorKind::InvalidObject,
    ErrorKind::ThreadAffinity,
    ErrorKind::Syntax,
    ErrorKind::Namespace,
    ErrorKind::Other,
];

impl ErrorKind {
    /// Maps an engine status code to its kind.
    pub fn from_code(code: i32) -> Self {
        KINDS
            .iter()
            .copied()
            .find(|k| k.code() == code)
            .unwrap_or(ErrorKind::Other)
    }

    /// Canonical status code for this kind.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Undefined => codes::UNDEFINED,
            ErrorKind::Subscript => codes::SUBSCRIPT,
            ErrorKind::Protect => codes::PROTECT,
            ErrorKind::LockTimeout => codes::LOCK_TIMEOUT,
            ErrorKind::NoTransaction => codes::NO_TRANSACTION,
            ErrorKind::UnknownFunction => codes::NO_ROUTINE,
            ErrorKind::InvalidObject => codes::INVALID_OREF,
            ErrorKind::ThreadAffinity => codes::THREAD,
            ErrorKind::Syntax => codes::SYNTAX,
            ErrorKind::Namespace => codes::NAMESPACE,
            ErrorKind::Other => codes::OTHER,
        }
    }

    /// Mnemonic used in error text.
    pub fn mnemonic(self) -> &'static str {
        match self {
            ErrorKind::Undefined => "UNDEFINED",
            ErrorKind::Subscript => "SUBSCRIPT",
            ErrorKind::Protect => "PROTECT",
            ErrorKind::LockTimeout => "LOCK TIMEOUT",
            ErrorKind::NoTransaction => "NO TRANSACTION",
            ErrorKind::UnknownFunction => "NOROUTINE",
            ErrorKind::InvalidObject => "INVALID OREF",
            ErrorKind::ThreadAffinity => "THREAD",
            ErrorKind::Syntax => "SYNTAX",
            ErrorKind::Namespace => "NAMESPACE",
            ErrorKind::Other => "ERROR",
        }
    }

    fn from_mnemonic(text: &str) -> Self {
        KINDS
            .iter()
            .copied()
            .find(|k| k.mnemonic() == text)
            .unwrap_or(ErrorKind::Other)
    }
}

/// A failure reported by an engine for a well-formed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Mapped category.
    pub kind: ErrorKind,
    /// Raw status code from the engine.
    pub code: i32,
    /// Detail text, usually naming the node or routine.
    pub message: String,
}

impl EngineError {
    /// Creates an error of the given kind with its canonical code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
        }
    }

    /// Creates an error from a raw engine status code.
    pub fn from_status(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_code(code),
            code,
            message: message.into(),
        }
    }

    /// Parses ERROR-block text of the form `<MNEMONIC>detail`.
    pub fn from_wire_text(text: &str) -> Self {
        if let Some(rest) = text.strip_prefix('<') {
            if let Some((mnemonic, detail)) = rest.split_once('>') {
                return Self::new(ErrorKind::from_mnemonic(mnemonic), detail);
            }
        }
        Self::new(ErrorKind::Other, text)
    }

    /// Formats the error for an ERROR block.
    pub fn to_wire_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{}", self.kind.mnemonic(), self.message)
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_kinds() {
        assert_eq!(ErrorKind::from_code(codes::UNDEFINED), ErrorKind::Undefined);
        assert_eq!(ErrorKind::from_code(codes::THREAD), ErrorKind::ThreadAffinity);
        assert_eq!(ErrorKind::from_code(12345), ErrorKind::Other);
        for kind in KINDS {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn wire_text_roundtrip() {
        let err = EngineError::new(ErrorKind::Undefined, "^A(1)");
        let text = err.to_wire_text();
        assert_eq!(text, "<UNDEFINED>^A(1)");
        assert_eq!(EngineError::from_wire_text(&text), err);
    }

    #[test]
    fn unstructured_text_is_other() {
        let err = EngineError::from_wire_text("disk on fire");
        assert_eq!(err.kind, ErrorKind::Other);
        assert_eq!(err.message, "disk on fire");
    }

    #[test]
    fn raw_status_keeps_code() {
        let err = EngineError::from_status(4242, "vendor specific");
        assert_eq!(err.kind, ErrorKind::Other);
        assert_eq!(err.code, 4242);
    }
}
