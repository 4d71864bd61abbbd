//! Embedded engine abstraction.

use crate::error::{CoreError, CoreResult};
use crate::status::EngineError;
use dbxlink_codec::{push_block, ArgView, Command, DataType, Sort};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Result of an engine call.
pub type EngineResult<T> = Result<T, EngineError>;

/// A typed value returned by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// How to interpret `data`.
    pub ty: DataType,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Reply {
    /// An empty string.
    pub fn empty() -> Self {
        Self::bytes(Vec::new())
    }

    /// A narrow string.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            ty: DataType::Str8,
            data: data.into(),
        }
    }

    /// A narrow string from text.
    pub fn text(s: impl AsRef<str>) -> Self {
        Self::bytes(s.as_ref().as_bytes())
    }

    /// An integer.
    pub fn integer(n: i64) -> Self {
        Self {
            ty: DataType::Int64,
            data: n.to_string().into_bytes(),
        }
    }

    /// An object reference.
    pub fn object_ref(handle: u64) -> Self {
        Self {
            ty: DataType::ObjectRef,
            data: handle.to_string().into_bytes(),
        }
    }

    /// A sequence of sub-blocks, used for multi-value replies such as
    /// subscript plus data.
    pub fn blocks(parts: &[(Sort, &[u8])]) -> Self {
        let mut data = Vec::new();
        for (sort, bytes) in parts {
            // A single sub-block never exceeds the u32 length field here.
            let _ = push_block(&mut data, bytes, *sort, DataType::Str8);
        }
        Self {
            ty: DataType::None,
            data,
        }
    }
}

/// How a transaction body asks the engine to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionVerdict {
    /// Make the transaction's changes permanent.
    Commit,
    /// Undo the transaction's changes.
    Rollback,
}

/// An in-process engine session.
///
/// Engines that run transactions through a reentrant callback implement
/// [`Engine::run_transaction`]: the engine opens a transaction, invokes
/// `body` on the calling thread, and finishes according to the verdict the
/// body returns. While `body` runs, every transaction-scoped call must come
/// from that same thread.
pub trait Engine: Send + Sync {
    /// Executes one non-transaction-control command.
    fn call(&self, command: Command, args: &[ArgView<'_>]) -> EngineResult<Reply>;

    /// Runs `body` inside a new (possibly nested) transaction.
    fn run_transaction(
        &self,
        body: &mut dyn FnMut() -> TransactionVerdict,
    ) -> EngineResult<TransactionVerdict>;

    /// Current transaction nesting depth.
    fn transaction_level(&self) -> u32;

    /// Engine version string.
    fn version(&self) -> String;
}

/// Runs one engine call; a panic inside the engine becomes
/// [`CoreError::Panicked`] instead of unwinding through the caller.
pub(crate) fn guarded_call(
    engine: &dyn Engine,
    command: Command,
    args: &[ArgView<'_>],
) -> CoreResult<Reply> {
    match catch_unwind(AssertUnwindSafe(|| engine.call(command, args))) {
        Ok(result) => Ok(result?),
        Err(_) => {
            warn!(%command, "engine call panicked");
            Err(CoreError::Panicked {
                what: "engine call",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbxlink_codec::BlockReader;

    #[test]
    fn reply_constructors() {
        assert_eq!(Reply::text("x").data, b"x");
        assert_eq!(Reply::integer(-3).ty, DataType::Int64);
        assert_eq!(Reply::object_ref(12).data, b"12");
        assert!(Reply::empty().data.is_empty());
    }

    #[test]
    fn multi_value_reply() {
        let reply = Reply::blocks(&[(Sort::Subscript, &b"3"[..]), (Sort::Data, &b"three"[..])]);
        let views = BlockReader::new(&reply.data).collect_views().unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].text(), "3");
        assert_eq!(views[1].sort, Sort::Data);
    }
}
