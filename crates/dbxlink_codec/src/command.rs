//! Command codes carried in the request envelope tag.

use crate::error::{CodecError, CodecResult};

/// Operations understood by a backend engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Open a session.
    Open = 1,
    /// Close a session.
    Close = 2,
    /// Read the current namespace.
    NamespaceGet = 3,
    /// Switch namespace.
    NamespaceSet = 4,
    /// Set a node.
    Set = 11,
    /// Read a node.
    Get = 12,
    /// Next sibling subscript.
    Next = 13,
    /// Previous sibling subscript.
    Previous = 14,
    /// Delete a node and its descendants.
    Delete = 15,
    /// Report whether a node has data and/or descendants.
    Defined = 16,
    /// Atomically add to a node.
    Increment = 17,
    /// Acquire a lock.
    Lock = 18,
    /// Release a lock.
    Unlock = 19,
    /// Copy a subtree.
    Merge = 20,
    /// Next node in depth-first order.
    NodeNext = 21,
    /// Previous node in depth-first order.
    NodePrevious = 22,
    /// Call a registered function.
    Function = 31,
    /// Call a class method.
    ClassMethod = 41,
    /// Read an object property.
    GetProperty = 42,
    /// Write an object property.
    SetProperty = 43,
    /// Invoke an object method.
    InvokeMethod = 44,
    /// Release an object reference.
    CloseObject = 45,
    /// Next global name.
    DirectoryNext = 51,
    /// Previous global name.
    DirectoryPrevious = 52,
    /// Start a transaction.
    TStart = 61,
    /// Report transaction nesting level.
    TLevel = 62,
    /// Commit the innermost transaction.
    TCommit = 63,
    /// Roll back the innermost transaction.
    TRollback = 64,
    /// Next sibling subscript with its data.
    NextData = 131,
    /// Previous sibling subscript with its data.
    PreviousData = 141,
    /// Next node with its data.
    NodeNextData = 211,
    /// Previous node with its data.
    NodePreviousData = 221,
}

impl Command {
    /// All commands, in code order.
    pub const ALL: [Command; 32] = [
        Command::Open,
        Command::Close,
        Command::NamespaceGet,
        Command::NamespaceSet,
        Command::Set,
        Command::Get,
        Command::Next,
        Command::Previous,
        Command::Delete,
        Command::Defined,
        Command::Increment,
        Command::Lock,
        Command::Unlock,
        Command::Merge,
        Command::NodeNext,
        Command::NodePrevious,
        Command::Function,
        Command::ClassMethod,
        Command::GetProperty,
        Command::SetProperty,
        Command::InvokeMethod,
        Command::CloseObject,
        Command::DirectoryNext,
        Command::DirectoryPrevious,
        Command::TStart,
        Command::TLevel,
        Command::TCommit,
        Command::TRollback,
        Command::NextData,
        Command::PreviousData,
        Command::NodeNextData,
        Command::NodePreviousData,
    ];

    /// Returns the wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> CodecResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.code() == code)
            .ok_or(CodecError::UnknownCommand(code))
    }

    /// Returns true for the four transaction control commands.
    pub fn is_transaction_control(self) -> bool {
        matches!(
            self,
            Command::TStart | Command::TLevel | Command::TCommit | Command::TRollback
        )
    }

    /// Short lowercase name, used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Command::Open => "open",
            Command::Close => "close",
            Command::NamespaceGet => "namespace_get",
            Command::NamespaceSet => "namespace_set",
            Command::Set => "set",
            Command::Get => "get",
            Command::Next => "next",
            Command::Previous => "previous",
            Command::Delete => "delete",
            Command::Defined => "defined",
            Command::Increment => "increment",
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::Merge => "merge",
            Command::NodeNext => "node_next",
            Command::NodePrevious => "node_previous",
            Command::Function => "function",
            Command::ClassMethod => "class_method",
            Command::GetProperty => "get_property",
            Command::SetProperty => "set_property",
            Command::InvokeMethod => "invoke_method",
            Command::CloseObject => "close_object",
            Command::DirectoryNext => "directory_next",
            Command::DirectoryPrevious => "directory_previous",
            Command::TStart => "tstart",
            Command::TLevel => "tlevel",
            Command::TCommit => "tcommit",
            Command::TRollback => "trollback",
            Command::NextData => "next_data",
            Command::PreviousData => "previous_data",
            Command::NodeNextData => "node_next_data",
            Command::NodePreviousData => "node_previous_data",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
