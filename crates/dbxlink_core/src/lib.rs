//! # dbxlink Core
//!
//! Carries database operations from a binding layer to an engine.
//!
//! This crate provides:
//! - A per-connection request arena whose buffers grow without
//!   invalidating staged arguments
//! - A fixed worker pool for deferred operations
//! - Transaction pinning: one OS thread per open nesting level, with every
//!   operation of that level relayed to it
//! - A socket client for the block protocol
//! - [`Connection`], whose dispatcher picks the execution path and
//!   normalizes results and errors
//! - [`MemoryEngine`], an in-process reference engine
//!
//! ## Example
//!
//! ```
//! use dbxlink_core::{Connection, ConnectionConfig, Key, MemoryEngine};
//! use std::sync::Arc;
//!
//! let engine = MemoryEngine::new();
//! let conn = Connection::open(ConnectionConfig::embedded(Arc::new(engine.session()))).unwrap();
//!
//! let key = Key::new("^Greeting").sub(1);
//! assert_eq!(conn.get(&key).unwrap().text(), "");
//! conn.set(&key, "hello").unwrap();
//! assert_eq!(conn.get(&key).unwrap().text(), "hello");
//!
//! conn.begin_transaction().unwrap();
//! conn.set(&key, "changed").unwrap();
//! conn.rollback().unwrap();
//! assert_eq!(conn.get(&key).unwrap().text(), "hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod config;
mod connection;
mod dispatch;
mod engine;
mod error;
pub mod memory;
mod pool;
mod status;
mod transaction;
mod wire;

pub use arena::{Arena, ArenaStats, ArgSlot, RequestContext, DEFAULT_ARENA_CAPACITY};
pub use config::{Backend, ConnectionConfig, ErrorMode, ResultMode};
pub use connection::Connection;
pub use dispatch::{Key, Outcome, Request, Value};
pub use engine::{Engine, EngineResult, Reply, TransactionVerdict};
pub use error::{CoreError, CoreResult};
pub use memory::{MemoryEngine, MemorySession};
pub use pool::{TaskHandle, WorkerPool};
pub use status::{codes, EngineError, ErrorKind};
pub use transaction::TransactionCoordinator;
pub use wire::{WireClient, DEFAULT_MAX_RESPONSE_LEN};

// Re-export the codec types that appear in this crate's API.
pub use dbxlink_codec::{Arg, ArgView, Command, DataType, ServerVersion, Sort};
