//! # dbxlink Server
//!
//! Reference TCP server for the dbxlink wire protocol.
//!
//! This crate provides:
//! - A thread-per-client listener with a connection limit
//! - Banner handshake and namespace selection
//! - Request decoding and execution against a [`dbxlink_core::MemoryEngine`]
//!
//! # Architecture
//!
//! Every client session wraps its own engine session in an embedded
//! [`dbxlink_core::Connection`]. Requests go through the same dispatcher an
//! in-process caller uses, so a transaction started over the wire is pinned
//! to a dedicated thread and closing the socket rolls it back.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::{ServerConfig, DEFAULT_MAX_REQUEST_LEN};
pub use error::{ServerError, ServerResult};
pub use handler::{error_response, RequestHandler};
pub use server::{RunningServer, WireServer};
