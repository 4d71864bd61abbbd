//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default upper bound on a request body.
pub const DEFAULT_MAX_REQUEST_LEN: usize = 16 * 1024 * 1024;

/// Configuration for the wire server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client sessions.
    pub max_connections: usize,
    /// Idle limit while waiting for the next request; `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Largest request body accepted, in bytes.
    pub max_request_len: usize,
    /// Version string sent in the handshake; defaults to the engine's.
    pub version: Option<String>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            read_timeout: Some(Duration::from_secs(300)),
            max_request_len: DEFAULT_MAX_REQUEST_LEN,
            version: None,
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the per-request idle timeout.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the largest accepted request body.
    pub fn with_max_request_len(mut self, len: usize) -> Self {
        self.max_request_len = len;
        self
    }

    /// Overrides the version string reported in the handshake.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 1972)))
    }
}
