//! Connection configuration.

use crate::arena::DEFAULT_ARENA_CAPACITY;
use crate::engine::Engine;
use crate::memory::DEFAULT_NAMESPACE;
use crate::wire::DEFAULT_MAX_RESPONSE_LEN;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where operations are executed.
#[derive(Clone)]
pub enum Backend {
    /// An in-process engine session.
    Embedded(Arc<dyn Engine>),
    /// A remote server speaking the block protocol.
    Network {
        /// `host:port` of the server.
        address: String,
    },
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Embedded(engine) => f
                .debug_tuple("Embedded")
                .field(&engine.version())
                .finish(),
            Backend::Network { address } => {
                f.debug_struct("Network").field("address", address).finish()
            }
        }
    }
}

/// What to do with an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Return it as `Err(CoreError::Engine(..))`.
    #[default]
    Raise,
    /// Return it inside a failed [`Outcome`](crate::Outcome).
    Return,
}

/// How callers want result payloads presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultMode {
    /// Decode payloads to strings.
    #[default]
    Text,
    /// Hand payloads over as raw bytes.
    Binary,
}

/// Configuration for a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Execution backend.
    pub backend: Backend,
    /// Namespace selected at open.
    pub namespace: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Per-read (and per-write) socket timeout; `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Stage strings as UTF-16.
    pub wide_chars: bool,
    /// Engine error presentation.
    pub error_mode: ErrorMode,
    /// Result payload presentation.
    pub result_mode: ResultMode,
    /// Worker threads for deferred execution; 0 disables the pool.
    pub workers: usize,
    /// Route every dispatch through the worker pool.
    pub deferred: bool,
    /// Initial capacity of request buffers.
    pub arena_capacity: usize,
    /// Bound on a pinned-thread round trip; `None` waits forever.
    pub relay_timeout: Option<Duration>,
    /// Largest response payload accepted from a server.
    pub max_response_len: usize,
}

impl ConnectionConfig {
    /// Creates a configuration for `backend` with default settings.
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(30)),
            wide_chars: false,
            error_mode: ErrorMode::default(),
            result_mode: ResultMode::default(),
            workers: 0,
            deferred: false,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            relay_timeout: None,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
        }
    }

    /// Configuration for an in-process engine.
    pub fn embedded(engine: Arc<dyn Engine>) -> Self {
        Self::new(Backend::Embedded(engine))
    }

    /// Configuration for a remote server.
    pub fn network(address: impl Into<String>) -> Self {
        Self::new(Backend::Network {
            address: address.into(),
        })
    }

    /// Sets the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the socket read timeout.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enables UTF-16 strings.
    pub fn with_wide_chars(mut self, wide: bool) -> Self {
        self.wide_chars = wide;
        self
    }

    /// Sets the error mode.
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    /// Sets the result mode.
    pub fn with_result_mode(mut self, mode: ResultMode) -> Self {
        self.result_mode = mode;
        self
    }

    /// Starts a worker pool of `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Routes every dispatch through the worker pool.
    pub fn with_deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    /// Sets the initial request buffer capacity.
    pub fn with_arena_capacity(mut self, capacity: usize) -> Self {
        self.arena_capacity = capacity;
        self
    }

    /// Bounds pinned-thread round trips.
    pub fn with_relay_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.relay_timeout = timeout;
        self
    }

    /// Caps response payloads read from a server.
    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }
}
