//! Connection lifecycle and execution paths.

use crate::arena::{Arena, ArenaStats, RequestContext};
use crate::config::{Backend, ConnectionConfig, ErrorMode, ResultMode};
use crate::dispatch::{Outcome, Request};
use crate::engine::{guarded_call, Engine, Reply, TransactionVerdict};
use crate::error::{CoreError, CoreResult};
use crate::pool::WorkerPool;
use crate::status::{EngineError, ErrorKind};
use crate::transaction::TransactionCoordinator;
use crate::wire::WireClient;
use dbxlink_codec::{Arg, Command, DataType, ServerVersion};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, info, warn};

enum BackendState {
    Embedded {
        engine: Arc<dyn Engine>,
        lock: Mutex<()>,
        transactions: TransactionCoordinator,
    },
    Network {
        client: Mutex<WireClient>,
    },
}

pub(crate) struct ConnectionInner {
    backend: BackendState,
    arena: Arena,
    pool: Option<WorkerPool>,
    open: AtomicBool,
    last_error: Mutex<Option<String>>,
    wide: bool,
    error_mode: ErrorMode,
    result_mode: ResultMode,
    pub(crate) deferred: bool,
}

/// A shared handle to one engine session.
///
/// Clones refer to the same session. Calls are serialized per connection;
/// while a transaction is open they are relayed to its pinned thread.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Opens a connection.
    ///
    /// Any failure here is a connection error.
    pub fn open(config: ConnectionConfig) -> CoreResult<Self> {
        if config.deferred && config.workers == 0 {
            return Err(CoreError::invalid_argument(
                "deferred execution needs at least one worker",
            ));
        }

        let backend = match &config.backend {
            Backend::Embedded(engine) => BackendState::Embedded {
                engine: Arc::clone(engine),
                lock: Mutex::new(()),
                transactions: TransactionCoordinator::new(Arc::clone(engine), config.relay_timeout),
            },
            Backend::Network { address } => BackendState::Network {
                client: Mutex::new(WireClient::connect(
                    address,
                    &config.namespace,
                    config.connect_timeout,
                    config.read_timeout,
                )?
                .with_max_response_len(config.max_response_len)),
            },
        };
        let pool = match config.workers {
            0 => None,
            n => Some(WorkerPool::new(n)?),
        };

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                backend,
                arena: Arena::new(config.arena_capacity),
                pool,
                open: AtomicBool::new(true),
                last_error: Mutex::new(None),
                wide: config.wide_chars,
                error_mode: config.error_mode,
                result_mode: config.result_mode,
                deferred: config.deferred,
            }),
        };

        if matches!(connection.inner.backend, BackendState::Embedded { .. })
            && !config.namespace.is_empty()
        {
            let select = Request::new(Command::NamespaceSet).data(Arg::text(&config.namespace));
            connection.inner.run(&select, true).map_err(|e| {
                CoreError::connection(format!("cannot select namespace {}: {e}", config.namespace))
            })?;
        }

        info!(backend = ?config.backend, namespace = %config.namespace, "connection opened");
        Ok(connection)
    }

    /// Closes the connection.
    ///
    /// Open transactions are rolled back and their threads joined. Closing
    /// twice is harmless.
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }
        match &self.inner.backend {
            BackendState::Embedded {
                lock, transactions, ..
            } => {
                let _guard = lock.lock();
                transactions.rollback_all();
            }
            BackendState::Network { client } => {
                let mut client = client.lock();
                if client.is_connected() {
                    if let Ok(mut ctx) = self.inner.arena.acquire(self.inner.wide, false) {
                        let _ = client.send_command(Command::Close, &mut ctx);
                    }
                }
                client.close();
            }
        }
        info!("connection closed");
    }

    /// Returns true until the connection is closed or fails fatally.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Text of the most recent error reported on this connection.
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Version of the engine or server.
    pub fn server_version(&self) -> CoreResult<ServerVersion> {
        match &self.inner.backend {
            BackendState::Embedded { engine, .. } => Ok(ServerVersion::parse(&engine.version())?),
            BackendState::Network { client } => Ok(client.lock().version().clone()),
        }
    }

    /// Request buffer usage counters.
    pub fn arena_stats(&self) -> ArenaStats {
        self.inner.arena.stats()
    }

    /// Thread pinned to transaction `level` on an embedded connection.
    pub fn pinned_thread(&self, level: u32) -> Option<ThreadId> {
        match &self.inner.backend {
            BackendState::Embedded { transactions, .. } => transactions.pinned_thread(level),
            BackendState::Network { .. } => None,
        }
    }

    /// Opens a (possibly nested) transaction and returns the new level.
    pub fn begin_transaction(&self) -> CoreResult<u32> {
        self.transaction_call(Command::TStart)
    }

    /// Commits the innermost transaction and returns the remaining level.
    pub fn commit(&self) -> CoreResult<u32> {
        self.transaction_call(Command::TCommit)
    }

    /// Rolls back the innermost transaction and returns the remaining level.
    pub fn rollback(&self) -> CoreResult<u32> {
        self.transaction_call(Command::TRollback)
    }

    /// Current transaction nesting level.
    pub fn nesting_level(&self) -> CoreResult<u32> {
        self.transaction_call(Command::TLevel)
    }

    fn transaction_call(&self, command: Command) -> CoreResult<u32> {
        let mut outcome = match self.dispatch(&Request::new(command)) {
            Err(CoreError::Engine(e)) => return Err(transaction_error(e)),
            other => other?,
        };
        if let Some(e) = outcome.error.take() {
            return Err(transaction_error(e));
        }
        outcome
            .as_i64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| CoreError::protocol(format!("{command} returned {:?}", outcome.text())))
    }
}

fn transaction_error(e: EngineError) -> CoreError {
    if e.kind == ErrorKind::NoTransaction {
        CoreError::NoTransaction
    } else {
        CoreError::Engine(e)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .field("deferred", &self.inner.deferred)
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    pub(crate) fn pool(&self) -> CoreResult<&WorkerPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| CoreError::invalid_argument("no worker pool configured"))
    }

    /// Stages, executes and normalizes one request.
    ///
    /// `reuse` asks for the connection's singleton buffer; pool workers
    /// pass false since they run concurrently with the caller.
    pub(crate) fn run(&self, request: &Request, reuse: bool) -> CoreResult<Outcome> {
        if !self.open.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        let command = request.command();
        let mut ctx = self.arena.acquire(self.wide, reuse)?;
        let result = request
            .stage(&mut ctx)
            .and_then(|()| self.execute(command, &mut ctx));
        let outcome = self.normalize(command, &ctx, result);
        self.arena.release(ctx);
        outcome
    }

    fn execute(&self, command: Command, ctx: &mut RequestContext) -> CoreResult<()> {
        match &self.backend {
            BackendState::Network { client } => client.lock().send_command(command, ctx),
            BackendState::Embedded {
                engine,
                lock,
                transactions,
            } => {
                // Held across transaction control and relays too, so the
                // level cannot change between the check and the call.
                let _guard = lock.lock();
                if command.is_transaction_control() {
                    let level = match command {
                        Command::TStart => transactions.begin()?,
                        Command::TCommit => transactions.end(TransactionVerdict::Commit)?,
                        Command::TRollback => transactions.end(TransactionVerdict::Rollback)?,
                        _ => transactions.engine_level()?,
                    };
                    return ctx.set_reply(&Reply::integer(i64::from(level)));
                }

                if transactions.level() > 0 {
                    let owned = std::mem::replace(ctx, RequestContext::placeholder());
                    let (returned, result) = transactions.relay(command, owned)?;
                    *ctx = returned;
                    return ctx.set_reply(&result?);
                }

                let reply = {
                    let args = ctx.args();
                    guarded_call(engine.as_ref(), command, &args)?
                };
                ctx.set_reply(&reply)
            }
        }
    }

    fn normalize(
        &self,
        command: Command,
        ctx: &RequestContext,
        result: CoreResult<()>,
    ) -> CoreResult<Outcome> {
        match result {
            Ok(()) => Ok(Outcome::success(
                ctx.reply_type(),
                ctx.output().to_vec(),
                self.result_mode,
            )),
            Err(CoreError::Engine(e))
                if command == Command::Get && e.kind == ErrorKind::Undefined =>
            {
                Ok(Outcome::success(
                    DataType::Str8,
                    Vec::new(),
                    self.result_mode,
                ))
            }
            Err(CoreError::Engine(e)) => {
                debug!(%command, error = %e, "engine error");
                *self.last_error.lock() = Some(e.to_wire_text());
                match self.error_mode {
                    ErrorMode::Raise => Err(CoreError::Engine(e)),
                    ErrorMode::Return => Ok(Outcome::failure(e, self.result_mode)),
                }
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                if e.is_fatal() {
                    warn!(%command, error = %e, "connection failed");
                    self.open.store(false, Ordering::Release);
                }
                Err(e)
            }
        }
    }
}

impl Request {
    pub(crate) fn stage(&self, ctx: &mut RequestContext) -> CoreResult<()> {
        for (sort, arg) in self.args() {
            ctx.push_arg(*sort, arg)?;
        }
        ctx.set_command(self.command());
        Ok(())
    }
}
