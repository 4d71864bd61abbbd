//! Transaction pinning.
//!
//! Embedded engines run a transaction inside a reentrant callback and
//! insist that every call belonging to it comes from the thread blocked in
//! that callback. The coordinator spawns one such thread per open nesting
//! level and relays operations to it over a rendezvous channel; each relay
//! carries its own reply channel.
//!
//! Lifecycle of a level:
//!
//! ```text
//! begin ──spawn──> thread enters run_transaction ──ready──> OPEN
//! OPEN ──Call/Level──> pinned thread runs it ──reply──> OPEN
//! OPEN ──Finish(verdict)──> callback returns verdict ──join──> closed
//! ```

use crate::arena::RequestContext;
use crate::engine::{guarded_call, Engine, EngineResult, Reply, TransactionVerdict};
use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use dbxlink_codec::Command;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

type CallReply = (RequestContext, CoreResult<Reply>);

enum Relay {
    Call {
        command: Command,
        ctx: RequestContext,
        reply: Sender<CallReply>,
    },
    Level {
        reply: Sender<u32>,
    },
    Finish(TransactionVerdict),
}

struct PinnedTransaction {
    level: u32,
    requests: Sender<Relay>,
    thread: JoinHandle<EngineResult<TransactionVerdict>>,
}

/// Owns the pinned threads of one connection's open transactions.
pub struct TransactionCoordinator {
    engine: Arc<dyn Engine>,
    records: Mutex<Vec<PinnedTransaction>>,
    relay_timeout: Option<Duration>,
}

impl TransactionCoordinator {
    /// Creates a coordinator with no open transactions.
    ///
    /// With `relay_timeout` set, a round-trip that takes longer fails with
    /// [`CoreError::Timeout`]; the transaction stays open.
    pub fn new(engine: Arc<dyn Engine>, relay_timeout: Option<Duration>) -> Self {
        Self {
            engine,
            records: Mutex::new(Vec::new()),
            relay_timeout,
        }
    }

    /// Current nesting level as tracked by the coordinator.
    pub fn level(&self) -> u32 {
        self.records.lock().last().map_or(0, |r| r.level)
    }

    /// Thread pinned to `level`, if that level is open.
    pub fn pinned_thread(&self, level: u32) -> Option<ThreadId> {
        self.records
            .lock()
            .iter()
            .find(|r| r.level == level)
            .map(|r| r.thread.thread().id())
    }

    /// Opens a new nesting level and returns it.
    pub fn begin(&self) -> CoreResult<u32> {
        let mut records = self.records.lock();
        let level = u32::try_from(records.len() + 1)
            .map_err(|_| CoreError::invalid_argument("transaction nesting overflow"))?;

        let (requests, inbox) = bounded::<Relay>(0);
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let engine = Arc::clone(&self.engine);
        let thread = thread::Builder::new()
            .name(format!("dbxlink-txn-{level}"))
            .spawn(move || transaction_thread_main(engine.as_ref(), &ready_tx, &inbox))
            .map_err(|e| CoreError::connection(format!("cannot spawn transaction thread: {e}")))?;

        if ready_rx.recv().is_err() {
            // The engine returned without ever entering the body.
            return Err(match thread.join() {
                Ok(Err(e)) => CoreError::Engine(e),
                Ok(Ok(_)) => CoreError::transaction_thread("transaction ended before it opened"),
                Err(_) => CoreError::Panicked {
                    what: "transaction thread",
                },
            });
        }

        records.push(PinnedTransaction {
            level,
            requests,
            thread,
        });
        debug!(level, "transaction opened");
        Ok(level)
    }

    /// Runs `command` on the innermost transaction's pinned thread.
    ///
    /// The context travels to the pinned thread and back. If the wait times
    /// out, the context is lost with the abandoned reply.
    pub fn relay(&self, command: Command, ctx: RequestContext) -> CoreResult<CallReply> {
        let requests = self.innermost()?;
        let (reply, replies) = bounded(1);
        self.send(
            &requests,
            Relay::Call {
                command,
                ctx,
                reply,
            },
        )?;
        self.receive(&replies)
    }

    /// Asks the innermost pinned thread for the engine's nesting depth.
    ///
    /// With nothing open the engine is asked directly.
    pub fn engine_level(&self) -> CoreResult<u32> {
        let Ok(requests) = self.innermost() else {
            return Ok(self.engine.transaction_level());
        };
        let (reply, replies) = bounded(1);
        self.send(&requests, Relay::Level { reply })?;
        self.receive(&replies)
    }

    /// Finishes the innermost level and joins its thread.
    ///
    /// Returns the remaining nesting level.
    pub fn end(&self, verdict: TransactionVerdict) -> CoreResult<u32> {
        let mut records = self.records.lock();
        let record = records.pop().ok_or(CoreError::NoTransaction)?;
        let remaining = records.last().map_or(0, |r| r.level);
        drop(records);

        finish(record, verdict)?;
        Ok(remaining)
    }

    /// Rolls back every open level, innermost first.
    pub fn rollback_all(&self) {
        let records = std::mem::take(&mut *self.records.lock());
        for record in records.into_iter().rev() {
            let level = record.level;
            if let Err(e) = finish(record, TransactionVerdict::Rollback) {
                warn!(level, error = %e, "rollback of abandoned transaction failed");
            }
        }
    }

    fn innermost(&self) -> CoreResult<Sender<Relay>> {
        self.records
            .lock()
            .last()
            .map(|r| r.requests.clone())
            .ok_or(CoreError::NoTransaction)
    }

    fn send(&self, requests: &Sender<Relay>, relay: Relay) -> CoreResult<()> {
        let gone = || CoreError::transaction_thread("pinned thread is gone");
        match self.relay_timeout {
            None => requests.send(relay).map_err(|_| gone()),
            Some(timeout) => requests.send_timeout(relay, timeout).map_err(|e| match e {
                SendTimeoutError::Timeout(_) => CoreError::Timeout {
                    what: "pinned thread",
                    waited_ms: millis(timeout),
                },
                SendTimeoutError::Disconnected(_) => gone(),
            }),
        }
    }

    fn receive<T>(&self, replies: &Receiver<T>) -> CoreResult<T> {
        let gone = || CoreError::transaction_thread("pinned thread dropped the reply");
        match self.relay_timeout {
            None => replies.recv().map_err(|_| gone()),
            Some(timeout) => replies.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => CoreError::Timeout {
                    what: "relay reply",
                    waited_ms: millis(timeout),
                },
                RecvTimeoutError::Disconnected => gone(),
            }),
        }
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.rollback_all();
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("level", &self.level())
            .field("relay_timeout", &self.relay_timeout)
            .finish_non_exhaustive()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn finish(record: PinnedTransaction, verdict: TransactionVerdict) -> CoreResult<()> {
    let PinnedTransaction {
        level,
        requests,
        thread,
    } = record;
    // A failed send means the thread already left; dropping the sender
    // makes a still-waiting body roll back.
    let _ = requests.send(Relay::Finish(verdict));
    drop(requests);

    match thread.join() {
        Ok(Ok(outcome)) => {
            debug!(level, ?outcome, "transaction closed");
            Ok(())
        }
        Ok(Err(e)) => Err(CoreError::Engine(e)),
        Err(_) => Err(CoreError::Panicked {
            what: "transaction thread",
        }),
    }
}

fn transaction_thread_main(
    engine: &dyn Engine,
    ready: &Sender<()>,
    inbox: &Receiver<Relay>,
) -> EngineResult<TransactionVerdict> {
    let mut opened = false;
    engine.run_transaction(&mut || {
        if !opened {
            opened = true;
            if ready.send(()).is_err() {
                return TransactionVerdict::Rollback;
            }
        }
        // The engine must see the body return so it can unwind its frame.
        catch_unwind(AssertUnwindSafe(|| transaction_body(engine, inbox))).unwrap_or_else(|_| {
            warn!("transaction body panicked, rolling back");
            TransactionVerdict::Rollback
        })
    })
}

/// Serves relayed operations until told to finish.
fn transaction_body(engine: &dyn Engine, inbox: &Receiver<Relay>) -> TransactionVerdict {
    loop {
        match inbox.recv() {
            Ok(Relay::Call {
                command,
                ctx,
                reply,
            }) => {
                let result = {
                    let args = ctx.args();
                    guarded_call(engine, command, &args)
                };
                let _ = reply.send((ctx, result));
            }
            Ok(Relay::Level { reply }) => {
                let _ = reply.send(engine.transaction_level());
            }
            Ok(Relay::Finish(verdict)) => return verdict,
            Err(_) => {
                warn!("transaction abandoned, rolling back");
                return TransactionVerdict::Rollback;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::memory::MemoryEngine;
    use crate::status::ErrorKind;
    use dbxlink_codec::{Arg, Sort};

    fn coordinator() -> (MemoryEngine, TransactionCoordinator) {
        let engine = MemoryEngine::new();
        let session: Arc<dyn Engine> = Arc::new(engine.session());
        (engine, TransactionCoordinator::new(session, None))
    }

    fn ctx(arena: &Arena, args: &[(Sort, Arg)]) -> RequestContext {
        let mut ctx = arena.acquire(false, false).unwrap();
        for (sort, arg) in args {
            ctx.push_arg(*sort, arg).unwrap();
        }
        ctx
    }

    #[test]
    fn begin_relay_commit() {
        let (_engine, coord) = coordinator();
        let arena = Arena::new(64);
        assert_eq!(coord.begin().unwrap(), 1);

        let set = ctx(
            &arena,
            &[
                (Sort::GlobalName, Arg::text("^T")),
                (Sort::Data, Arg::text("v")),
            ],
        );
        let (_, result) = coord.relay(Command::Set, set).unwrap();
        result.unwrap();
        assert_eq!(coord.engine_level().unwrap(), 1);

        assert_eq!(coord.end(TransactionVerdict::Commit).unwrap(), 0);
        assert_eq!(coord.level(), 0);
        assert!(coord.pinned_thread(1).is_none());
    }

    #[test]
    fn levels_use_distinct_threads() {
        let (_engine, coord) = coordinator();
        coord.begin().unwrap();
        coord.begin().unwrap();
        let outer = coord.pinned_thread(1).unwrap();
        let inner = coord.pinned_thread(2).unwrap();
        assert_ne!(outer, inner);
        assert_ne!(outer, thread::current().id());

        assert_eq!(coord.end(TransactionVerdict::Rollback).unwrap(), 1);
        assert_eq!(coord.end(TransactionVerdict::Rollback).unwrap(), 0);
    }

    #[test]
    fn end_without_transaction() {
        let (_engine, coord) = coordinator();
        assert!(matches!(
            coord.end(TransactionVerdict::Commit),
            Err(CoreError::NoTransaction)
        ));
        let arena = Arena::new(64);
        assert!(matches!(
            coord.relay(Command::Get, ctx(&arena, &[])),
            Err(CoreError::NoTransaction)
        ));
    }

    #[test]
    fn relay_errors_keep_transaction_open() {
        let (_engine, coord) = coordinator();
        let arena = Arena::new(64);
        coord.begin().unwrap();
        let get = ctx(&arena, &[(Sort::GlobalName, Arg::text("^Missing"))]);
        let (_, result) = coord.relay(Command::Get, get).unwrap();
        assert_eq!(result.unwrap_err().engine_error().unwrap().kind, ErrorKind::Undefined);
        assert_eq!(coord.level(), 1);
        coord.end(TransactionVerdict::Rollback).unwrap();
    }

    #[test]
    fn engine_panic_leaves_level_usable() {
        let engine = MemoryEngine::new();
        engine.register_function("Explode", |_| -> EngineResult<Reply> { panic!("boom") });
        let coord = TransactionCoordinator::new(Arc::new(engine.session()), None);
        let arena = Arena::new(64);
        coord.begin().unwrap();

        let call = ctx(&arena, &[(Sort::Data, Arg::text("Explode"))]);
        let (_, result) = coord.relay(Command::Function, call).unwrap();
        assert!(matches!(result, Err(CoreError::Panicked { .. })));
        assert_eq!(coord.engine_level().unwrap(), 1);

        let set = ctx(
            &arena,
            &[
                (Sort::GlobalName, Arg::text("^After")),
                (Sort::Data, Arg::text("ok")),
            ],
        );
        coord.relay(Command::Set, set).unwrap().1.unwrap();
        assert_eq!(coord.end(TransactionVerdict::Rollback).unwrap(), 0);
    }

    #[test]
    fn drop_rolls_back_open_levels() {
        let engine = MemoryEngine::new();
        let session = Arc::new(engine.session());
        let arena = Arena::new(64);
        {
            let coord = TransactionCoordinator::new(session.clone(), None);
            coord.begin().unwrap();
            let set = ctx(
                &arena,
                &[
                    (Sort::GlobalName, Arg::text("^Gone")),
                    (Sort::Data, Arg::text("x")),
                ],
            );
            coord.relay(Command::Set, set).unwrap().1.unwrap();
        }
        assert_eq!(session.transaction_level(), 0);
        let get = ctx(&arena, &[(Sort::GlobalName, Arg::text("^Gone"))]);
        let args = get.args();
        assert!(session.call(Command::Get, &args).is_err());
    }
}
