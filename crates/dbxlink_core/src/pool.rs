//! Fixed-size worker thread pool for deferred operations.
//!
//! Tasks are dequeued in FIFO order and each one runs on exactly one worker.
//! A submitter holds a [`TaskHandle`] and blocks on it until the task is
//! done; there is no cancellation.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
}

enum TaskState<R> {
    Queued,
    Running,
    Done(CoreResult<R>),
    Taken,
}

struct TaskSlot<R> {
    state: Mutex<TaskState<R>>,
    ready: Condvar,
}

/// Completion handle for a task submitted to a [`WorkerPool`].
pub struct TaskHandle<R> {
    slot: Arc<TaskSlot<R>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task has finished and returns its result.
    pub fn wait(self) -> CoreResult<R> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = take_finished(&mut state)? {
                return result;
            }
            self.slot.ready.wait(&mut state);
        }
    }

    /// Waits at most `timeout` for the task to finish.
    ///
    /// On timeout the task keeps running and the handle stays usable.
    pub fn wait_timeout(&self, timeout: Duration) -> CoreResult<R> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = take_finished(&mut state)? {
                return result;
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                if let Some(result) = take_finished(&mut state)? {
                    return result;
                }
                return Err(CoreError::Timeout {
                    what: "deferred task",
                    waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    /// Returns true once the task has finished.
    pub fn is_done(&self) -> bool {
        matches!(
            *self.slot.state.lock(),
            TaskState::Done(_) | TaskState::Taken
        )
    }
}

fn take_finished<R>(state: &mut TaskState<R>) -> CoreResult<Option<CoreResult<R>>> {
    match std::mem::replace(state, TaskState::Taken) {
        TaskState::Done(result) => Ok(Some(result)),
        TaskState::Taken => Err(CoreError::invalid_argument("task result already taken")),
        pending => {
            *state = pending;
            Ok(None)
        }
    }
}

/// A fixed set of OS threads draining a shared FIFO queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers (at least one).
    pub fn new(size: usize) -> CoreResult<Self> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(size),
        };
        for i in 0..size {
            let shared = Arc::clone(&pool.shared);
            // On failure the partially built pool is dropped, which stops
            // the workers already started.
            let handle = thread::Builder::new()
                .name(format!("dbxlink-worker-{i}"))
                .spawn(move || worker_loop(&shared))?;
            pool.workers.push(handle);
        }

        info!(workers = size, "worker pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Enqueues `work` and returns a handle to its result.
    pub fn spawn<R, F>(&self, work: F) -> CoreResult<TaskHandle<R>>
    where
        F: FnOnce() -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let slot = Arc::new(TaskSlot {
            state: Mutex::new(TaskState::Queued),
            ready: Condvar::new(),
        });

        let task_slot = Arc::clone(&slot);
        let job: Job = Box::new(move || {
            *task_slot.state.lock() = TaskState::Running;
            let result = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(_) => {
                    warn!("deferred task panicked");
                    Err(CoreError::Panicked {
                        what: "deferred task",
                    })
                }
            };
            *task_slot.state.lock() = TaskState::Done(result);
            task_slot.ready.notify_all();
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return Err(CoreError::PoolClosed);
            }
            queue.jobs.push_back(job);
        }
        self.shared.not_empty.notify_one();

        Ok(TaskHandle { slot })
    }

    /// Enqueues `work` and blocks until it has run.
    pub fn submit<R, F>(&self, work: F) -> CoreResult<R>
    where
        F: FnOnce() -> CoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.spawn(work)?.wait()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.not_empty.wait(&mut queue);
            }
        };
        job();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.not_empty.notify_all();

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last owner may be a task running on one of our workers.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread exited abnormally");
            }
        }
        debug!("worker pool stopped");
    }
}
