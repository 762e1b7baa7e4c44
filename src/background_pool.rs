//! BackgroundPool - fixed set of worker threads running periodic tasks
//!
//! Every table registers one merge task. Workers share a min-heap of tasks
//! ordered by next eligible time, sleep until the earliest one is due, run
//! it and reschedule it:
//!
//! - the callback returned `Ok(true)` (did work): again after `sleep_after_work`
//! - `Ok(false)`, an error, or a panic: after the task's idle backoff, which
//!   starts at `initial_backoff` and grows by `backoff_multiplier` up to
//!   `backoff_max_interval`
//!
//! A task never runs on two workers at once. Heap entries are invalidated
//! lazily: each reschedule bumps the task's generation and stale entries
//! are skipped when they surface.
//!
//! # Example
//!
//! ```
//! use mergetree::background_pool::BackgroundPool;
//! use mergetree::settings::PoolConfig;
//!
//! let pool = BackgroundPool::new(&PoolConfig::default()).unwrap();
//! let handle = pool.register("noop", || Ok(false));
//! handle.deregister();
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Result;
use crate::metrics::{PoolStats, PoolStatsSnapshot, RunResult};
use crate::settings::PoolConfig;

pub type TaskId = u64;

type Callback = Arc<dyn Fn() -> Result<bool> + Send + Sync>;

// ── Backoff ─────────────────────────────────────────────────────────

/// Rescheduling rules, kept apart from the threads so they can be tested
/// without a clock.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub sleep_after_work: Duration,
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            sleep_after_work: config.sleep_after_work,
            initial: config.initial_backoff,
            multiplier: config.backoff_multiplier,
            max: config.backoff_max_interval,
        }
    }

    /// Delay until the next run, and the idle delay to remember.
    ///
    /// `idle` is the delay used after the previous idle run, `None` if the
    /// previous run did work (or there was none).
    pub fn next_delay(&self, did_work: bool, idle: Option<Duration>) -> (Duration, Option<Duration>) {
        if did_work {
            return (self.sleep_after_work, None);
        }
        let delay = match idle {
            None => self.initial.min(self.max),
            Some(prev) => prev.mul_f64(self.multiplier).min(self.max),
        };
        (delay, Some(delay))
    }
}

// ── Shared state ────────────────────────────────────────────────────

struct TaskEntry {
    name: String,
    callback: Callback,
    next_run: Instant,
    idle_delay: Option<Duration>,
    generation: u64,
    running_on: Option<ThreadId>,
    /// `wake()` arrived while the task was running.
    wake_pending: bool,
    removed: bool,
}

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, TaskEntry>,
    /// (due, tie-break sequence, task, generation)
    queue: BinaryHeap<Reverse<(Instant, u64, TaskId, u64)>>,
    next_id: TaskId,
    seq: u64,
    shutdown: bool,
}

impl State {
    fn schedule(&mut self, id: TaskId) {
        let seq = self.seq;
        self.seq += 1;
        if let Some(task) = self.tasks.get(&id) {
            self.queue
                .push(Reverse((task.next_run, seq, id, task.generation)));
        }
    }
}

struct Shared {
    state: Mutex<State>,
    /// Workers wait here for the next due task.
    wakeup: Condvar,
    /// Deregistration waits here for a running invocation to finish.
    finished: Condvar,
    backoff: BackoffPolicy,
    stats: PoolStats,
}

// ── BackgroundPool ──────────────────────────────────────────────────

pub struct BackgroundPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundPool {
    /// Start `config.background_pool_size` workers.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
            finished: Condvar::new(),
            backoff: BackoffPolicy::from_config(config),
            stats: PoolStats::default(),
        });

        let mut workers = Vec::with_capacity(config.background_pool_size);
        for i in 0..config.background_pool_size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("bg-merge-{i}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(handle);
        }

        tracing::info!(workers = workers.len(), "background pool started");
        Ok(Self { shared, workers })
    }

    /// Register a periodic task. It is due immediately.
    pub fn register<F>(&self, name: impl Into<String>, callback: F) -> TaskHandle
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            TaskEntry {
                name: name.clone(),
                callback: Arc::new(callback),
                next_run: Instant::now(),
                idle_delay: None,
                generation: 0,
                running_on: None,
                wake_pending: false,
                removed: false,
            },
        );
        state.schedule(id);
        drop(state);
        self.shared.wakeup.notify_all();

        tracing::debug!(task = %name, id, "registered background task");
        TaskHandle {
            shared: Arc::clone(&self.shared),
            id,
            deregistered: Mutex::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("background worker panicked outside a task");
            }
        }
        tracing::info!("background pool stopped");
    }
}

// ── TaskHandle ──────────────────────────────────────────────────────

/// Registration of one task. Dropping it deregisters the task.
pub struct TaskHandle {
    shared: Arc<Shared>,
    id: TaskId,
    deregistered: Mutex<bool>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Make the task due now and reset its idle backoff.
    pub fn wake(&self) {
        let mut state = self.shared.state.lock();
        let Some(task) = state.tasks.get_mut(&self.id) else {
            return;
        };
        if task.removed {
            return;
        }
        task.idle_delay = None;
        if task.running_on.is_some() {
            task.wake_pending = true;
            return;
        }
        task.next_run = Instant::now();
        task.generation += 1;
        state.schedule(self.id);
        drop(state);
        self.shared.wakeup.notify_all();
    }

    /// Remove the task. If it is running on another thread, block until that
    /// invocation returns. Idempotent.
    pub fn deregister(&self) {
        let mut done = self.deregistered.lock();
        if *done {
            return;
        }
        *done = true;

        let mut state = self.shared.state.lock();
        let Some(task) = state.tasks.get_mut(&self.id) else {
            return;
        };
        task.removed = true;
        let running_on = task.running_on;
        match running_on {
            None => {
                state.tasks.remove(&self.id);
            }
            Some(owner) if owner == thread::current().id() => {
                // Called from inside the task; the worker drops it on return.
            }
            Some(_) => {
                while state.tasks.contains_key(&self.id) {
                    self.shared.finished.wait(&mut state);
                }
            }
        }
        tracing::debug!(id = self.id, "deregistered background task");
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.deregister();
    }
}

// ── Worker ──────────────────────────────────────────────────────────

fn worker_loop(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let Some(&Reverse((due, _, id, generation))) = state.queue.peek() else {
            shared.wakeup.wait(&mut state);
            continue;
        };

        let runnable = state
            .tasks
            .get(&id)
            .map_or(false, |t| t.generation == generation && t.running_on.is_none() && !t.removed);
        if !runnable {
            state.queue.pop();
            continue;
        }
        if due > Instant::now() {
            shared.wakeup.wait_until(&mut state, due);
            continue;
        }
        state.queue.pop();

        let (name, callback) = match state.tasks.get_mut(&id) {
            Some(task) => {
                task.running_on = Some(thread::current().id());
                (task.name.clone(), Arc::clone(&task.callback))
            }
            None => continue,
        };

        let result = MutexGuard::unlocked(&mut state, || run_task(&name, &callback));
        shared.stats.record(result);
        finish_run(shared, &mut state, id, result);
    }
}

fn finish_run(shared: &Shared, state: &mut State, id: TaskId, result: RunResult) {
    let Some(task) = state.tasks.get_mut(&id) else {
        return;
    };
    task.running_on = None;
    if task.removed {
        state.tasks.remove(&id);
        shared.finished.notify_all();
        return;
    }

    let did_work = result == RunResult::DidWork;
    let (delay, idle) = shared.backoff.next_delay(did_work, task.idle_delay);
    if task.wake_pending {
        task.wake_pending = false;
        task.idle_delay = None;
        task.next_run = Instant::now();
    } else {
        task.idle_delay = idle;
        task.next_run = Instant::now() + delay;
    }
    task.generation += 1;
    tracing::trace!(task = %task.name, ?result, ?delay, "rescheduled background task");
    state.schedule(id);
    shared.wakeup.notify_one();
}

fn run_task(name: &str, callback: &Callback) -> RunResult {
    match panic::catch_unwind(AssertUnwindSafe(|| (**callback)())) {
        Ok(Ok(true)) => RunResult::DidWork,
        Ok(Ok(false)) => RunResult::Idle,
        Ok(Err(e)) => {
            tracing::warn!(task = name, error = %e, code = e.code(), "background task failed");
            RunResult::Failed
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task = name, panic = %message, "background task panicked");
            RunResult::Panicked
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
