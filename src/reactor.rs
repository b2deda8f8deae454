//! Cooperative task polling.
//!
//! The reactor is a polled scheduler for small control-plane jobs: one-shot
//! [`Runnable`]s that become ready and complete, and [`PeriodicRunnable`]s
//! that fire on a fixed interval. The node's maintenance tick drives
//! [`Reactor::poll`]; nothing here spawns threads or tasks of its own.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::promise::{Promise, PromiseState};

/// A one-shot job polled until it completes.
pub trait Runnable: Send + Sync {
    /// Whether the job wants to run now.
    fn is_ready(&self, now: Instant) -> bool;

    /// Run the job. Called at most until `is_complete` reports true.
    fn execute(&self);

    /// Whether the job is finished and can be dropped from the reactor.
    fn is_complete(&self) -> bool;
}

/// A job that runs on a fixed interval for as long as it is attached.
pub trait PeriodicRunnable: Send + Sync {
    fn interval(&self) -> Duration;
    fn periodically(&self);
}

struct PeriodicEntry {
    runnable: Arc<dyn PeriodicRunnable>,
    next_due: Instant,
}

/// Polled scheduler for control-plane jobs.
#[derive(Default)]
pub struct Reactor {
    runnables: Mutex<Vec<Arc<dyn Runnable>>>,
    periodic: Mutex<Vec<PeriodicEntry>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a one-shot job.
    pub fn attach(&self, runnable: Arc<dyn Runnable>) {
        self.runnables.lock().unwrap().push(runnable);
    }

    /// Attach a periodic job. It first fires one interval from now.
    pub fn attach_periodic(&self, runnable: Arc<dyn PeriodicRunnable>) {
        let next_due = Instant::now() + runnable.interval();
        self.periodic
            .lock()
            .unwrap()
            .push(PeriodicEntry { runnable, next_due });
    }

    /// Run everything that is due. Jobs execute outside the reactor's locks.
    pub fn poll(&self, now: Instant) {
        let due: Vec<Arc<dyn PeriodicRunnable>> = {
            let mut periodic = self.periodic.lock().unwrap();
            periodic
                .iter_mut()
                .filter(|entry| now >= entry.next_due)
                .map(|entry| {
                    entry.next_due = now + entry.runnable.interval();
                    Arc::clone(&entry.runnable)
                })
                .collect()
        };
        for runnable in due {
            runnable.periodically();
        }

        let ready: Vec<Arc<dyn Runnable>> = {
            let runnables = self.runnables.lock().unwrap();
            runnables
                .iter()
                .filter(|r| !r.is_complete() && r.is_ready(now))
                .cloned()
                .collect()
        };
        for runnable in ready {
            runnable.execute();
        }

        self.runnables.lock().unwrap().retain(|r| !r.is_complete());
    }

    /// Number of one-shot jobs still attached.
    pub fn pending_count(&self) -> usize {
        self.runnables.lock().unwrap().len()
    }
}

type TaskCallback = Box<dyn FnOnce(&PromiseState) + Send>;

/// A [`Runnable`] that watches a [`Promise`] and invokes a callback exactly
/// once, either when the promise resolves or when the task deadline passes.
///
/// A deadline expiry force-times-out the promise, so the callback always sees
/// a terminal state. Panics in the callback are contained.
pub struct PromiseTask {
    promise: Promise,
    deadline: Instant,
    callback: Mutex<Option<TaskCallback>>,
    done: AtomicBool,
}

impl PromiseTask {
    /// Watch `promise`, giving up after `timeout` or at the promise's own
    /// deadline, whichever comes first.
    pub fn new(
        promise: Promise,
        timeout: Duration,
        callback: impl FnOnce(&PromiseState) + Send + 'static,
    ) -> Self {
        let deadline = (Instant::now() + timeout).min(promise.deadline());
        Self {
            promise,
            deadline,
            callback: Mutex::new(Some(Box::new(callback))),
            done: AtomicBool::new(false),
        }
    }
}

impl Runnable for PromiseTask {
    fn is_ready(&self, now: Instant) -> bool {
        !self.is_complete() && (self.promise.is_resolved() || now >= self.deadline)
    }

    fn execute(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.promise.is_resolved() {
            self.promise.timeout();
        }
        let state = self.promise.state();
        if let Some(callback) = self.callback.lock().unwrap().take() {
            if catch_unwind(AssertUnwindSafe(|| callback(&state))).is_err() {
                tracing::error!("Promise task callback panicked");
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}
