//! Single-assignment promises for request/response exchanges.
//!
//! A [`Promise`] is created in the waiting state and transitions exactly once
//! to success, failure or timeout. Callbacks registered before the transition
//! fire when it happens; callbacks registered after fire immediately. Either
//! way they run outside the internal lock, so a callback may freely inspect or
//! register on the promise it was attached to.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Terminal and non-terminal states of a promise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromiseState {
    /// No response has arrived yet.
    Waiting,
    /// The exchange completed with a response payload.
    Success(Vec<u8>),
    /// The exchange failed before completing.
    Failed(String),
    /// The deadline passed without a response.
    TimedOut,
}

impl PromiseState {
    /// Whether the promise has reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PromiseState::Waiting)
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Waiting => write!(f, "waiting"),
            PromiseState::Success(_) => write!(f, "success"),
            PromiseState::Failed(reason) => write!(f, "failed: {}", reason),
            PromiseState::TimedOut => write!(f, "timed-out"),
        }
    }
}

type Callback = Box<dyn FnOnce(&PromiseState) + Send>;

struct Inner {
    state: PromiseState,
    callbacks: Vec<Callback>,
}

/// A single-assignment slot for the response to an in-flight exchange.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<Inner>>,
    created_at: Instant,
    deadline: Instant,
}

impl Promise {
    /// Create a waiting promise that times out after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: PromiseState::Waiting,
                callbacks: Vec::new(),
            })),
            created_at,
            deadline: created_at + ttl,
        }
    }

    /// Current state of the promise.
    pub fn state(&self) -> PromiseState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Whether the promise has reached a terminal state.
    pub fn is_resolved(&self) -> bool {
        self.state().is_resolved()
    }

    /// When the promise was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The instant after which the promise should be timed out.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolve with a response payload.
    pub fn succeed(&self, payload: Vec<u8>) {
        self.transition(PromiseState::Success(payload));
    }

    /// Resolve with a failure reason.
    pub fn fail(&self, reason: impl Into<String>) {
        self.transition(PromiseState::Failed(reason.into()));
    }

    /// Resolve as timed out.
    pub fn timeout(&self) {
        self.transition(PromiseState::TimedOut);
    }

    /// Register a callback to run once the promise resolves.
    ///
    /// If the promise is already resolved the callback runs immediately on the
    /// calling thread.
    pub fn on_resolved(&self, callback: impl FnOnce(&PromiseState) + Send + 'static) {
        let immediate = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_resolved() {
                Some(inner.state.clone())
            } else {
                inner.callbacks.push(Box::new(callback));
                return;
            }
        };
        if let Some(state) = immediate {
            callback(&state);
        }
    }

    /// First transition wins; later transitions are dropped.
    fn transition(&self, state: PromiseState) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_resolved() {
                return;
            }
            inner.state = state.clone();
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(&state);
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("deadline", &self.deadline)
            .finish()
    }
}
