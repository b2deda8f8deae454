//! Exchange dispatch: correlating responses with in-flight requests.
//!
//! Every exchange request carries a `(service, channel, message_num)` triple.
//! The dispatcher hands out message numbers, holds a [`Promise`] per
//! outstanding request and claims matching response packets before they reach
//! ordinary subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::promise::Promise;
use crate::protocol::Packet;
use crate::transport::Handle;

type ExchangeKey = (u16, u16, u16);

/// Correlates exchange responses with the promises awaiting them.
#[derive(Default)]
pub struct Dispatcher {
    counter: AtomicU16,
    promises: Mutex<HashMap<ExchangeKey, Promise>>,
    by_handle: Mutex<HashMap<Handle, HashSet<ExchangeKey>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            counter: AtomicU16::new(1),
            promises: Mutex::new(HashMap::new()),
            by_handle: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next message number. Wraps; zero is skipped so that an
    /// unset field is never mistaken for an allocated counter.
    pub fn next_counter(&self) -> u16 {
        loop {
            let value = self.counter.fetch_add(1, Ordering::Relaxed);
            if value != 0 {
                return value;
            }
        }
    }

    /// Register an outstanding exchange and get the promise for its response.
    pub fn register_exchange(
        &self,
        service: u16,
        channel: u16,
        counter: u16,
        ttl: Duration,
    ) -> Promise {
        let promise = Promise::new(ttl);
        self.promises
            .lock()
            .unwrap()
            .insert((service, channel, counter), promise.clone());
        promise
    }

    /// Try to claim a packet as the response to an outstanding exchange.
    ///
    /// Returns `true` when a promise was resolved; the packet must not also be
    /// delivered to subscriptions in that case.
    pub fn dispatch(&self, packet: &Packet) -> bool {
        let key = (packet.service(), packet.channel(), packet.message_num());
        let promise = self.promises.lock().unwrap().remove(&key);
        match promise {
            Some(promise) => {
                promise.succeed(packet.payload().to_vec());
                true
            }
            None => false,
        }
    }

    /// Record that an outstanding exchange was sent on a connection, so the
    /// promise can be failed if the connection drops first.
    pub fn notify_message(&self, handle: Handle, service: u16, channel: u16, counter: u16) {
        self.by_handle
            .lock()
            .unwrap()
            .entry(handle)
            .or_default()
            .insert((service, channel, counter));
    }

    /// Fail every outstanding exchange that was sent on a dropped connection.
    pub fn connection_dropped(&self, handle: Handle) {
        let keys = self.by_handle.lock().unwrap().remove(&handle);
        let keys = match keys {
            Some(keys) => keys,
            None => return,
        };

        let mut resolved = Vec::new();
        {
            let mut promises = self.promises.lock().unwrap();
            for key in keys {
                if let Some(promise) = promises.remove(&key) {
                    resolved.push(promise);
                }
            }
        }
        for promise in resolved {
            promise.fail("connection dropped");
        }
    }

    /// Time out expired exchanges and drop bookkeeping for finished ones.
    pub fn cleanup(&self, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut promises = self.promises.lock().unwrap();
            promises.retain(|_, promise| {
                if promise.is_resolved() {
                    false
                } else if now >= promise.deadline() {
                    expired.push(promise.clone());
                    false
                } else {
                    true
                }
            });
        }
        for promise in expired {
            promise.timeout();
        }

        let promises = self.promises.lock().unwrap();
        self.by_handle.lock().unwrap().retain(|_, keys| {
            keys.retain(|key| promises.contains_key(key));
            !keys.is_empty()
        });
    }

    /// Number of exchanges still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.promises.lock().unwrap().len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending_count())
            .finish()
    }
}
