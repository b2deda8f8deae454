//! Loop and duplicate suppression.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Remembers recently seen packet identities so copies of a packet that loop
/// back or arrive over multiple paths are processed only once.
///
/// Bounded two ways: entries older than the window no longer count as echoes,
/// and the LRU capacity evicts the coldest identities under load.
pub struct EchoCache {
    seen: Mutex<LruCache<[u8; 32], Instant>>,
    window: Duration,
}

impl EchoCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    /// Record a packet identity and report whether it was already seen within
    /// the window. Refreshes the timestamp either way.
    pub fn observe(&self, id: [u8; 32], now: Instant) -> bool {
        let mut seen = self.seen.lock().unwrap();
        let is_echo = match seen.get(&id) {
            Some(last) => now.duration_since(*last) < self.window,
            None => false,
        };
        seen.put(id, now);
        is_echo
    }

    /// Number of identities currently cached.
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EchoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoCache")
            .field("len", &self.len())
            .field("window", &self.window)
            .finish()
    }
}
