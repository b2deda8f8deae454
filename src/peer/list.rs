//! Desired-peer list and connection retry backoff.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::MAX_BACKOFF_LEVEL;
use crate::transport::Handle;

/// Per-peer connection statistics.
#[derive(Debug, Clone, Default)]
pub struct PeerMetadata {
    /// Number of dial attempts.
    pub attempts: u64,
    /// Number of successful connections.
    pub successes: u64,
    /// Failures since the last successful connection.
    pub consecutive_failures: u64,
    /// Failures over the lifetime of the entry.
    pub total_failures: u64,
    /// When the last failure was recorded.
    pub last_failed: Option<Instant>,
    /// Whether a connection to this peer is currently live.
    pub connected: bool,
}

/// Derived connection state for a dial target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never seen this peer.
    Unknown,
    /// Desired but not connected and not backing off.
    Trying,
    /// A live connection exists.
    Connected,
    /// Waiting out a retry window; the level is capped.
    Backoff(u8),
    /// Connected through a connection the remote end initiated.
    Incoming,
    /// Known only through a non-persistent connection.
    Remote,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Trying => write!(f, "trying"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff(level) => write!(f, "backoff-{}", level),
            ConnectionState::Incoming => write!(f, "incoming"),
            ConnectionState::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    /// Dial targets we keep trying to stay connected to.
    persistent: HashSet<SocketAddr>,
    /// Statistics per dial target.
    metadata: HashMap<SocketAddr, PeerMetadata>,
    /// Live outbound connections by dial target.
    connections: HashMap<SocketAddr, Handle>,
    /// Reverse index of `connections`.
    by_handle: HashMap<Handle, SocketAddr>,
}

/// Owns the set of outbound persistent peers and the retry/backoff policy.
///
/// Every mutation happens under one internal lock; queries copy out under the
/// same lock so callers never observe the table mid-mutation.
#[derive(Debug)]
pub struct PeerConnectionList {
    inner: Mutex<Inner>,
    backoff_base: Duration,
}

impl PeerConnectionList {
    /// Create an empty list with the given backoff base delay.
    pub fn new(backoff_base: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            backoff_base,
        }
    }

    /// Mark a dial target as desired. Returns `false` if already present.
    pub fn add_persistent_peer(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let added = inner.persistent.insert(addr);
        if added {
            inner.metadata.entry(addr).or_default();
            tracing::debug!(addr = %addr, "Added persistent peer");
        }
        added
    }

    /// Remove desired-peer status, metadata and any live connection.
    pub fn remove_persistent_peer(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.persistent.remove(&addr);
        inner.metadata.remove(&addr);
        if let Some(handle) = inner.connections.remove(&addr) {
            inner.by_handle.remove(&handle);
        }
    }

    /// Remove a persistent peer identified by its connection handle.
    pub fn remove_persistent_peer_by_handle(&self, handle: Handle) {
        let addr = self.inner.lock().unwrap().by_handle.get(&handle).copied();
        if let Some(addr) = addr {
            self.remove_persistent_peer(addr);
        }
    }

    /// Record that a dial attempt is being made.
    pub fn record_attempt(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.metadata.entry(addr).or_default().attempts += 1;
    }

    /// Record a completed outbound connection.
    pub fn on_connection_established(&self, addr: SocketAddr, handle: Handle) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert(addr, handle);
        inner.by_handle.insert(handle, addr);

        let metadata = inner.metadata.entry(addr).or_default();
        metadata.connected = true;
        metadata.successes += 1;
        metadata.consecutive_failures = 0;

        tracing::debug!(addr = %addr, handle, "Peer connection established");
    }

    /// Record a failed dial or a lost connection for a dial target.
    pub fn record_failure(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.connections.remove(&addr) {
            inner.by_handle.remove(&handle);
        }

        let metadata = inner.metadata.entry(addr).or_default();
        metadata.connected = false;
        metadata.consecutive_failures += 1;
        metadata.total_failures += 1;
        metadata.last_failed = Some(Instant::now());
    }

    /// Record a lost connection identified by handle. Returns the dial target.
    pub fn remove_connection(&self, handle: Handle) -> Option<SocketAddr> {
        let addr = self.inner.lock().unwrap().by_handle.get(&handle).copied();
        if let Some(addr) = addr {
            self.record_failure(addr);
        }
        addr
    }

    /// Handle of the live connection for a dial target, if any.
    pub fn lookup_handle(&self, addr: SocketAddr) -> Option<Handle> {
        self.inner.lock().unwrap().connections.get(&addr).copied()
    }

    /// Dial target of a live connection, if this list owns it.
    pub fn lookup_addr(&self, handle: Handle) -> Option<SocketAddr> {
        self.inner.lock().unwrap().by_handle.get(&handle).copied()
    }

    /// Derived connection state for a dial target.
    pub fn state_for(&self, addr: SocketAddr) -> ConnectionState {
        self.state_for_at(addr, Instant::now())
    }

    /// Derived connection state at an explicit point in time.
    pub fn state_for_at(&self, addr: SocketAddr, now: Instant) -> ConnectionState {
        let inner = self.inner.lock().unwrap();

        let metadata = match inner.metadata.get(&addr) {
            Some(metadata) => metadata,
            None => return ConnectionState::Unknown,
        };

        if metadata.connected {
            return ConnectionState::Connected;
        }

        if let Some(level) = backoff_level(metadata) {
            if !ready_at(metadata, self.backoff_base, now) {
                return ConnectionState::Backoff(level);
            }
        }

        if inner.persistent.contains(&addr) {
            ConnectionState::Trying
        } else {
            ConnectionState::Remote
        }
    }

    /// Whether the backoff window for a dial target has elapsed.
    pub fn ready_for_retry(&self, addr: SocketAddr, now: Instant) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.metadata.get(&addr) {
            Some(metadata) => ready_at(metadata, self.backoff_base, now),
            None => true,
        }
    }

    /// Desired peers that are not connected and past their backoff window.
    ///
    /// The caller is expected to attempt dialing each returned target.
    pub fn peers_to_connect_to(&self, now: Instant) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .persistent
            .iter()
            .filter(|addr| !inner.connections.contains_key(addr))
            .filter(|addr| match inner.metadata.get(addr) {
                Some(metadata) => ready_at(metadata, self.backoff_base, now),
                None => true,
            })
            .copied()
            .collect()
    }

    /// The current set of desired dial targets.
    pub fn persistent_peers(&self) -> HashSet<SocketAddr> {
        self.inner.lock().unwrap().persistent.clone()
    }

    /// Copy of the statistics for a dial target.
    pub fn metadata_for(&self, addr: SocketAddr) -> Option<PeerMetadata> {
        self.inner.lock().unwrap().metadata.get(&addr).cloned()
    }

    /// Number of live outbound connections.
    pub fn connected_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Handles of all live outbound connections.
    pub fn connection_handles(&self) -> Vec<Handle> {
        self.inner.lock().unwrap().by_handle.keys().copied().collect()
    }
}

/// Backoff level for a metadata entry, `None` when no failure is pending.
fn backoff_level(metadata: &PeerMetadata) -> Option<u8> {
    if metadata.consecutive_failures == 0 {
        None
    } else {
        Some(metadata.consecutive_failures.min(MAX_BACKOFF_LEVEL) as u8)
    }
}

/// The retry window doubles with each consecutive failure up to the cap.
fn backoff_window(metadata: &PeerMetadata, base: Duration) -> Option<Duration> {
    let level = backoff_level(metadata)?;
    Some(base * (1u32 << (u32::from(level) - 1)))
}

fn ready_at(metadata: &PeerMetadata, base: Duration, now: Instant) -> bool {
    match (metadata.last_failed, backoff_window(metadata, base)) {
        (Some(failed_at), Some(window)) => now >= failed_at + window,
        _ => true,
    }
}
