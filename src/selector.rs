//! Peer selection.
//!
//! The selector reconciles the set of peers the node wants to talk to
//! (overlay addresses) with the set of dial targets the connection list is
//! maintaining (socket addresses). Addresses with no known endpoints are
//! resolved over the discovery channel; endpoints that keep failing are
//! marked unreachable and skipped; additions always happen before removals so
//! the node never drops below its connection floor while rebalancing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::address::Address;
use crate::config::{CHANNEL_DISCOVERY, SERVICE_MESH, UNREACHABLE_FAILURE_THRESHOLD};
use crate::peer::{ConnectionRegister, PeerConnectionList};
use crate::promise::PromiseState;
use crate::reactor::{PeriodicRunnable, PromiseTask, Reactor};
use crate::routing::Router;
use crate::transport::Transport;

/// Exponent cap for the resolution retry timeout.
const MAX_RESOLUTION_BACKOFF_SHIFT: u64 = 11;

#[derive(Debug, Clone)]
struct Endpoint {
    addr: SocketAddr,
    unreachable: bool,
}

#[derive(Debug, Default)]
struct PeerCache {
    endpoints: Vec<Endpoint>,
    /// Round-robin position among the endpoints.
    cursor: usize,
    /// Failed resolution attempts since the last successful one.
    resolution_failures: u64,
}

impl PeerCache {
    fn needs_resolution(&self) -> bool {
        self.endpoints.is_empty() || self.endpoints.iter().all(|e| e.unreachable)
    }

    /// The endpoint to dial next: the first reachable one at or after the
    /// cursor, wrapping around.
    fn current_target(&self) -> Option<SocketAddr> {
        let len = self.endpoints.len();
        (0..len)
            .map(|k| &self.endpoints[(self.cursor + k) % len])
            .find(|e| !e.unreachable)
            .map(|e| e.addr)
    }
}

#[derive(Default)]
struct State {
    desired: HashSet<Address>,
    cache: HashMap<Address, PeerCache>,
    pending: HashSet<Address>,
}

/// Reconciles desired overlay peers with the dial targets being maintained.
pub struct PeerSelector {
    minimum_peers: usize,
    interval: Duration,
    router: Arc<Router>,
    register: Arc<ConnectionRegister>,
    peers: Arc<PeerConnectionList>,
    transport: Arc<dyn Transport>,
    reactor: Arc<Reactor>,
    state: Mutex<State>,
    self_ref: Mutex<Weak<PeerSelector>>,
}

impl PeerSelector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        minimum_peers: usize,
        interval: Duration,
        router: Arc<Router>,
        register: Arc<ConnectionRegister>,
        peers: Arc<PeerConnectionList>,
        transport: Arc<dyn Transport>,
        reactor: Arc<Reactor>,
    ) -> Arc<Self> {
        let selector = Arc::new(Self {
            minimum_peers,
            interval,
            router,
            register,
            peers,
            transport,
            reactor,
            state: Mutex::new(State::default()),
            self_ref: Mutex::new(Weak::new()),
        });
        *selector.self_ref.lock().unwrap() = Arc::downgrade(&selector);
        selector
    }

    /// Add an overlay address to the desired peer set.
    pub fn add_desired_peer(&self, address: Address) {
        let mut state = self.state.lock().unwrap();
        if state.desired.insert(address) {
            tracing::debug!(%address, "Peer marked as desired");
        }
        state.cache.entry(address).or_default();
    }

    /// Add a desired peer together with a known dial target, skipping the
    /// resolution step for it.
    pub fn add_desired_peer_with_endpoint(&self, address: Address, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.desired.insert(address);
        let cache = state.cache.entry(address).or_default();
        if !cache.endpoints.iter().any(|e| e.addr == addr) {
            cache.endpoints.push(Endpoint {
                addr,
                unreachable: false,
            });
        }
    }

    /// Remove an overlay address from the desired peer set. Its dial targets
    /// are pruned on the next selection cycle.
    pub fn remove_desired_peer(&self, address: &Address) {
        let mut state = self.state.lock().unwrap();
        if state.desired.remove(address) {
            state.cache.remove(address);
            tracing::debug!(%address, "Peer no longer desired");
        }
    }

    pub fn desired_peers(&self) -> HashSet<Address> {
        self.state.lock().unwrap().desired.clone()
    }

    /// Number of endpoint resolutions currently in flight.
    pub fn pending_resolutions(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Run one selection cycle.
    fn select(&self) {
        self.resolve_missing_endpoints();
        self.refresh_reachability();
        let wanted = self.wanted_dial_targets();
        self.reconcile(wanted);
    }

    /// Ask peers with no usable endpoints for their dialable addresses.
    fn resolve_missing_endpoints(&self) {
        let connected = self.register.current_address_set();

        let to_resolve: Vec<(Address, u64)> = {
            let state = self.state.lock().unwrap();
            state
                .desired
                .iter()
                .filter(|address| !connected.contains(address))
                .filter(|address| !state.pending.contains(address))
                .filter_map(|address| {
                    let cache = state.cache.get(address)?;
                    cache
                        .needs_resolution()
                        .then_some((*address, cache.resolution_failures))
                })
                .collect()
        };

        for (address, failures) in to_resolve {
            // failed resolutions back the timeout off exponentially
            let shift = failures.min(MAX_RESOLUTION_BACKOFF_SHIFT);
            let timeout = Duration::from_secs(1 << shift);

            let promise =
                match self
                    .router
                    .exchange(address, SERVICE_MESH, CHANNEL_DISCOVERY, Vec::new(), timeout)
                {
                    Ok(promise) => promise,
                    Err(e) => {
                        tracing::trace!(%address, error = %e, "Endpoint resolution not routable");
                        self.record_resolution_failure(&address);
                        continue;
                    }
                };

            tracing::debug!(%address, ?timeout, "Resolving peer endpoints");
            self.state.lock().unwrap().pending.insert(address);

            let weak = self.self_ref.lock().unwrap().clone();
            self.reactor.attach(Arc::new(PromiseTask::new(
                promise,
                timeout,
                move |state| {
                    if let Some(selector) = weak.upgrade() {
                        selector.on_resolution_complete(address, state);
                    }
                },
            )));
        }
    }

    fn on_resolution_complete(&self, address: Address, result: &PromiseState) {
        match result {
            PromiseState::Success(payload) => match bincode::deserialize::<Vec<SocketAddr>>(payload)
            {
                Ok(endpoints) => {
                    tracing::debug!(%address, count = endpoints.len(), "Peer endpoints resolved");
                    self.update_endpoints(address, endpoints);
                }
                Err(e) => {
                    tracing::warn!(%address, error = %e, "Undecodable endpoint list");
                    self.record_resolution_failure(&address);
                }
            },
            state => {
                tracing::debug!(%address, %state, "Endpoint resolution failed");
                self.record_resolution_failure(&address);
            }
        }
        self.state.lock().unwrap().pending.remove(&address);
    }

    fn update_endpoints(&self, address: Address, endpoints: Vec<SocketAddr>) {
        let mut state = self.state.lock().unwrap();
        if !state.desired.contains(&address) {
            return;
        }
        let cache = state.cache.entry(address).or_default();
        cache.resolution_failures = 0;
        cache.cursor = 0;

        // merge, keeping reachability verdicts for endpoints we already knew
        let previous = std::mem::take(&mut cache.endpoints);
        cache.endpoints = endpoints
            .into_iter()
            .map(|addr| Endpoint {
                unreachable: previous
                    .iter()
                    .any(|e| e.addr == addr && e.unreachable),
                addr,
            })
            .collect();
    }

    fn record_resolution_failure(&self, address: &Address) {
        let mut state = self.state.lock().unwrap();
        if let Some(cache) = state.cache.get_mut(address) {
            cache.resolution_failures += 1;
        }
    }

    /// Mark endpoints whose dials keep failing as unreachable, and move the
    /// round-robin cursor off any endpoint that just became so.
    fn refresh_reachability(&self) {
        let mut state = self.state.lock().unwrap();
        for cache in state.cache.values_mut() {
            for endpoint in &mut cache.endpoints {
                if let Some(metadata) = self.peers.metadata_for(endpoint.addr) {
                    endpoint.unreachable = !metadata.connected
                        && metadata.consecutive_failures >= UNREACHABLE_FAILURE_THRESHOLD;
                }
            }
            if let Some(current) = cache.endpoints.get(cache.cursor) {
                if current.unreachable {
                    cache.cursor = (cache.cursor + 1) % cache.endpoints.len();
                }
            }
        }
    }

    /// One dial target per desired peer, chosen round-robin among its
    /// reachable endpoints.
    fn wanted_dial_targets(&self) -> HashSet<SocketAddr> {
        let state = self.state.lock().unwrap();
        state
            .desired
            .iter()
            .filter_map(|address| state.cache.get(address))
            .filter_map(|cache| cache.current_target())
            .collect()
    }

    /// Align the connection list with the wanted targets. Additions first, so
    /// the node is never below its floor because of a rebalance in progress.
    fn reconcile(&self, wanted: HashSet<SocketAddr>) {
        for addr in &wanted {
            self.peers.add_persistent_peer(*addr);
        }

        // the floor counts live connections; closed ones are decremented
        // locally because the disconnect event lands asynchronously
        let mut connected = self.peers.connected_count();
        let persistent = self.peers.persistent_peers();
        for addr in persistent.difference(&wanted) {
            if let Some(handle) = self.peers.lookup_handle(*addr) {
                if connected <= self.minimum_peers {
                    continue;
                }
                tracing::debug!(addr = %addr, "Dropping unwanted peer");
                self.transport.close(handle);
                connected -= 1;
            }
            self.peers.remove_persistent_peer(*addr);
        }
    }
}

impl PeriodicRunnable for PeerSelector {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn periodically(&self) {
        self.select();
    }
}

impl std::fmt::Debug for PeerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("PeerSelector")
            .field("desired", &state.desired.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkId;
    use crate::config::MeshConfig;
    use crate::crypto::Identity;
    use crate::dispatch::Dispatcher;
    use crate::error::MeshResult;
    use crate::protocol::Packet;
    use crate::subscription::SubscriptionRegistrar;
    use crate::transport::Handle;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Handle, Packet)>>,
        closed: Mutex<Vec<Handle>>,
    }

    impl Transport for RecordingTransport {
        fn connect(&self, _addr: SocketAddr) {}
        fn send(&self, handle: Handle, packet: &Packet) -> MeshResult<()> {
            self.sent.lock().unwrap().push((handle, packet.clone()));
            Ok(())
        }
        fn close(&self, handle: Handle) {
            self.closed.lock().unwrap().push(handle);
        }
    }

    struct Fixture {
        identity: Arc<Identity>,
        selector: Arc<PeerSelector>,
        router: Arc<Router>,
        peers: Arc<PeerConnectionList>,
        transport: Arc<RecordingTransport>,
        reactor: Arc<Reactor>,
    }

    fn fixture(minimum_peers: usize) -> Fixture {
        let identity = Arc::new(Identity::generate());
        let config = MeshConfig::default().with_network_id(NetworkId::new(*b"TEST"));
        let transport = Arc::new(RecordingTransport::default());
        let register = Arc::new(ConnectionRegister::new());
        let peers = Arc::new(PeerConnectionList::new(Duration::from_secs(2)));
        let reactor = Arc::new(Reactor::new());
        let router = Arc::new(Router::new(
            Arc::clone(&identity),
            &config,
            transport.clone() as Arc<dyn Transport>,
            Arc::clone(&register),
            Arc::new(Dispatcher::new()),
            Arc::new(SubscriptionRegistrar::new()),
        ));
        let selector = PeerSelector::new(
            minimum_peers,
            Duration::from_millis(500),
            Arc::clone(&router),
            register,
            Arc::clone(&peers),
            transport.clone() as Arc<dyn Transport>,
            Arc::clone(&reactor),
        );
        Fixture {
            identity,
            selector,
            router,
            peers,
            transport,
            reactor,
        }
    }

    #[test]
    fn test_seeded_endpoint_becomes_dial_target() {
        let f = fixture(0);
        let peer = Identity::generate();
        let addr: SocketAddr = "10.0.0.1:9433".parse().unwrap();

        f.selector.add_desired_peer_with_endpoint(peer.address(), addr);
        f.selector.periodically();

        assert!(f.peers.persistent_peers().contains(&addr));
        assert!(f.peers.peers_to_connect_to(Instant::now()).contains(&addr));
    }

    #[test]
    fn test_resolution_cycle_adds_dial_target() {
        let f = fixture(0);
        let peer = Identity::generate();
        // an informed route exists so the resolution request is routable
        f.router.table().associate(peer.address().raw(), 3, false);

        f.selector.add_desired_peer(peer.address());
        f.selector.periodically();

        // a discovery exchange went out to the peer
        let request = {
            let sent = f.transport.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1.service(), SERVICE_MESH);
            assert_eq!(sent[0].1.channel(), CHANNEL_DISCOVERY);
            assert!(sent[0].1.is_exchange());
            sent[0].1.clone()
        };

        // the peer answers with its endpoints; responses are unflagged
        let endpoints: Vec<SocketAddr> = vec!["10.0.0.2:9433".parse().unwrap()];
        let mut response = Packet::new(peer.address(), NetworkId::new(*b"TEST"));
        response.set_target(f.identity.address());
        response.set_service(SERVICE_MESH);
        response.set_channel(CHANNEL_DISCOVERY);
        response.set_message_num(request.message_num());
        response.set_ttl(40);
        response.set_payload(bincode::serialize(&endpoints).unwrap());
        response.sign(&peer);
        f.router.route(3, response);

        // the reactor delivers the resolution and the next cycle dials
        f.reactor.poll(Instant::now());
        f.selector.periodically();

        assert!(f.peers.persistent_peers().contains(&endpoints[0]));
    }

    #[test]
    fn test_unroutable_resolution_counts_failure() {
        let f = fixture(0);
        let peer = Identity::generate();
        f.selector.add_desired_peer(peer.address());

        f.selector.periodically();
        f.selector.periodically();

        let state = f.selector.state.lock().unwrap();
        assert_eq!(state.cache[&peer.address()].resolution_failures, 2);
    }

    #[test]
    fn test_unwanted_peer_removed_above_floor() {
        let f = fixture(0);
        let stale: SocketAddr = "10.0.0.9:9433".parse().unwrap();
        f.peers.add_persistent_peer(stale);
        f.peers.on_connection_established(stale, 8);

        f.selector.periodically();

        assert!(!f.peers.persistent_peers().contains(&stale));
        assert_eq!(f.transport.closed.lock().unwrap().as_slice(), &[8]);
    }

    #[test]
    fn test_floor_blocks_closing_last_connection() {
        let f = fixture(1);
        let stale: SocketAddr = "10.0.0.9:9433".parse().unwrap();
        f.peers.add_persistent_peer(stale);
        f.peers.on_connection_established(stale, 8);

        f.selector.periodically();

        // the only live connection; the floor keeps it even though unwanted
        assert!(f.peers.persistent_peers().contains(&stale));
        assert!(f.transport.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_floor_counts_connections_not_dial_targets() {
        // four unwanted dial targets but only one live connection: the dead
        // targets are pruned freely while the live connection is protected
        let f = fixture(1);
        let live: SocketAddr = "10.0.0.1:9433".parse().unwrap();
        f.peers.add_persistent_peer(live);
        f.peers.on_connection_established(live, 8);
        let dead: Vec<SocketAddr> = (2..5)
            .map(|i| format!("10.0.0.{}:9433", i).parse().unwrap())
            .collect();
        for addr in &dead {
            f.peers.add_persistent_peer(*addr);
        }

        f.selector.periodically();

        let remaining = f.peers.persistent_peers();
        assert!(remaining.contains(&live));
        assert!(dead.iter().all(|addr| !remaining.contains(addr)));
        assert!(f.transport.closed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_endpoint_skipped() {
        let f = fixture(0);
        let peer = Identity::generate();
        let dead: SocketAddr = "10.0.0.1:9433".parse().unwrap();
        f.selector.add_desired_peer_with_endpoint(peer.address(), dead);

        for _ in 0..UNREACHABLE_FAILURE_THRESHOLD {
            f.peers.record_failure(dead);
        }
        f.selector.periodically();

        // the endpoint is skipped, so the peer is back to needing resolution
        let state = f.selector.state.lock().unwrap();
        assert!(state.cache[&peer.address()].needs_resolution());
    }
}
