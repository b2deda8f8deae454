//! The mesh node: construction, wiring and the event loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::address::Address;
use crate::config::MeshConfig;
use crate::crypto::Identity;
use crate::direct::DirectMessageService;
use crate::discovery::DiscoveryService;
use crate::dispatch::Dispatcher;
use crate::error::{MeshError, MeshResult};
use crate::peer::{ConnectionRegister, PeerConnectionList};
use crate::promise::Promise;
use crate::reactor::{PeriodicRunnable, Reactor};
use crate::routing::{Router, RouterCounterSnapshot};
use crate::selector::PeerSelector;
use crate::subscription::{Subscription, SubscriptionRegistrar};
use crate::transport::{
    ConnectionDirection, TcpTransport, Transport, TransportEvent,
};

/// Point-in-time view of a node's state, for logs and operator surfaces.
#[derive(Debug, Clone)]
pub struct MeshStatus {
    pub address: Address,
    pub connections: usize,
    pub routes: usize,
    pub desired_peers: usize,
    pub pending_exchanges: usize,
    pub counters: RouterCounterSnapshot,
}

/// A node on the overlay.
///
/// Construction wires the collaborators together but starts nothing;
/// [`run`](MeshNode::run) binds the listener and drives the event loop until
/// [`shutdown`](MeshNode::shutdown) is called.
pub struct MeshNode {
    config: Arc<MeshConfig>,
    identity: Arc<Identity>,
    transport: Arc<TcpTransport>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    register: Arc<ConnectionRegister>,
    peers: Arc<PeerConnectionList>,
    registrar: Arc<SubscriptionRegistrar>,
    router: Arc<Router>,
    direct: Arc<DirectMessageService>,
    discovery: Arc<DiscoveryService>,
    selector: Arc<PeerSelector>,
    reactor: Arc<Reactor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MeshNode {
    /// Create a node with a freshly generated identity.
    pub fn new(config: MeshConfig) -> Self {
        Self::with_identity(config, Identity::generate())
    }

    /// Create a node with an existing identity.
    pub fn with_identity(config: MeshConfig, identity: Identity) -> Self {
        let config = Arc::new(config);
        let identity = Arc::new(identity);

        let (transport, events) = TcpTransport::new(Arc::clone(&config));
        let register = Arc::new(ConnectionRegister::new());
        let peers = Arc::new(PeerConnectionList::new(config.backoff_base));
        let registrar = Arc::new(SubscriptionRegistrar::new());
        let dispatcher = Arc::new(Dispatcher::new());
        let reactor = Arc::new(Reactor::new());

        let router = Arc::new(Router::new(
            Arc::clone(&identity),
            &config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&register),
            dispatcher,
            Arc::clone(&registrar),
        ));

        let direct = Arc::new(DirectMessageService::new(
            identity.address(),
            Arc::clone(&register),
            Arc::clone(&peers),
            Arc::clone(&transport) as Arc<dyn Transport>,
        ));
        router.set_direct_handler(Arc::clone(&direct) as Arc<dyn crate::routing::DirectHandler>);

        let discovery = DiscoveryService::new(config.external_addrs.clone());
        discovery.start(Arc::clone(&router), &registrar);

        let selector = PeerSelector::new(
            config.minimum_peers,
            config.selection_interval,
            Arc::clone(&router),
            Arc::clone(&register),
            Arc::clone(&peers),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&reactor),
        );
        reactor.attach_periodic(Arc::clone(&selector) as Arc<dyn PeriodicRunnable>);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            identity,
            transport,
            events: Some(events),
            register,
            peers,
            registrar,
            router,
            direct,
            discovery,
            selector,
            reactor,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind the listener and drive the node until shutdown.
    pub async fn run(&mut self) -> MeshResult<()> {
        let mut events = self.events.take().ok_or(MeshError::Shutdown)?;

        let local_addr = self.transport.listen(self.config.bind_addr).await?;
        tracing::info!(
            address = %self.identity.address(),
            listen = %local_addr,
            network = %self.config.network_id,
            "Mesh node started",
        );

        // advertise the actual listen endpoint alongside any configured ones
        let mut endpoints = self.config.external_addrs.clone();
        if !endpoints.contains(&local_addr) {
            endpoints.push(local_addr);
        }
        self.discovery.set_endpoints(endpoints);

        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = maintenance.tick() => {
                    self.maintenance(Instant::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(address = %self.identity.address(), "Mesh node stopped");
        Ok(())
    }

    /// Ask a running node to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                handle,
                direction,
                remote,
            } => {
                tracing::debug!(handle, %direction, %remote, "Connection established");
                self.register.add(handle, direction, remote);
                if direction == ConnectionDirection::Outgoing {
                    self.peers.on_connection_established(remote, handle);
                    // the dialing side opens the handshake
                    self.direct.initiate_connection(&self.router, handle);
                }
            }
            TransportEvent::Received { handle, packet } => {
                self.router.route(handle, packet);
            }
            TransportEvent::Disconnected { handle } => {
                tracing::debug!(handle, "Connection lost");
                self.router.connection_dropped(handle);
                self.direct.connection_dropped(handle);
                self.register.remove(handle);
                self.peers.remove_connection(handle);
            }
            TransportEvent::ConnectFailed { addr } => {
                tracing::debug!(%addr, "Outbound dial failed");
                self.peers.record_failure(addr);
            }
        }
    }

    fn maintenance(&self, now: Instant) {
        for addr in self.peers.peers_to_connect_to(now) {
            tracing::debug!(%addr, "Redialing peer");
            self.peers.record_attempt(addr);
            self.transport.connect(addr);
        }
        self.router.cleanup(now);
        self.reactor.poll(now);
    }

    // -- application surface --------------------------------------------

    /// Overlay address of this node.
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Add a dial target to keep connected to.
    pub fn add_peer(&self, addr: SocketAddr) {
        self.peers.add_persistent_peer(addr);
    }

    /// Remove a dial target.
    pub fn remove_peer(&self, addr: SocketAddr) {
        self.peers.remove_persistent_peer(addr);
    }

    /// Mark an overlay address as a desired peer, optionally seeding a known
    /// endpoint for it.
    pub fn add_desired_peer(&self, address: Address, endpoint: Option<SocketAddr>) {
        match endpoint {
            Some(addr) => self.selector.add_desired_peer_with_endpoint(address, addr),
            None => self.selector.add_desired_peer(address),
        }
    }

    /// Drop an overlay address from the desired peer set.
    pub fn remove_desired_peer(&self, address: &Address) {
        self.selector.remove_desired_peer(address);
    }

    /// Drop all traffic from an overlay address.
    pub fn blacklist_peer(&self, address: Address) {
        self.router.blacklist().add(address);
    }

    /// Subscribe to messages on a `(service, channel)` pair.
    pub fn subscribe(&self, service: u16, channel: u16) -> Arc<Subscription> {
        self.registrar.subscribe(service, channel)
    }

    /// Send a payload to an overlay address.
    pub fn send(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        self.router.send(target, service, channel, payload)
    }

    /// Send a payload to every connected peer.
    pub fn broadcast(&self, service: u16, channel: u16, payload: Vec<u8>) -> MeshResult<()> {
        self.router.broadcast(service, channel, payload)
    }

    /// Send a request and get a promise for the correlated response.
    pub fn exchange(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> MeshResult<Promise> {
        self.router.exchange(target, service, channel, payload, ttl)
    }

    /// Point-in-time view of the node's state.
    pub fn status(&self) -> MeshStatus {
        MeshStatus {
            address: self.identity.address(),
            connections: self.register.connection_count(),
            routes: self.router.table().len(),
            desired_peers: self.selector.desired_peers().len(),
            pending_exchanges: self.router.dispatcher().pending_count(),
            counters: self.router.counters().snapshot(),
        }
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("address", &self.identity.address())
            .field("network", &self.config.network_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkId;

    fn test_config() -> MeshConfig {
        MeshConfig::new("127.0.0.1:0".parse().unwrap())
            .with_network_id(NetworkId::new(*b"TEST"))
    }

    #[test]
    fn test_fresh_node_status() {
        let node = MeshNode::new(test_config());
        let status = node.status();

        assert_eq!(status.address, node.address());
        assert_eq!(status.connections, 0);
        assert_eq!(status.routes, 0);
        assert_eq!(status.pending_exchanges, 0);
    }

    #[test]
    fn test_identity_is_stable() {
        let identity = Identity::from_secret([3u8; 32]);
        let address = identity.address();
        let node = MeshNode::with_identity(test_config(), identity);
        assert_eq!(node.address(), address);
    }

    #[test]
    fn test_desired_peer_bookkeeping() {
        let node = MeshNode::new(test_config());
        let peer = Identity::generate().address();

        node.add_desired_peer(peer, Some("10.0.0.1:9433".parse().unwrap()));
        assert_eq!(node.status().desired_peers, 1);

        node.remove_desired_peer(&peer);
        assert_eq!(node.status().desired_peers, 0);
    }

    #[test]
    fn test_send_without_route_fails() {
        let node = MeshNode::new(test_config());
        let target = Identity::generate().address();
        assert!(matches!(
            node.send(target, 1, 1, b"x".to_vec()),
            Err(MeshError::NoRoute(_))
        ));
    }
}
