//! End-to-end scenarios over an in-memory transport.
//!
//! Each test node is a full routing stack; a pump moves packets between nodes
//! over explicit links until the network quiesces.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_p2p::address::NetworkId;
use mesh_p2p::config::{CHANNEL_DISCOVERY, SERVICE_MESH};
use mesh_p2p::direct::DirectMessageService;
use mesh_p2p::discovery::DiscoveryService;
use mesh_p2p::dispatch::Dispatcher;
use mesh_p2p::peer::{ConnectionRegister, PeerConnectionList};
use mesh_p2p::routing::Router;
use mesh_p2p::subscription::SubscriptionRegistrar;
use mesh_p2p::transport::ConnectionDirection;
use mesh_p2p::{
    Address, Handle, Identity, MeshConfig, MeshError, MeshResult, Packet, PromiseState, Transport,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("mesh_p2p=trace")
        .try_init();
}

struct MockTransport {
    outbox: Mutex<Vec<(Handle, Packet)>>,
    closed: Mutex<HashSet<Handle>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outbox: Mutex::new(Vec::new()),
            closed: Mutex::new(HashSet::new()),
        })
    }

    fn drain(&self) -> Vec<(Handle, Packet)> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    fn is_closed(&self, handle: Handle) -> bool {
        self.closed.lock().unwrap().contains(&handle)
    }
}

impl Transport for MockTransport {
    fn connect(&self, _addr: SocketAddr) {}

    fn send(&self, handle: Handle, packet: &Packet) -> MeshResult<()> {
        if self.is_closed(handle) {
            return Err(MeshError::ConnectionClosed(handle));
        }
        self.outbox.lock().unwrap().push((handle, packet.clone()));
        Ok(())
    }

    fn close(&self, handle: Handle) {
        self.closed.lock().unwrap().insert(handle);
    }
}

struct TestNode {
    identity: Arc<Identity>,
    transport: Arc<MockTransport>,
    register: Arc<ConnectionRegister>,
    registrar: Arc<SubscriptionRegistrar>,
    router: Arc<Router>,
    direct: Arc<DirectMessageService>,
}

impl TestNode {
    fn build() -> Self {
        let identity = Arc::new(Identity::generate());
        let config = MeshConfig::default().with_network_id(NetworkId::new(*b"TEST"));
        let transport = MockTransport::new();
        let register = Arc::new(ConnectionRegister::new());
        let registrar = Arc::new(SubscriptionRegistrar::new());
        let router = Arc::new(Router::new(
            Arc::clone(&identity),
            &config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&register),
            Arc::new(Dispatcher::new()),
            Arc::clone(&registrar),
        ));
        let direct = Arc::new(DirectMessageService::new(
            identity.address(),
            Arc::clone(&register),
            Arc::new(PeerConnectionList::new(Duration::from_secs(2))),
            Arc::clone(&transport) as Arc<dyn Transport>,
        ));
        router.set_direct_handler(
            Arc::clone(&direct) as Arc<dyn mesh_p2p::routing::DirectHandler>
        );

        Self {
            identity,
            transport,
            register,
            registrar,
            router,
            direct,
        }
    }

    fn address(&self) -> Address {
        self.identity.address()
    }
}

/// Bidirectional links between (node index, handle) endpoints.
#[derive(Default)]
struct Net {
    links: HashMap<(usize, Handle), (usize, Handle)>,
}

impl Net {
    /// Wire node `a` (dialer, `ha`) to node `b` (acceptor, `hb`) and start
    /// the handshake from the dialing side.
    fn connect(&mut self, nodes: &[TestNode], a: usize, ha: Handle, b: usize, hb: Handle) {
        let remote: SocketAddr = "127.0.0.1:9433".parse().unwrap();
        nodes[a]
            .register
            .add(ha, ConnectionDirection::Outgoing, remote);
        nodes[b]
            .register
            .add(hb, ConnectionDirection::Incoming, remote);
        self.links.insert((a, ha), (b, hb));
        self.links.insert((b, hb), (a, ha));
        nodes[a].direct.initiate_connection(&nodes[a].router, ha);
    }

    /// Move packets across links until nothing is in flight.
    fn pump(&self, nodes: &[TestNode]) {
        for _ in 0..64 {
            let mut progressed = false;
            for (i, node) in nodes.iter().enumerate() {
                for (handle, packet) in node.transport.drain() {
                    let (j, hj) = match self.links.get(&(i, handle)) {
                        Some(link) => *link,
                        None => continue,
                    };
                    // the far end already tore this connection down
                    if nodes[j].transport.is_closed(hj) {
                        continue;
                    }
                    nodes[j].router.route(hj, packet);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("network did not quiesce");
    }
}

fn capture_payloads(node: &TestNode, service: u16, channel: u16) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let subscription = node.registrar.subscribe(service, channel);
    let sink = Arc::clone(&received);
    subscription.set_handler(move |delivery| {
        sink.lock().unwrap().push(delivery.payload.clone());
    });
    // keep the subscription alive for the duration of the test
    std::mem::forget(subscription);
    received
}

#[test]
fn test_handshake_establishes_direct_routes_both_ways() {
    init_tracing();
    let nodes = [TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.pump(&nodes);

    assert_eq!(
        nodes[0].router.table().lookup_entry(&nodes[1].address().raw()),
        Some((1, true))
    );
    assert_eq!(
        nodes[1].router.table().lookup_entry(&nodes[0].address().raw()),
        Some((1, true))
    );
}

#[test]
fn test_send_after_handshake_reaches_subscriber() {
    init_tracing();
    let nodes = [TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.pump(&nodes);

    let received = capture_payloads(&nodes[1], 20, 5);
    nodes[0]
        .router
        .send(nodes[1].address(), 20, 5, b"ahoy".to_vec())
        .unwrap();
    net.pump(&nodes);

    assert_eq!(received.lock().unwrap().as_slice(), &[b"ahoy".to_vec()]);
    assert_eq!(nodes[1].router.counters().snapshot().delivered, 1);
}

#[test]
fn test_multi_hop_forwarding() {
    init_tracing();
    // a - b - c: a and c are not directly connected
    let nodes = [TestNode::build(), TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.connect(&nodes, 1, 2, 2, 2);
    net.pump(&nodes);

    // c broadcasts; the relayed copy teaches a an informed route to c
    nodes[2].router.broadcast(30, 7, b"hello".to_vec()).unwrap();
    net.pump(&nodes);
    assert_eq!(
        nodes[0].router.table().lookup(&nodes[2].address().raw()),
        Some(1)
    );

    let received = capture_payloads(&nodes[2], 30, 8);
    nodes[0]
        .router
        .send(nodes[2].address(), 30, 8, b"across".to_vec())
        .unwrap();
    net.pump(&nodes);

    assert_eq!(received.lock().unwrap().as_slice(), &[b"across".to_vec()]);
    assert!(nodes[1].router.counters().snapshot().forwarded >= 1);
}

#[test]
fn test_crossed_connections_converge_on_one_link() {
    init_tracing();
    let nodes = [TestNode::build(), TestNode::build()];
    let (lo, hi) = if nodes[0].address() < nodes[1].address() {
        (0, 1)
    } else {
        (1, 0)
    };

    let mut net = Net::default();
    // both nodes dial each other at the same time
    net.connect(&nodes, lo, 10, hi, 11);
    net.connect(&nodes, hi, 20, lo, 21);
    net.pump(&nodes);

    // the connection dialed by the lower-addressed node survives on both ends
    assert_eq!(
        nodes[lo].router.table().lookup_entry(&nodes[hi].address().raw()),
        Some((10, true))
    );
    assert_eq!(
        nodes[hi].router.table().lookup_entry(&nodes[lo].address().raw()),
        Some((11, true))
    );

    // the losing link got torn down
    assert!(nodes[hi].transport.is_closed(20) || nodes[lo].transport.is_closed(21));

    // traffic flows over the surviving link
    let received = capture_payloads(&nodes[hi], 40, 1);
    nodes[lo]
        .router
        .send(nodes[hi].address(), 40, 1, b"still here".to_vec())
        .unwrap();
    net.pump(&nodes);
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn test_discovery_exchange_returns_endpoints() {
    init_tracing();
    let nodes = [TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.pump(&nodes);

    let advertised: Vec<SocketAddr> = vec!["203.0.113.5:9433".parse().unwrap()];
    let discovery = DiscoveryService::new(advertised.clone());
    discovery.start(Arc::clone(&nodes[1].router), &nodes[1].registrar);

    let promise = nodes[0]
        .router
        .exchange(
            nodes[1].address(),
            SERVICE_MESH,
            CHANNEL_DISCOVERY,
            Vec::new(),
            Duration::from_secs(5),
        )
        .unwrap();
    net.pump(&nodes);

    match promise.state() {
        PromiseState::Success(payload) => {
            let endpoints: Vec<SocketAddr> = bincode::deserialize(&payload).unwrap();
            assert_eq!(endpoints, advertised);
        }
        state => panic!("exchange did not complete: {}", state),
    }
}

#[test]
fn test_simultaneous_discovery_exchanges_both_resolve() {
    init_tracing();
    // both nodes resolve each other at once; with counters advancing in
    // lockstep the two requests carry the same message number, and each
    // node must still answer the other's request rather than letting it
    // resolve its own pending promise
    let nodes = [TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.pump(&nodes);

    let endpoints: [Vec<SocketAddr>; 2] = [
        vec!["203.0.113.1:9433".parse().unwrap()],
        vec!["203.0.113.2:9433".parse().unwrap()],
    ];
    for (node, advertised) in nodes.iter().zip(&endpoints) {
        let discovery = DiscoveryService::new(advertised.clone());
        discovery.start(Arc::clone(&node.router), &node.registrar);
        std::mem::forget(discovery);
    }

    let promises: Vec<_> = [(0usize, 1usize), (1, 0)]
        .into_iter()
        .map(|(from, to)| {
            nodes[from]
                .router
                .exchange(
                    nodes[to].address(),
                    SERVICE_MESH,
                    CHANNEL_DISCOVERY,
                    Vec::new(),
                    Duration::from_secs(5),
                )
                .unwrap()
        })
        .collect();
    net.pump(&nodes);

    for (promise, expected) in promises.iter().zip([&endpoints[1], &endpoints[0]]) {
        match promise.state() {
            PromiseState::Success(payload) => {
                let resolved: Vec<SocketAddr> = bincode::deserialize(&payload).unwrap();
                assert_eq!(&resolved, expected);
            }
            state => panic!("exchange did not complete: {}", state),
        }
    }
}

#[test]
fn test_blacklisted_sender_cannot_deliver() {
    init_tracing();
    let nodes = [TestNode::build(), TestNode::build()];
    let mut net = Net::default();
    net.connect(&nodes, 0, 1, 1, 1);
    net.pump(&nodes);

    let received = capture_payloads(&nodes[1], 50, 2);
    nodes[1].router.blacklist().add(nodes[0].address());

    nodes[0]
        .router
        .send(nodes[1].address(), 50, 2, b"unwelcome".to_vec())
        .unwrap();
    net.pump(&nodes);

    assert!(received.lock().unwrap().is_empty());
    assert_eq!(nodes[1].router.counters().snapshot().dropped_blacklisted, 1);
}
