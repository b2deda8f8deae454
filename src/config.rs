//! Mesh configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::NetworkId;

/// Network magic bytes identifying the mesh wire protocol.
pub const NETWORK_MAGIC: [u8; 4] = [0x4D, 0x45, 0x53, 0x48]; // "MESH"

/// Maximum framed message size in bytes (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Current overlay protocol version.
pub const PROTOCOL_VERSION: u8 = 2;

/// Service number reserved for overlay-internal traffic.
pub const SERVICE_MESH: u16 = 0xF000;

/// Channel carrying the connection handshake protocol.
pub const CHANNEL_ROUTING: u16 = 1;

/// Channel carrying address-resolution requests and replies.
pub const CHANNEL_DISCOVERY: u16 = 2;

/// Default hop limit stamped on outgoing packets.
pub const DEFAULT_TTL: u8 = 40;

/// Default time window during which a packet is considered an echo.
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(600);

/// Default capacity of the echo cache.
pub const DEFAULT_ECHO_CAPACITY: usize = 10_000;

/// Base delay of the connection retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Maximum backoff level; the retry window stops doubling here.
pub const MAX_BACKOFF_LEVEL: u64 = 5;

/// Consecutive connection failures after which an endpoint is unreachable.
pub const UNREACHABLE_FAILURE_THRESHOLD: u64 = 6;

/// Minimum number of connected peers kept alive while rebalancing.
pub const DEFAULT_MINIMUM_PEERS: usize = 3;

/// Default timeout for establishing outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval of the peer-selection control loop.
pub const DEFAULT_SELECTION_INTERVAL: Duration = Duration::from_millis(500);

/// Default interval of the node maintenance tick.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(2500);

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,

    /// Overlay namespace this node participates in.
    pub network_id: NetworkId,

    /// Hop limit stamped on packets originated by this node.
    pub default_ttl: u8,

    /// Echo cache expiry window.
    pub echo_window: Duration,

    /// Echo cache capacity.
    pub echo_capacity: usize,

    /// Base delay used for connection retry backoff.
    pub backoff_base: Duration,

    /// Minimum number of connections kept while pruning unwanted peers.
    pub minimum_peers: usize,

    /// Timeout for establishing outbound connections.
    pub connect_timeout: Duration,

    /// Interval of the peer-selection control loop.
    pub selection_interval: Duration,

    /// Interval of the node maintenance tick.
    pub maintenance_interval: Duration,

    /// Externally reachable endpoints advertised via discovery.
    pub external_addrs: Vec<SocketAddr>,

    /// Whether blacklisted senders also have their connection closed.
    pub disconnect_blacklisted: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9433".parse().unwrap(),
            network_id: NetworkId::new(*b"MAIN"),
            default_ttl: DEFAULT_TTL,
            echo_window: DEFAULT_ECHO_WINDOW,
            echo_capacity: DEFAULT_ECHO_CAPACITY,
            backoff_base: DEFAULT_BACKOFF_BASE,
            minimum_peers: DEFAULT_MINIMUM_PEERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            selection_interval: DEFAULT_SELECTION_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            external_addrs: Vec::new(),
            disconnect_blacklisted: true,
        }
    }
}

impl MeshConfig {
    /// Create a new configuration with the specified bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the overlay namespace.
    pub fn with_network_id(mut self, network_id: NetworkId) -> Self {
        self.network_id = network_id;
        self
    }

    /// Set the default hop limit.
    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the echo cache expiry window.
    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    /// Set the base delay for connection retry backoff.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the minimum connected-peer floor.
    pub fn with_minimum_peers(mut self, minimum: usize) -> Self {
        self.minimum_peers = minimum;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the externally advertised endpoints.
    pub fn with_external_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.external_addrs = addrs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.default_ttl, DEFAULT_TTL);
        assert_eq!(config.minimum_peers, DEFAULT_MINIMUM_PEERS);
        assert_eq!(config.echo_window, DEFAULT_ECHO_WINDOW);
    }

    #[test]
    fn test_config_builder() {
        let config = MeshConfig::new("127.0.0.1:9999".parse().unwrap())
            .with_network_id(NetworkId::new(*b"TEST"))
            .with_default_ttl(10)
            .with_minimum_peers(1);

        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(format!("{}", config.network_id), "TEST");
        assert_eq!(config.default_ttl, 10);
        assert_eq!(config.minimum_peers, 1);
    }
}
