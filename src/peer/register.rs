//! Live-connection register.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::address::Address;
use crate::transport::{ConnectionDirection, Handle};

/// What is known about a single live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection handle assigned by the transport.
    pub handle: Handle,
    /// Direction of the connection.
    pub direction: ConnectionDirection,
    /// Remote socket address.
    pub remote: SocketAddr,
    /// Verified overlay address of the peer, once learned.
    pub address: Option<Address>,
}

/// Tracks every live connection handle and the peer address bound to it.
///
/// The register is purely observational: entries appear when the transport
/// reports a connection and disappear when it is lost. Addresses are filled in
/// as soon as any signed packet arrives on the connection.
#[derive(Debug, Default)]
pub struct ConnectionRegister {
    connections: Mutex<HashMap<Handle, ConnectionInfo>>,
}

impl ConnectionRegister {
    /// Create an empty register.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly established connection.
    pub fn add(&self, handle: Handle, direction: ConnectionDirection, remote: SocketAddr) {
        self.connections.lock().unwrap().insert(
            handle,
            ConnectionInfo {
                handle,
                direction,
                remote,
                address: None,
            },
        );
    }

    /// Remove a closed connection.
    pub fn remove(&self, handle: Handle) -> Option<ConnectionInfo> {
        self.connections.lock().unwrap().remove(&handle)
    }

    /// Record the verified overlay address owning a connection.
    pub fn update_address(&self, handle: Handle, address: Address) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&handle) {
            info.address = Some(address);
        }
    }

    /// Look up a connection by handle.
    pub fn lookup(&self, handle: Handle) -> Option<ConnectionInfo> {
        self.connections.lock().unwrap().get(&handle).cloned()
    }

    /// Whether the handle belongs to a connection this node initiated.
    pub fn is_outgoing(&self, handle: Handle) -> bool {
        self.lookup(handle)
            .map(|info| info.direction == ConnectionDirection::Outgoing)
            .unwrap_or(false)
    }

    /// Find the handle bound to an overlay address, if any.
    pub fn lookup_address(&self, address: &Address) -> Option<Handle> {
        self.connections
            .lock()
            .unwrap()
            .values()
            .find(|info| info.address.as_ref() == Some(address))
            .map(|info| info.handle)
    }

    /// All live connection handles.
    pub fn handles(&self) -> Vec<Handle> {
        self.connections.lock().unwrap().keys().copied().collect()
    }

    /// Addresses of all peers with an identified connection.
    pub fn current_address_set(&self) -> HashSet<Address> {
        self.connections
            .lock()
            .unwrap()
            .values()
            .filter_map(|info| info.address)
            .collect()
    }

    /// Addresses of identified peers on connections this node initiated.
    pub fn outgoing_address_set(&self) -> HashSet<Address> {
        self.connections
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.direction == ConnectionDirection::Outgoing)
            .filter_map(|info| info.address)
            .collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Snapshot of every connection, for status reporting.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().unwrap().values().cloned().collect()
    }
}
