//! Address-to-handle routing table.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::seq::IteratorRandom;

use crate::address::{Address, RawAddress};
use crate::transport::Handle;

/// Outcome of offering a route to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The offered route is already present, or lost to a better one.
    NoChange,
    /// The table now routes the address over the offered handle.
    Updated,
    /// A second direct connection claimed an address that already has one.
    DuplicateDirect,
}

#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    handle: Handle,
    /// Direct routes come from an authenticated handshake on the connection
    /// itself; informed routes are learned from transit traffic.
    direct: bool,
}

/// Maps overlay addresses to the connection a packet for them should leave on.
///
/// Direct routes always win over informed ones: an informed route can never
/// displace a direct route, while a direct route replaces anything. Between
/// two informed routes the most recently learned one wins, so the table
/// tracks the path fresh traffic actually arrives on.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<RawAddress, RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a route for an address.
    pub fn associate(&self, address: RawAddress, handle: Handle, direct: bool) -> UpdateStatus {
        let mut routes = self.routes.lock().unwrap();

        let entry = match routes.get_mut(&address) {
            Some(entry) => entry,
            None => {
                routes.insert(address, RouteEntry { handle, direct });
                tracing::trace!(
                    address = %Address::from_raw(address),
                    handle,
                    direct,
                    "Route added",
                );
                return UpdateStatus::Updated;
            }
        };

        let different_handle = entry.handle != handle;
        let is_different = different_handle || entry.direct != direct;
        let is_upgrade = !entry.direct && direct;

        if direct && entry.direct && different_handle {
            return UpdateStatus::DuplicateDirect;
        }

        if (!entry.direct && is_different) || is_upgrade {
            entry.handle = handle;
            entry.direct = direct;
            tracing::trace!(
                address = %Address::from_raw(address),
                handle,
                direct,
                "Route updated",
            );
            return UpdateStatus::Updated;
        }

        UpdateStatus::NoChange
    }

    /// Handle to send packets for an address on, if any route is known.
    pub fn lookup(&self, address: &RawAddress) -> Option<Handle> {
        self.routes.lock().unwrap().get(address).map(|e| e.handle)
    }

    /// Like [`lookup`](Self::lookup), also reporting whether the route is
    /// direct.
    pub fn lookup_entry(&self, address: &RawAddress) -> Option<(Handle, bool)> {
        self.routes
            .lock()
            .unwrap()
            .get(address)
            .map(|e| (e.handle, e.direct))
    }

    /// A uniformly random known handle, excluding the one a packet arrived on.
    ///
    /// Used as a last resort for transit packets with no known route.
    pub fn lookup_random(&self, exclude: Handle) -> Option<Handle> {
        let routes = self.routes.lock().unwrap();
        routes
            .values()
            .map(|e| e.handle)
            .filter(|h| *h != exclude)
            .choose(&mut rand::thread_rng())
    }

    /// Forget one address.
    pub fn remove(&self, address: &RawAddress) {
        self.routes.lock().unwrap().remove(address);
    }

    /// Drop every route through a lost connection. Returns the addresses that
    /// became unroutable.
    pub fn connection_dropped(&self, handle: Handle) -> Vec<Address> {
        let mut routes = self.routes.lock().unwrap();
        let mut purged = Vec::new();
        routes.retain(|address, entry| {
            if entry.handle == handle {
                purged.push(Address::from_raw(*address));
                false
            } else {
                true
            }
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the table, for status reporting.
    pub fn snapshot(&self) -> Vec<(Address, Handle, bool)> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .map(|(address, entry)| (Address::from_raw(*address), entry.handle, entry.direct))
            .collect()
    }
}
