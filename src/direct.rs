//! Connection handshake and direct-route reservation.
//!
//! When a connection comes up the two ends run a short handshake over
//! direct-flagged packets on the reserved routing channel: ping, pong, then a
//! routing request binding the connection to the requester's address. The
//! receiving end keeps one reservation per peer address; when both nodes dial
//! each other at once, a deterministic tie-break on the address ordering
//! decides which of the two connections survives, and it decides the same way
//! on both ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::address::Address;
use crate::config::{CHANNEL_ROUTING, SERVICE_MESH};
use crate::peer::{ConnectionRegister, PeerConnectionList};
use crate::protocol::{Packet, RoutingMessage};
use crate::routing::{DirectHandler, Router};
use crate::transport::{Handle, Transport};

/// Outcome of offering a connection for a peer-address reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// First reservation for this address.
    Added,
    /// This connection already holds the reservation.
    Duplicate,
    /// The offered connection won the tie-break; the previous holder loses.
    Replaced(Handle),
    /// The offered connection lost the tie-break.
    Rejected,
}

/// Runs the connection handshake and owns the per-address reservations.
pub struct DirectMessageService {
    address: Address,
    register: Arc<ConnectionRegister>,
    peers: Arc<PeerConnectionList>,
    transport: Arc<dyn Transport>,
    reservations: Mutex<HashMap<Address, Handle>>,
}

impl DirectMessageService {
    pub fn new(
        address: Address,
        register: Arc<ConnectionRegister>,
        peers: Arc<PeerConnectionList>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            address,
            register,
            peers,
            transport,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Kick off the handshake on a freshly established outbound connection.
    pub fn initiate_connection(&self, router: &Router, handle: Handle) {
        tracing::debug!(handle, "Initiating handshake");
        self.send_message(router, handle, RoutingMessage::Ping);
    }

    /// Ask the peer on `handle` to tear the connection down.
    pub fn request_disconnect(&self, router: &Router, handle: Handle) {
        self.send_message(router, handle, RoutingMessage::DisconnectRequest);
    }

    /// Forget any reservation held by a lost connection.
    pub fn connection_dropped(&self, handle: Handle) {
        self.reservations
            .lock()
            .unwrap()
            .retain(|_, held| *held != handle);
    }

    /// Address currently reserved on a connection, if any.
    pub fn reserved_address(&self, handle: Handle) -> Option<Address> {
        self.reservations
            .lock()
            .unwrap()
            .iter()
            .find(|(_, held)| **held == handle)
            .map(|(address, _)| *address)
    }

    fn send_message(&self, router: &Router, handle: Handle, message: RoutingMessage) {
        let payload = match bincode::serialize(&message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode handshake message");
                return;
            }
        };
        if let Err(e) = router.send_direct(handle, SERVICE_MESH, CHANNEL_ROUTING, payload) {
            tracing::debug!(handle, error = %e, "Failed to send handshake message");
        }
    }

    /// Decide whether `handle` may hold the reservation for `peer`.
    ///
    /// With crossed connections both nodes evaluate this independently, so the
    /// rule must pick the same surviving connection on both ends: the
    /// connection dialed by the lower-addressed node wins.
    fn update_reservation(&self, peer: Address, handle: Handle) -> ReservationStatus {
        let mut reservations = self.reservations.lock().unwrap();

        let previous = match reservations.get(&peer) {
            Some(previous) => *previous,
            None => {
                reservations.insert(peer, handle);
                return ReservationStatus::Added;
            }
        };
        if previous == handle {
            return ReservationStatus::Duplicate;
        }

        let is_outgoing = self.register.is_outgoing(handle);
        let keep_new =
            ((self.address < peer) && is_outgoing) || ((self.address > peer) && !is_outgoing);

        if keep_new {
            reservations.insert(peer, handle);
            ReservationStatus::Replaced(previous)
        } else {
            ReservationStatus::Rejected
        }
    }

    fn accept(&self, router: &Router, peer: Address, handle: Handle) {
        self.register.update_address(handle, peer);
        router.table().associate(peer.raw(), handle, true);
    }

    /// Apply a reservation offer for `peer` arriving on `handle`.
    ///
    /// Both a received `RoutingRequest` and a received `RoutingAccepted` are
    /// offers; running them through the same tie-break is what makes the two
    /// ends of a crossed pair converge on the same surviving connection.
    fn on_reservation_offer(
        &self,
        router: &Router,
        peer: Address,
        handle: Handle,
        acknowledge: bool,
    ) {
        match self.update_reservation(peer, handle) {
            ReservationStatus::Added | ReservationStatus::Duplicate => {
                tracing::debug!(%peer, handle, "Reservation accepted");
                self.accept(router, peer, handle);
                if acknowledge {
                    self.send_message(router, handle, RoutingMessage::RoutingAccepted);
                }
            }
            ReservationStatus::Replaced(previous) => {
                tracing::debug!(%peer, handle, previous, "Reservation moved to new connection");
                // evict the stale direct route so the new one can land
                router.table().remove(&peer.raw());
                self.accept(router, peer, handle);
                if acknowledge {
                    self.send_message(router, handle, RoutingMessage::RoutingAccepted);
                }
                self.send_message(router, previous, RoutingMessage::DisconnectRequest);
            }
            ReservationStatus::Rejected => {
                tracing::debug!(%peer, handle, "Reservation rejected, duplicate connection");
                self.send_message(router, handle, RoutingMessage::DisconnectRequest);
            }
        }
    }
}

impl DirectHandler for DirectMessageService {
    fn on_direct_message(&self, router: &Router, handle: Handle, packet: &Packet) {
        let message: RoutingMessage = match bincode::deserialize(packet.payload()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(handle, error = %e, "Undecodable handshake message");
                return;
            }
        };

        let peer = packet.sender();
        tracing::trace!(handle, %peer, ?message, "Handshake message");

        match message {
            RoutingMessage::Ping => {
                self.send_message(router, handle, RoutingMessage::Pong);
            }
            RoutingMessage::Pong => {
                self.send_message(router, handle, RoutingMessage::RoutingRequest);
            }
            RoutingMessage::RoutingRequest => {
                self.on_reservation_offer(router, peer, handle, true);
            }
            RoutingMessage::RoutingAccepted => {
                self.on_reservation_offer(router, peer, handle, false);
            }
            RoutingMessage::DisconnectRequest => {
                tracing::debug!(%peer, handle, "Peer requested disconnect");
                self.connection_dropped(handle);
                if self.register.is_outgoing(handle) {
                    // we dialed this connection; stop redialing it as well
                    self.peers.remove_persistent_peer_by_handle(handle);
                } else {
                    // tell the dialing side to stop using it too
                    self.send_message(router, handle, RoutingMessage::DisconnectRequest);
                }
                self.transport.close(handle);
            }
        }
    }
}
