//! The packet routing core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::address::{Address, NetworkId};
use crate::config::MeshConfig;
use crate::crypto::Identity;
use crate::dispatch::Dispatcher;
use crate::error::{MeshError, MeshResult};
use crate::peer::ConnectionRegister;
use crate::promise::Promise;
use crate::protocol::Packet;
use crate::routing::{Blacklist, EchoCache, RoutingTable, UpdateStatus};
use crate::subscription::{Delivery, SubscriptionRegistrar};
use crate::transport::{Handle, Transport};

/// Handler for packets flagged direct, i.e. addressed to the connection
/// rather than to an overlay address.
pub trait DirectHandler: Send + Sync {
    fn on_direct_message(&self, router: &Router, handle: Handle, packet: &Packet);
}

/// Routing statistics. All counters are monotonic.
#[derive(Debug, Default)]
pub struct RouterCounters {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped_foreign_network: AtomicU64,
    pub dropped_echo: AtomicU64,
    pub dropped_blacklisted: AtomicU64,
    pub dropped_bad_signature: AtomicU64,
    pub dropped_ttl_expired: AtomicU64,
    pub dropped_no_route: AtomicU64,
}

/// Plain-value copy of [`RouterCounters`], for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCounterSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped_foreign_network: u64,
    pub dropped_echo: u64,
    pub dropped_blacklisted: u64,
    pub dropped_bad_signature: u64,
    pub dropped_ttl_expired: u64,
    pub dropped_no_route: u64,
}

impl RouterCounters {
    pub fn snapshot(&self) -> RouterCounterSnapshot {
        RouterCounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_foreign_network: self.dropped_foreign_network.load(Ordering::Relaxed),
            dropped_echo: self.dropped_echo.load(Ordering::Relaxed),
            dropped_blacklisted: self.dropped_blacklisted.load(Ordering::Relaxed),
            dropped_bad_signature: self.dropped_bad_signature.load(Ordering::Relaxed),
            dropped_ttl_expired: self.dropped_ttl_expired.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
        }
    }
}

/// Decides, for every packet seen, whether to drop it, deliver it locally or
/// forward it towards its target.
///
/// The router is synchronous and lock-internal; the node's event loop feeds it
/// received packets one at a time and services originate packets through it
/// from any thread.
pub struct Router {
    identity: Arc<Identity>,
    network: NetworkId,
    default_ttl: u8,
    disconnect_blacklisted: bool,

    table: RoutingTable,
    echo: EchoCache,
    blacklist: Blacklist,

    transport: Arc<dyn Transport>,
    register: Arc<ConnectionRegister>,
    dispatcher: Arc<Dispatcher>,
    registrar: Arc<SubscriptionRegistrar>,
    direct_handler: Mutex<Option<Arc<dyn DirectHandler>>>,

    counters: Arc<RouterCounters>,
}

impl Router {
    pub fn new(
        identity: Arc<Identity>,
        config: &MeshConfig,
        transport: Arc<dyn Transport>,
        register: Arc<ConnectionRegister>,
        dispatcher: Arc<Dispatcher>,
        registrar: Arc<SubscriptionRegistrar>,
    ) -> Self {
        Self {
            identity,
            network: config.network_id,
            default_ttl: config.default_ttl,
            disconnect_blacklisted: config.disconnect_blacklisted,
            table: RoutingTable::new(),
            echo: EchoCache::new(config.echo_capacity, config.echo_window),
            blacklist: Blacklist::new(),
            transport,
            register,
            dispatcher,
            registrar,
            direct_handler: Mutex::new(None),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    /// Install the handler for direct-flagged packets.
    pub fn set_direct_handler(&self, handler: Arc<dyn DirectHandler>) {
        *self.direct_handler.lock().unwrap() = Some(handler);
    }

    /// Overlay address of this node.
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn counters(&self) -> Arc<RouterCounters> {
        Arc::clone(&self.counters)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Subscribe to messages on a `(service, channel)` pair.
    pub fn subscribe(&self, service: u16, channel: u16) -> Arc<crate::subscription::Subscription> {
        self.registrar.subscribe(service, channel)
    }

    /// Subscribe to messages from one sender on a `(service, channel)` pair.
    pub fn subscribe_from(
        &self,
        sender: Address,
        service: u16,
        channel: u16,
    ) -> Arc<crate::subscription::Subscription> {
        self.registrar.subscribe_sender(sender, service, channel)
    }

    /// Addresses reachable over a direct (handshaken) connection.
    pub fn directly_connected_peers(&self) -> Vec<Address> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|(_, _, direct)| *direct)
            .map(|(address, _, _)| address)
            .collect()
    }

    // -- origination ----------------------------------------------------

    /// Send a payload to an overlay address.
    pub fn send(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        let counter = self.dispatcher.next_counter();
        self.send_with_counter(target, service, channel, counter, payload)
    }

    /// Send a payload with an explicit message number.
    ///
    /// Used for exchange responses, which must echo the request's number so
    /// the requester can correlate them. Responses deliberately do not carry
    /// the exchange flag: only the request is flagged, and the dispatcher on
    /// the requesting side claims unflagged packets exclusively. A flagged
    /// response would look like a fresh request and could be claimed by an
    /// unrelated pending promise whose counter happens to collide.
    pub fn send_with_counter(
        &self,
        target: Address,
        service: u16,
        channel: u16,
        counter: u16,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        let mut packet = self.make_packet(service, channel, counter, payload);
        packet.set_target(target);
        packet.sign(&self.identity);

        // register our own packet so a looped-back copy is dropped as an echo
        self.echo.observe(packet.echo_id(), Instant::now());

        let handle = self
            .table
            .lookup(&target.raw())
            .ok_or(MeshError::NoRoute(target))?;
        self.deliver_to_handle(handle, packet, target)
    }

    /// Send a payload to every connected peer.
    pub fn broadcast(&self, service: u16, channel: u16, payload: Vec<u8>) -> MeshResult<()> {
        let counter = self.dispatcher.next_counter();
        let mut packet = self.make_packet(service, channel, counter, payload);
        packet.set_broadcast(true);
        packet.sign(&self.identity);

        self.echo.observe(packet.echo_id(), Instant::now());

        for handle in self.register.handles() {
            if let Err(e) = self.transport.send(handle, &packet) {
                tracing::trace!(handle, error = %e, "Broadcast send failed");
            }
        }
        Ok(())
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
        let counter = self.dispatcher.next_counter();
        let promise = self.dispatcher.register_exchange(service, channel, counter, ttl);

        let handle = match self.table.lookup(&target.raw()) {
            Some(handle) => handle,
            None => {
                promise.fail("no route to target");
                return Err(MeshError::NoRoute(target));
            }
        };

        let mut packet = self.make_packet(service, channel, counter, payload);
        packet.set_target(target);
        packet.set_exchange(true);
        packet.sign(&self.identity);
        self.echo.observe(packet.echo_id(), Instant::now());

        if let Err(e) = self.transport.send(handle, &packet) {
            promise.fail("send failed");
            return Err(e);
        }
        self.dispatcher.notify_message(handle, service, channel, counter);
        Ok(promise)
    }

    /// Send a direct-flagged packet to one connection, bypassing the table.
    pub fn send_direct(
        &self,
        handle: Handle,
        service: u16,
        channel: u16,
        payload: Vec<u8>,
    ) -> MeshResult<()> {
        let counter = self.dispatcher.next_counter();
        let mut packet = self.make_packet(service, channel, counter, payload);
        packet.set_direct(true);
        packet.sign(&self.identity);
        self.echo.observe(packet.echo_id(), Instant::now());
        self.transport.send(handle, &packet)
    }

    fn make_packet(&self, service: u16, channel: u16, counter: u16, payload: Vec<u8>) -> Packet {
        let mut packet = Packet::new(self.identity.address(), self.network);
        packet.set_ttl(self.default_ttl);
        packet.set_service(service);
        packet.set_channel(channel);
        packet.set_message_num(counter);
        packet.set_payload(payload);
        packet
    }

    // -- input path -----------------------------------------------------

    /// Process a packet received on a connection.
    pub fn route(&self, handle: Handle, packet: Packet) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if packet.network() != self.network.value() {
            self.counters
                .dropped_foreign_network
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(handle, network = packet.network(), "Dropping foreign packet");
            return;
        }

        if self.echo.observe(packet.echo_id(), Instant::now()) {
            self.counters.dropped_echo.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sender = packet.sender();
        if self.blacklist.contains(&sender) {
            self.counters
                .dropped_blacklisted
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(handle, %sender, "Dropping packet from blacklisted sender");
            if self.disconnect_blacklisted {
                self.transport.close(handle);
            }
            return;
        }

        if !packet.verify() {
            self.counters
                .dropped_bad_signature
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(handle, %sender, "Dropping packet with invalid signature");
            return;
        }

        if packet.is_direct() {
            let handler = self.direct_handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler.on_direct_message(self, handle, &packet);
            } else {
                tracing::debug!(handle, "Direct packet with no handler installed");
            }
            return;
        }

        // every verified transit packet teaches us a route back to its sender
        if sender != self.identity.address() {
            if self.table.associate(sender.raw(), handle, false) == UpdateStatus::Updated {
                tracing::trace!(%sender, handle, "Learned informed route");
            }
        }

        if packet.is_broadcast() {
            self.deliver_local(handle, &packet);
            self.relay_broadcast(handle, packet);
            return;
        }

        match packet.target() {
            Some(target) if target == self.identity.address() => {
                self.deliver_local(handle, &packet);
            }
            Some(_) => self.forward(handle, packet),
            None => self.deliver_local(handle, &packet),
        }
    }

    /// Tear down all routing state for a lost connection.
    pub fn connection_dropped(&self, handle: Handle) {
        let purged = self.table.connection_dropped(handle);
        if !purged.is_empty() {
            tracing::debug!(handle, routes = purged.len(), "Purged routes for lost connection");
        }
        self.dispatcher.connection_dropped(handle);
    }

    /// Periodic housekeeping, driven from the node maintenance tick.
    pub fn cleanup(&self, now: Instant) {
        self.dispatcher.cleanup(now);
    }

    // -- delivery and forwarding ----------------------------------------

    fn deliver_local(&self, handle: Handle, packet: &Packet) {
        // only unflagged packets can be exchange responses; a flagged packet
        // is a request and must always fall through to the subscriptions
        if !packet.is_exchange() && self.dispatcher.dispatch(packet) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let delivery = Delivery {
            sender: packet.sender(),
            service: packet.service(),
            channel: packet.channel(),
            message_num: packet.message_num(),
            payload: packet.payload().to_vec(),
            last_hop: handle,
        };

        if self.registrar.dispatch(&delivery) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::trace!(
                service = packet.service(),
                channel = packet.channel(),
                "No subscriber for delivered packet",
            );
        }
    }

    fn relay_broadcast(&self, arrival: Handle, mut packet: Packet) {
        if packet.ttl() <= 1 {
            self.counters
                .dropped_ttl_expired
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        packet.set_ttl(packet.ttl() - 1);

        let mut relayed = false;
        for handle in self.register.handles() {
            if handle == arrival {
                continue;
            }
            if self.transport.send(handle, &packet).is_ok() {
                relayed = true;
            }
        }
        if relayed {
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn forward(&self, arrival: Handle, mut packet: Packet) {
        if packet.ttl() <= 1 {
            self.counters
                .dropped_ttl_expired
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(packet = %packet, "Dropping packet with expired TTL");
            return;
        }
        packet.set_ttl(packet.ttl() - 1);

        let target_raw = match packet.target_raw() {
            Some(raw) => *raw,
            None => return,
        };
        let target = Address::from_raw(target_raw);

        let handle = match self.table.lookup(&target_raw) {
            Some(handle) => handle,
            None => {
                // transit packet with no known route: take a random punt
                // rather than silently killing someone else's traffic
                match self.table.lookup_random(arrival) {
                    Some(handle) => {
                        tracing::trace!(%target, handle, "Speculatively routing packet");
                        handle
                    }
                    None => {
                        self.counters
                            .dropped_no_route
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(%target, "Dropping packet with no route");
                        return;
                    }
                }
            }
        };

        if self.deliver_to_handle(handle, packet, target).is_ok() {
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .dropped_no_route
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Send on a handle, retrying once over a fresh route if the connection
    /// turns out to be gone.
    fn deliver_to_handle(
        &self,
        handle: Handle,
        packet: Packet,
        target: Address,
    ) -> MeshResult<()> {
        match self.transport.send(handle, &packet) {
            Ok(()) => Ok(()),
            Err(MeshError::ConnectionClosed(_)) => {
                self.connection_dropped(handle);
                match self.table.lookup(&target.raw()) {
                    Some(fresh) if fresh != handle => self.transport.send(fresh, &packet),
                    _ => Err(MeshError::NoRoute(target)),
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("address", &self.identity.address())
            .field("routes", &self.table.len())
            .finish()
    }
}
