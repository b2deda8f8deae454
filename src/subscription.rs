//! Message subscriptions and fan-out.
//!
//! Applications register interest in a `(service, channel)` pair, optionally
//! narrowed to a single sender, and receive every matching delivery through a
//! handler closure. Subscriptions are weakly held: dropping the returned
//! [`Subscription`] handle unsubscribes without any explicit call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::address::{Address, RawAddress};
use crate::transport::Handle;

/// A message as handed to subscription handlers.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Originating node of the message.
    pub sender: Address,
    /// Service number of the message.
    pub service: u16,
    /// Channel number of the message.
    pub channel: u16,
    /// Message counter stamped by the sender.
    pub message_num: u16,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Connection the packet arrived on.
    pub last_hop: Handle,
}

type DeliveryHandler = Box<dyn Fn(&Delivery) + Send + Sync>;

/// A live registration of interest. Dropping it cancels the subscription.
pub struct Subscription {
    handler: Mutex<Option<DeliveryHandler>>,
}

impl Subscription {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
        })
    }

    /// Install or replace the handler invoked for each delivery.
    pub fn set_handler(&self, handler: impl Fn(&Delivery) + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    fn dispatch(&self, delivery: &Delivery) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(delivery);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let armed = self.handler.lock().unwrap().is_some();
        f.debug_struct("Subscription").field("armed", &armed).finish()
    }
}

/// All subscriptions sharing one routing key.
#[derive(Default)]
struct Feed {
    subscriptions: Mutex<Vec<Weak<Subscription>>>,
}

impl Feed {
    fn add(&self, subscription: &Arc<Subscription>) {
        self.subscriptions
            .lock()
            .unwrap()
            .push(Arc::downgrade(subscription));
    }

    /// Collect live subscriptions and prune dropped ones in the same pass.
    fn collect(&self) -> Vec<Arc<Subscription>> {
        let mut guard = self.subscriptions.lock().unwrap();
        let mut live = Vec::with_capacity(guard.len());
        guard.retain(|weak| match weak.upgrade() {
            Some(subscription) => {
                live.push(subscription);
                true
            }
            None => false,
        });
        live
    }
}

/// Routes deliveries to subscriptions keyed by `(service, channel)` or by
/// `(sender, service, channel)`.
#[derive(Default)]
pub struct SubscriptionRegistrar {
    by_channel: Mutex<HashMap<(u16, u16), Arc<Feed>>>,
    by_sender: Mutex<HashMap<(RawAddress, u16, u16), Arc<Feed>>>,
}

impl SubscriptionRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every message on a `(service, channel)` pair.
    pub fn subscribe(&self, service: u16, channel: u16) -> Arc<Subscription> {
        let subscription = Subscription::new();
        self.by_channel
            .lock()
            .unwrap()
            .entry((service, channel))
            .or_default()
            .add(&subscription);
        subscription
    }

    /// Subscribe to messages from one sender on a `(service, channel)` pair.
    pub fn subscribe_sender(
        &self,
        sender: Address,
        service: u16,
        channel: u16,
    ) -> Arc<Subscription> {
        let subscription = Subscription::new();
        self.by_sender
            .lock()
            .unwrap()
            .entry((sender.raw(), service, channel))
            .or_default()
            .add(&subscription);
        subscription
    }

    /// Fan a delivery out to the matching subscriptions.
    ///
    /// Sender-filtered subscriptions take precedence: the channel-wide feed
    /// is only consulted when no live sender-filtered subscription matched.
    ///
    /// Returns `true` if at least one live subscription existed for the key,
    /// whether or not it had a handler installed.
    pub fn dispatch(&self, delivery: &Delivery) -> bool {
        let sender_feed = self
            .by_sender
            .lock()
            .unwrap()
            .get(&(delivery.sender.raw(), delivery.service, delivery.channel))
            .cloned();

        // handlers run after the map locks are released
        let mut targets = match sender_feed {
            Some(feed) => feed.collect(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            let channel_feed = self
                .by_channel
                .lock()
                .unwrap()
                .get(&(delivery.service, delivery.channel))
                .cloned();
            if let Some(feed) = channel_feed {
                targets = feed.collect();
            }
        }

        let matched = !targets.is_empty();
        for subscription in targets {
            subscription.dispatch(delivery);
        }
        matched
    }
}

impl std::fmt::Debug for SubscriptionRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistrar")
            .field("channels", &self.by_channel.lock().unwrap().len())
            .field("sender_keys", &self.by_sender.lock().unwrap().len())
            .finish()
    }
}
