//! Endpoint discovery.
//!
//! Answers "where can you be dialed?" requests on the reserved discovery
//! channel with this node's advertised socket addresses. The peer selector on
//! the requesting side consumes the reply to turn a desired overlay address
//! into concrete dial targets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::config::{CHANNEL_DISCOVERY, SERVICE_MESH};
use crate::routing::Router;
use crate::subscription::{Subscription, SubscriptionRegistrar};

/// Serves this node's dialable endpoints over the discovery channel.
pub struct DiscoveryService {
    endpoints: Mutex<Vec<SocketAddr>>,
    subscription: Mutex<Option<Arc<Subscription>>>,
}

impl DiscoveryService {
    pub fn new(endpoints: Vec<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(endpoints),
            subscription: Mutex::new(None),
        })
    }

    /// Subscribe to the discovery channel and begin answering requests.
    pub fn start(self: &Arc<Self>, router: Arc<Router>, registrar: &SubscriptionRegistrar) {
        let subscription = registrar.subscribe(SERVICE_MESH, CHANNEL_DISCOVERY);

        let service = Arc::clone(self);
        subscription.set_handler(move |delivery| {
            let endpoints = service.endpoints();
            tracing::trace!(
                requester = %delivery.sender,
                endpoints = endpoints.len(),
                "Answering discovery request",
            );

            let payload = match bincode::serialize(&endpoints) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode endpoint list");
                    return;
                }
            };

            // the reply reuses the request's message number so the waiting
            // promise on the other side can claim it; it carries no exchange
            // flag, which is what marks it as a response
            if let Err(e) = router.send_with_counter(
                delivery.sender,
                SERVICE_MESH,
                CHANNEL_DISCOVERY,
                delivery.message_num,
                payload,
            ) {
                tracing::debug!(requester = %delivery.sender, error = %e, "Discovery reply failed");
            }
        });

        *self.subscription.lock().unwrap() = Some(subscription);
    }

    /// Replace the advertised endpoint list.
    pub fn set_endpoints(&self, endpoints: Vec<SocketAddr>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }

    /// Currently advertised endpoints.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.lock().unwrap().clone()
    }
}

impl DiscoveryService {
    /// Whether the service is subscribed and answering requests.
    pub fn is_active(&self) -> bool {
        self.subscription.lock().unwrap().is_some()
    }
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("active", &self.is_active())
            .field("endpoints", &self.endpoints())
            .finish()
    }
}
