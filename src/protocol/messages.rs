//! Handshake messages carried on the reserved routing channel.

use serde::{Deserialize, Serialize};

/// Messages of the connection-establishment handshake.
///
/// These travel as `direct` packets on (SERVICE_MESH, CHANNEL_ROUTING) and are
/// consumed at the first hop, never routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingMessage {
    /// Liveness and identity check sent on every new connection.
    Ping,
    /// Reply to a ping.
    Pong,
    /// Request to bind this connection to the sender's address.
    RoutingRequest,
    /// The reservation was accepted; the connection is a direct route.
    RoutingAccepted,
    /// The reservation was declined or superseded; tear the connection down.
    DisconnectRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for msg in [
            RoutingMessage::Ping,
            RoutingMessage::Pong,
            RoutingMessage::RoutingRequest,
            RoutingMessage::RoutingAccepted,
            RoutingMessage::DisconnectRequest,
        ] {
            let bytes = bincode::serialize(&msg).unwrap();
            let decoded: RoutingMessage = bincode::deserialize(&bytes).unwrap();
            assert_eq!(decoded, msg);
        }
    }
}
