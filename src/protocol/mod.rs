//! Wire protocol: packet envelope, framing codec and handshake messages.

pub mod framing;
pub mod messages;
pub mod packet;

pub use framing::PacketCodec;
pub use messages::RoutingMessage;
pub use packet::Packet;
