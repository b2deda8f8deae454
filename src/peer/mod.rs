//! Peer connection tracking.
//!
//! [`ConnectionRegister`] records what is known about each live connection
//! handle; [`PeerConnectionList`] owns the set of desired outbound peers and
//! the retry/backoff policy that drives redialing.

pub mod list;
pub mod register;

pub use list::{ConnectionState, PeerConnectionList, PeerMetadata};
pub use register::{ConnectionInfo, ConnectionRegister};
