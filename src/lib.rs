//! Authenticated overlay routing for the Mesh network.
//!
//! Every node holds an ed25519 identity; its public key is its overlay
//! address. Nodes exchange signed [`Packet`]s over TCP connections, learn
//! routes from the traffic they carry, and forward packets hop by hop until
//! they reach their target. On top of the routed layer sit a pub/sub
//! subscription surface, a request/response exchange mechanism and a peer
//! selection loop that keeps the node connected to the peers it wants.
//!
//! [`MeshNode`] owns the whole stack:
//!
//! ```no_run
//! use mesh_p2p::{MeshConfig, MeshNode};
//!
//! #[tokio::main]
//! async fn main() -> mesh_p2p::MeshResult<()> {
//!     let config = MeshConfig::new("0.0.0.0:9433".parse().unwrap());
//!     let mut node = MeshNode::new(config);
//!
//!     let updates = node.subscribe(10, 1);
//!     updates.set_handler(|delivery| {
//!         println!("{} sent {} bytes", delivery.sender, delivery.payload.len());
//!     });
//!
//!     node.add_peer("198.51.100.7:9433".parse().unwrap());
//!     node.run().await
//! }
//! ```

pub mod address;
pub mod config;
pub mod crypto;
pub mod direct;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod peer;
pub mod promise;
pub mod protocol;
pub mod reactor;
pub mod routing;
pub mod selector;
pub mod subscription;
pub mod transport;

pub use address::{Address, NetworkId, RawAddress, ADDRESS_SIZE};
pub use config::MeshConfig;
pub use crypto::Identity;
pub use error::{MeshError, MeshResult};
pub use node::{MeshNode, MeshStatus};
pub use promise::{Promise, PromiseState};
pub use protocol::Packet;
pub use routing::Router;
pub use subscription::{Delivery, Subscription};
pub use transport::{Handle, Transport, TransportEvent};
