//! Packet routing.
//!
//! [`Router`] is the heart of the overlay: it decides, for every packet seen,
//! whether to drop, deliver locally or forward it. The supporting pieces are
//! the [`RoutingTable`] mapping addresses to connection handles, the
//! [`EchoCache`] suppressing loops and duplicates, and the [`Blacklist`].

pub mod blacklist;
pub mod echo;
pub mod router;
pub mod table;

pub use blacklist::Blacklist;
pub use echo::EchoCache;
pub use router::{DirectHandler, Router, RouterCounterSnapshot, RouterCounters};
pub use table::{RoutingTable, UpdateStatus};
