//! Leaf tree management.
//!
//! Leaves are off-chain UTXO-like units whose spending key is the sum of the
//! owner's signing key and the operators' threshold key. The store tracks
//! which leaves the wallet owns and which are locked by an in-flight
//! operation.

mod memory;
mod selection;
mod store;

pub use memory::InMemoryTreeStore;
pub use selection::{CoverSelector, ExactSelector, LeafSelector};
pub use store::{Leaf, LeafReservation, ReservationId, TreeStore};
