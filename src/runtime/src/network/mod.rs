//! Network management for container-to-container communication.
//!
//! Provides `NetworkManager`, which assigns subnets and addresses and
//! answers name lookups among the members of each network.

mod store;

pub use store::NetworkManager;
