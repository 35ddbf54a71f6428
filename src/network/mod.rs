//! Network management and peer communication module
//!
//! This module holds the peer registry, the membership protocol, the UDP
//! runtime driving a node, and the control client.

pub mod control;
mod connection;
mod discovery;
mod registry;

pub use self::connection::ConnectionManager;
pub use self::control::TimeReading;
pub use self::discovery::{LocalEndpoint, PeerDiscovery};
pub use self::registry::PeerRegistry;
