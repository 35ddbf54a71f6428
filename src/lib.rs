//! Peer-to-peer logical clock synchronization over UDP
//!
//! Nodes join an overlay through a bootstrap peer, accept a root assignment
//! from an external LEADER command, and estimate their millisecond offset
//! from a better synchronized neighbour with a three-message exchange.
//! The level of a node is its hop distance from the root.

pub mod core;
pub mod network;
pub mod protocol;
pub mod sync;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Config, Error, Result, SyncLevel};
pub use crate::network::ConnectionManager;
pub use crate::sync::SyncManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
