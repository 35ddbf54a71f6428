//! Core types and traits for the clock synchronization protocol
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;
pub mod serde;

pub use self::error::{Error, Result};
pub use self::types::{
    BootstrapPeer,
    Config,
    Peer,
    PeerId,
    SyncLevel,
};

/// Default port for the node (0 lets the OS pick one)
pub const DEFAULT_PORT: u16 = 0;

/// Lowest port a remote peer may use
pub const MIN_PEER_PORT: u16 = 1;

/// Maximum UDP payload size in bytes
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Maximum number of peers; the HELLO_REPLY peer count is a 16-bit field
pub const MAX_PEERS: usize = u16::MAX as usize;
