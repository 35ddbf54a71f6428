//! Synchronization module
//!
//! Ties the protocol state machine and the membership protocol together
//! behind a single socket-free event interface.

pub mod manager;

pub use self::manager::SyncManager;
