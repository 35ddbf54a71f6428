//! Protocol implementation module
//!
//! This module defines the wire messages, their datagram encoding, and the
//! synchronization state machine driven by them.

pub mod codec;
pub mod message;
pub mod state;

pub use self::codec::MessageCodec;
pub use self::message::{Message, MessageType, Outbound};
pub use self::state::{ProtocolState, ProtocolConfig, Session};
