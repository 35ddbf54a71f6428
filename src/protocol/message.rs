use std::fmt;
use std::net::SocketAddrV4;

use crate::core::SyncLevel;

/// Wire type byte of every protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    HelloReply = 2,
    Connect = 3,
    AckConnect = 4,
    SyncStart = 11,
    DelayRequest = 12,
    DelayResponse = 13,
    Leader = 21,
    GetTime = 31,
    Time = 32,
}

/// Length constraint of a message on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// The datagram must be exactly this long
    Exact(usize),
    /// The datagram must be at least this long
    AtLeast(usize),
}

impl FrameLen {
    /// Whether a datagram of `len` bytes satisfies the constraint
    pub fn admits(&self, len: usize) -> bool {
        match *self {
            FrameLen::Exact(n) => len == n,
            FrameLen::AtLeast(n) => len >= n,
        }
    }
}

impl MessageType {
    /// Returns the wire code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Looks up a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            1 => MessageType::Hello,
            2 => MessageType::HelloReply,
            3 => MessageType::Connect,
            4 => MessageType::AckConnect,
            11 => MessageType::SyncStart,
            12 => MessageType::DelayRequest,
            13 => MessageType::DelayResponse,
            21 => MessageType::Leader,
            31 => MessageType::GetTime,
            32 => MessageType::Time,
            _ => return None,
        };
        Some(ty)
    }

    /// Length constraint for this type
    pub fn frame_len(self) -> FrameLen {
        use super::codec::{
            EMPTY_SIZE, LEADER_SIZE, MIN_HELLO_REPLY_SIZE, TIMESTAMPED_SIZE,
        };

        match self {
            MessageType::HelloReply => FrameLen::AtLeast(MIN_HELLO_REPLY_SIZE),
            MessageType::SyncStart | MessageType::DelayResponse | MessageType::Time => {
                FrameLen::Exact(TIMESTAMPED_SIZE)
            }
            MessageType::Leader => FrameLen::Exact(LEADER_SIZE),
            MessageType::Hello
            | MessageType::Connect
            | MessageType::AckConnect
            | MessageType::DelayRequest
            | MessageType::GetTime => FrameLen::Exact(EMPTY_SIZE),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Hello => "HELLO",
            MessageType::HelloReply => "HELLO_REPLY",
            MessageType::Connect => "CONNECT",
            MessageType::AckConnect => "ACK_CONNECT",
            MessageType::SyncStart => "SYNC_START",
            MessageType::DelayRequest => "DELAY_REQUEST",
            MessageType::DelayResponse => "DELAY_RESPONSE",
            MessageType::Leader => "LEADER",
            MessageType::GetTime => "GET_TIME",
            MessageType::Time => "TIME",
        };
        f.write_str(name)
    }
}

/// Protocol messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Join request sent to the bootstrap peer
    Hello,

    /// Answer to Hello listing the responder's peers
    HelloReply {
        /// Known peers of the responder
        peers: Vec<SocketAddrV4>,
    },

    /// Membership request to a peer learned from HelloReply
    Connect,

    /// Acknowledgment of Connect
    AckConnect,

    /// Synchronization offer
    SyncStart {
        /// Sender's level
        level: SyncLevel,
        /// Sender's adjusted time at send (T1)
        timestamp: i64,
    },

    /// Delay probe sent after accepting an offer
    DelayRequest,

    /// Answer to DelayRequest
    DelayResponse {
        /// Responder's level
        level: SyncLevel,
        /// Responder's adjusted time at send (T4)
        timestamp: i64,
    },

    /// Root assignment (level 0) or revocation (level 255)
    Leader {
        /// Requested level
        level: SyncLevel,
    },

    /// Time query
    GetTime,

    /// Answer to GetTime
    Time {
        /// Responder's level
        level: SyncLevel,
        /// Responder's adjusted time, raw elapsed time when unsynchronized
        timestamp: i64,
    },
}

impl Message {
    /// Returns the wire type of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello => MessageType::Hello,
            Message::HelloReply { .. } => MessageType::HelloReply,
            Message::Connect => MessageType::Connect,
            Message::AckConnect => MessageType::AckConnect,
            Message::SyncStart { .. } => MessageType::SyncStart,
            Message::DelayRequest => MessageType::DelayRequest,
            Message::DelayResponse { .. } => MessageType::DelayResponse,
            Message::Leader { .. } => MessageType::Leader,
            Message::GetTime => MessageType::GetTime,
            Message::Time { .. } => MessageType::Time,
        }
    }
}

/// A message addressed to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message: Message,
    pub destination: SocketAddrV4,
}

impl Outbound {
    pub fn new(message: Message, destination: SocketAddrV4) -> Self {
        Outbound {
            message,
            destination,
        }
    }
}
