use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::core::{Error, Result, SyncLevel, MAX_DATAGRAM_SIZE};
use super::message::{Message, MessageType};

/// Size of the type byte
pub const TYPE_SIZE: usize = 1;
/// Size of the HELLO_REPLY peer count
pub const COUNT_SIZE: usize = 2;
/// Size of a synchronization level
pub const LEVEL_SIZE: usize = 1;
/// Size of a timestamp
pub const TIMESTAMP_SIZE: usize = 8;
/// Size of a port
pub const PORT_SIZE: usize = 2;
/// Size of an IPv4 address
pub const IPV4_SIZE: usize = 4;

/// Messages made of the type byte only
pub const EMPTY_SIZE: usize = TYPE_SIZE;
/// LEADER
pub const LEADER_SIZE: usize = TYPE_SIZE + LEVEL_SIZE;
/// SYNC_START, DELAY_RESPONSE and TIME
pub const TIMESTAMPED_SIZE: usize = TYPE_SIZE + LEVEL_SIZE + TIMESTAMP_SIZE;
/// HELLO_REPLY without records
pub const MIN_HELLO_REPLY_SIZE: usize = TYPE_SIZE + COUNT_SIZE;
/// One HELLO_REPLY record: address length, address, port
pub const PEER_RECORD_SIZE: usize = 1 + IPV4_SIZE + PORT_SIZE;
/// Number of records that fit in a single datagram
pub const MAX_HELLO_REPLY_PEERS: usize = (MAX_DATAGRAM_SIZE - MIN_HELLO_REPLY_SIZE) / PEER_RECORD_SIZE;

/// Bounds-checked big-endian reader over a received datagram
///
/// Every read checks the remaining length first and fails without consuming
/// anything when the buffer is too short.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf }
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, needed: usize, field: &str) -> Result<()> {
        if self.buf.len() < needed {
            return Err(Error::protocol(format!(
                "truncated {}: need {} bytes, {} left",
                field,
                needed,
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(TIMESTAMP_SIZE, "timestamp")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_ipv4(&mut self) -> Result<Ipv4Addr> {
        self.ensure(IPV4_SIZE, "IPv4 address")?;
        let mut octets = [0u8; IPV4_SIZE];
        self.buf.copy_to_slice(&mut octets);
        Ok(Ipv4Addr::from(octets))
    }

    pub fn read_level(&mut self) -> Result<SyncLevel> {
        self.read_u8().map(SyncLevel::new)
    }

    /// Reads one HELLO_REPLY record
    pub fn read_peer_record(&mut self) -> Result<SocketAddrV4> {
        let addr_len = self.read_u8()?;
        if usize::from(addr_len) != IPV4_SIZE {
            return Err(Error::protocol(format!(
                "peer record declares address length {}",
                addr_len
            )));
        }
        let ip = self.read_ipv4()?;
        let port = self.read_u16()?;
        Ok(SocketAddrV4::new(ip, port))
    }
}

pub fn write_level<B: BufMut>(dst: &mut B, level: SyncLevel) {
    dst.put_u8(level.level());
}

pub fn write_timestamp<B: BufMut>(dst: &mut B, timestamp: i64) {
    dst.put_i64(timestamp);
}

pub fn write_ipv4<B: BufMut>(dst: &mut B, ip: Ipv4Addr) {
    dst.put_slice(&ip.octets());
}

pub fn write_peer_record<B: BufMut>(dst: &mut B, peer: SocketAddrV4) {
    dst.put_u8(IPV4_SIZE as u8);
    write_ipv4(dst, *peer.ip());
    dst.put_u16(peer.port());
}

impl Message {
    /// Decodes a single datagram
    ///
    /// The length is validated against the declared type before any field
    /// is read.
    pub fn decode(datagram: &[u8]) -> Result<Message> {
        let mut reader = WireReader::new(datagram);
        let code = reader.read_u8()?;
        let ty = MessageType::from_code(code)
            .ok_or_else(|| Error::protocol(format!("unknown message type {}", code)))?;

        if !ty.frame_len().admits(datagram.len()) {
            return Err(Error::protocol(format!(
                "invalid length {} for {}",
                datagram.len(),
                ty
            )));
        }

        let message = match ty {
            MessageType::Hello => Message::Hello,
            MessageType::HelloReply => {
                let count = usize::from(reader.read_u16()?);
                let mut peers = Vec::with_capacity(count.min(reader.remaining() / PEER_RECORD_SIZE));
                for _ in 0..count {
                    peers.push(reader.read_peer_record()?);
                }
                Message::HelloReply { peers }
            }
            MessageType::Connect => Message::Connect,
            MessageType::AckConnect => Message::AckConnect,
            MessageType::SyncStart => Message::SyncStart {
                level: reader.read_level()?,
                timestamp: reader.read_i64()?,
            },
            MessageType::DelayRequest => Message::DelayRequest,
            MessageType::DelayResponse => Message::DelayResponse {
                level: reader.read_level()?,
                timestamp: reader.read_i64()?,
            },
            MessageType::Leader => Message::Leader {
                level: reader.read_level()?,
            },
            MessageType::GetTime => Message::GetTime,
            MessageType::Time => Message::Time {
                level: reader.read_level()?,
                timestamp: reader.read_i64()?,
            },
        };

        Ok(message)
    }

    /// Appends the wire form of this message to `dst`
    ///
    /// HELLO_REPLY lists at most `MAX_HELLO_REPLY_PEERS` records so the
    /// datagram stays within the UDP payload limit.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.message_type().code());

        match self {
            Message::HelloReply { peers } => {
                let listed = &peers[..peers.len().min(MAX_HELLO_REPLY_PEERS)];
                dst.reserve(COUNT_SIZE + listed.len() * PEER_RECORD_SIZE);
                dst.put_u16(listed.len() as u16);
                for peer in listed {
                    write_peer_record(dst, *peer);
                }
            }
            Message::SyncStart { level, timestamp }
            | Message::DelayResponse { level, timestamp }
            | Message::Time { level, timestamp } => {
                write_level(dst, *level);
                write_timestamp(dst, *timestamp);
            }
            Message::Leader { level } => write_level(dst, *level),
            Message::Hello
            | Message::Connect
            | Message::AckConnect
            | Message::DelayRequest
            | Message::GetTime => {}
        }
    }

    /// Returns the wire form of this message
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TIMESTAMPED_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Datagram codec: one message per frame
#[derive(Clone, Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        // The whole datagram is consumed even when it fails to decode
        let frame = src.split_to(src.len());
        Message::decode(&frame).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}
