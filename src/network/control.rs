//! Client side of the GET_TIME and LEADER control messages

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::udp::UdpFramed;
use tracing::debug;

use crate::core::{Error, Result, SyncLevel};
use crate::protocol::{Message, MessageCodec};

/// A node's answer to GET_TIME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReading {
    pub level: SyncLevel,
    /// Adjusted time in milliseconds, raw elapsed time when unsynchronized
    pub timestamp: i64,
}

async fn client() -> Result<UdpFramed<MessageCodec>> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| Error::network(format!("Failed to bind control socket: {}", e)))?;
    Ok(UdpFramed::new(socket, MessageCodec::new()))
}

/// Asks `node` for its time, waiting at most `wait` for the answer
///
/// Datagrams from other senders and replies other than TIME are skipped.
pub async fn query_time(node: SocketAddrV4, wait: Duration) -> Result<TimeReading> {
    let mut framed = client().await?;
    let node_addr = SocketAddr::V4(node);
    framed.send((Message::GetTime, node_addr)).await?;

    let reply = async {
        while let Some(item) = framed.next().await {
            match item {
                Ok((Message::Time { level, timestamp }, from)) if from == node_addr => {
                    return Ok(TimeReading { level, timestamp });
                }
                Ok((message, from)) => {
                    debug!(%from, kind = %message.message_type(), "ignoring unexpected reply")
                }
                Err(e) => debug!(error = %e, "ignoring malformed reply"),
            }
        }
        Err(Error::network("control socket closed"))
    };

    timeout(wait, reply)
        .await
        .map_err(|_| Error::network(format!("No TIME reply from {} within {:?}", node, wait)))?
}

/// Makes `node` the root (`SyncLevel::LEADER`) or revokes it (`SyncLevel::UNSYNCED`)
pub async fn send_leader(node: SocketAddrV4, level: SyncLevel) -> Result<()> {
    if !level.is_leader() && !level.is_unsynced() {
        return Err(Error::protocol(format!("invalid leader level {}", level)));
    }

    let mut framed = client().await?;
    framed.send((Message::Leader { level }, SocketAddr::V4(node))).await
}
