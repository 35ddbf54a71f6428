use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::core::{BootstrapPeer, Config, Error, Result, MAX_DATAGRAM_SIZE};
use crate::protocol::{MessageCodec, Outbound};
use crate::sync::SyncManager;
use crate::time::{Clock, MonotonicClock};
use super::discovery::LocalEndpoint;

/// Creates the node's UDP socket
fn bind_socket(addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket
        .bind(&SocketAddr::V4(addr).into())
        .map_err(|e| Error::network(format!("Failed to bind socket to {}: {}", addr, e)))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Resolves the bootstrap peer to its first IPv4 address
async fn resolve_bootstrap(peer: &BootstrapPeer) -> Result<SocketAddrV4> {
    if let Ok(ip) = peer.host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, peer.port));
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| Error::network(format!("Failed to create resolver: {}", e)))?;
    let lookup = resolver
        .lookup_ip(peer.host.as_str())
        .await
        .map_err(|e| Error::network(format!("Failed to resolve {}: {}", peer.host, e)))?;

    let ip = lookup
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::network(format!("No IPv4 address for {}", peer.host)))?;

    Ok(SocketAddrV4::new(ip, peer.port))
}

/// Owns the socket and drives a [`SyncManager`] from it
pub struct ConnectionManager<C: Clock = MonotonicClock> {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
    manager: SyncManager<C>,
    codec: MessageCodec,
}

impl ConnectionManager {
    /// Binds the node socket and prepares the protocol core
    pub async fn bind(config: &Config) -> Result<Self> {
        Self::bind_with_clock(config, MonotonicClock::new()).await
    }
}

impl<C: Clock> ConnectionManager<C> {
    /// Binds the node socket, reading time from `clock`
    pub async fn bind_with_clock(config: &Config, clock: C) -> Result<Self> {
        config.validate()?;

        let socket = bind_socket(config.bind_socket_addr())?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => return Err(Error::network(format!("Unexpected local address {}", other))),
        };

        let bootstrap = match &config.bootstrap {
            Some(peer) => Some(resolve_bootstrap(peer).await?),
            None => None,
        };
        let endpoint = LocalEndpoint::discover(local_addr)?;
        info!(%local_addr, ?bootstrap, "node bound");

        let manager = SyncManager::new(config.protocol.clone(), endpoint, bootstrap, clock);

        Ok(ConnectionManager {
            socket,
            local_addr,
            manager,
            codec: MessageCodec::new(),
        })
    }

    /// Returns the local socket address
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn manager(&self) -> &SyncManager<C> {
        &self.manager
    }

    /// Runs the event loop until `shutdown` is cancelled
    ///
    /// Each iteration waits at most one poll interval for a datagram, runs
    /// the periodic tick, handles the datagram, then flushes replies.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let poll_interval: Duration = self.manager.config().poll_interval;
        let mut recv_buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut send_buffer = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);

        let start = self.manager.start();
        self.send_all(start, &mut send_buffer).await;

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = timeout(poll_interval, self.socket.recv_from(&mut recv_buffer)) => result,
            };
            let received_at = self.manager.clock().now_ms();

            let mut outbound = self.manager.handle_tick();
            match received {
                Ok(Ok((len, SocketAddr::V4(sender)))) => {
                    outbound.extend(self.manager.handle_datagram_received_at(
                        &recv_buffer[..len],
                        sender,
                        received_at,
                    ));
                }
                Ok(Ok((_, sender))) => debug!(%sender, "dropped datagram from non-IPv4 sender"),
                Ok(Err(e)) => warn!(error = %e, "receive failed"),
                Err(_) => {}
            }

            self.send_all(outbound, &mut send_buffer).await;
        }

        info!(local_addr = %self.local_addr, "node stopped");
        Ok(())
    }

    async fn send_all(&mut self, outbound: Vec<Outbound>, buffer: &mut BytesMut) {
        for Outbound { message, destination } in outbound {
            let kind = message.message_type();
            buffer.clear();
            if let Err(e) = self.codec.encode(message, buffer) {
                warn!(%destination, %kind, error = %e, "failed to encode message");
                continue;
            }

            if let Err(e) = self.socket.send_to(&buffer[..], SocketAddr::V4(destination)).await {
                warn!(%destination, %kind, error = %e, "send failed");
            }
        }
    }
}
