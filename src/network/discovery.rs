use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::{debug, info};

use crate::core::{Error, Result, MIN_PEER_PORT};
use crate::protocol::{Message, Outbound};
use super::registry::PeerRegistry;

/// Addresses under which this node receives datagrams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    /// Address the socket is bound to, with the actual port
    bound: SocketAddrV4,
    /// Local interface addresses, only consulted for a wildcard bind
    interfaces: Vec<Ipv4Addr>,
}

impl LocalEndpoint {
    pub fn new(bound: SocketAddrV4, interfaces: Vec<Ipv4Addr>) -> Self {
        LocalEndpoint { bound, interfaces }
    }

    /// Collects the endpoint for a socket bound to `bound`
    ///
    /// Interface addresses are only enumerated for the wildcard address.
    pub fn discover(bound: SocketAddrV4) -> Result<Self> {
        if !bound.ip().is_unspecified() {
            return Ok(Self::new(bound, Vec::new()));
        }

        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| Error::network(format!("Failed to list interfaces: {}", e)))?;

        let mut interfaces: Vec<Ipv4Addr> = addrs
            .filter_map(|ifaddr| {
                ifaddr
                    .address
                    .as_ref()
                    .and_then(|address| address.as_sockaddr_in())
                    .map(|sin| Ipv4Addr::from(sin.ip()))
            })
            .collect();
        interfaces.sort();
        interfaces.dedup();
        debug!(?interfaces, "collected local interface addresses");

        Ok(Self::new(bound, interfaces))
    }

    pub fn bound(&self) -> SocketAddrV4 {
        self.bound
    }

    /// Whether `addr` names this node
    pub fn is_self(&self, addr: &SocketAddrV4) -> bool {
        if addr.port() != self.bound.port() {
            return false;
        }

        if self.bound.ip().is_unspecified() {
            self.interfaces.contains(addr.ip())
        } else {
            addr.ip() == self.bound.ip()
        }
    }
}

/// Membership protocol: join through a bootstrap peer, then connect to the
/// peers it lists
#[derive(Debug)]
pub struct PeerDiscovery {
    endpoint: LocalEndpoint,
    bootstrap: Option<SocketAddrV4>,
    /// Peers sent CONNECT and not yet acknowledged
    pending: PeerRegistry,
    max_peers: usize,
}

impl PeerDiscovery {
    /// Creates a new peer discovery manager
    pub fn new(endpoint: LocalEndpoint, bootstrap: Option<SocketAddrV4>, max_peers: usize) -> Self {
        PeerDiscovery {
            endpoint,
            bootstrap,
            pending: PeerRegistry::new(),
            max_peers,
        }
    }

    pub fn endpoint(&self) -> &LocalEndpoint {
        &self.endpoint
    }

    pub fn bootstrap(&self) -> Option<SocketAddrV4> {
        self.bootstrap
    }

    pub fn pending(&self) -> &PeerRegistry {
        &self.pending
    }

    fn ensure_room(&self, registry: &PeerRegistry) -> Result<()> {
        if registry.len() >= self.max_peers {
            return Err(Error::peer(format!(
                "peer registry full ({} peers)",
                registry.len()
            )));
        }
        Ok(())
    }

    /// HELLO for the bootstrap peer, if one is configured
    pub fn join(&self) -> Option<Outbound> {
        self.bootstrap
            .map(|peer| Outbound::new(Message::Hello, peer))
    }

    /// Answers HELLO with our peer list, then registers the requester
    pub fn handle_hello(&self, registry: &mut PeerRegistry, sender: SocketAddrV4) -> Result<Outbound> {
        self.ensure_room(registry)?;

        let peers: Vec<SocketAddrV4> = registry
            .addrs()
            .filter(|addr| *addr != sender)
            .collect();
        registry.upsert(sender);
        info!(%sender, peers = registry.len(), "peer joined");

        Ok(Outbound::new(Message::HelloReply { peers }, sender))
    }

    /// Checks one listed peer of a HELLO_REPLY from `sender`
    fn check_listed(&self, listed: &SocketAddrV4, sender: SocketAddrV4) -> Result<()> {
        if listed.port() < MIN_PEER_PORT {
            return Err(Error::peer(format!("listed peer {} has invalid port", listed)));
        }
        if *listed == sender {
            return Err(Error::peer(format!("peer {} lists itself", sender)));
        }
        if self.endpoint.is_self(listed) {
            return Err(Error::peer(format!("listed peer {} is this node", listed)));
        }
        Ok(())
    }

    /// Forgets every peer waiting for ACK_CONNECT
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            info!(discarded = self.pending.len(), "pending connections discarded");
            self.pending.clear();
        }
    }

    /// Queues every listed peer for CONNECT and registers the bootstrap peer
    ///
    /// Any invalid entry discards the whole pending batch.
    pub fn handle_hello_reply(
        &mut self,
        registry: &mut PeerRegistry,
        sender: SocketAddrV4,
        peers: &[SocketAddrV4],
    ) -> Result<Vec<Outbound>> {
        if self.bootstrap != Some(sender) {
            return Err(Error::peer(format!("HELLO_REPLY from non-bootstrap peer {}", sender)));
        }
        self.ensure_room(registry)?;

        for listed in peers {
            if let Err(e) = self.check_listed(listed, sender) {
                self.discard_pending();
                return Err(e);
            }
            self.pending.upsert(*listed);
        }

        let outbound: Vec<Outbound> = self
            .pending
            .addrs()
            .map(|addr| Outbound::new(Message::Connect, addr))
            .collect();
        registry.upsert(sender);
        info!(bootstrap = %sender, listed = peers.len(), "joined network");

        Ok(outbound)
    }

    /// Registers a connecting peer and acknowledges it
    pub fn handle_connect(&self, registry: &mut PeerRegistry, sender: SocketAddrV4) -> Result<Outbound> {
        self.ensure_room(registry)?;
        registry.upsert(sender);
        info!(%sender, "peer connected");

        Ok(Outbound::new(Message::AckConnect, sender))
    }

    /// Moves an acknowledged peer from pending into the registry
    pub fn handle_ack_connect(&mut self, registry: &mut PeerRegistry, sender: SocketAddrV4) -> Result<()> {
        self.ensure_room(registry)?;
        if self.pending.remove_key(&sender).is_none() {
            return Err(Error::peer(format!("unsolicited ACK_CONNECT from {}", sender)));
        }
        registry.upsert(sender);
        info!(%sender, "connection acknowledged");

        Ok(())
    }
}
