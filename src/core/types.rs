use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Serialize, Deserialize};

use super::{Error, Result};
use crate::protocol::ProtocolConfig;

/// Distance from the synchronization root
///
/// `0` is the root itself, `1..=254` are synchronized nodes and `255`
/// marks a node that is not synchronized at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncLevel(pub u8);

impl SyncLevel {
    /// The synchronization root
    pub const LEADER: SyncLevel = SyncLevel(0);
    /// Highest level a synchronized node can hold
    pub const MAX_SYNCED: SyncLevel = SyncLevel(254);
    /// Not synchronized
    pub const UNSYNCED: SyncLevel = SyncLevel(255);

    /// Creates a new level
    pub fn new(level: u8) -> Self {
        SyncLevel(level)
    }

    /// Returns the raw level
    pub fn level(&self) -> u8 {
        self.0
    }

    pub fn is_leader(&self) -> bool {
        *self == Self::LEADER
    }

    pub fn is_unsynced(&self) -> bool {
        *self == Self::UNSYNCED
    }

    /// Synchronized through a peer, i.e. neither root nor unsynchronized
    pub fn is_synced(&self) -> bool {
        !self.is_leader() && !self.is_unsynced()
    }

    /// Whether a node at this level may offer synchronization to others
    pub fn can_offer(&self) -> bool {
        *self < Self::MAX_SYNCED
    }

    /// Level of a node synchronized with a peer at this level
    pub fn child(&self) -> Self {
        SyncLevel(self.0.saturating_add(1))
    }
}

impl fmt::Display for SyncLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable handle for a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// Represents a peer in the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Stable handle, assigned on first contact
    pub id: PeerId,
    /// The peer's network address, also its identity key
    pub addr: SocketAddrV4,
    /// Local monotonic time (ms) of the last SYNC_START sent to this peer
    pub last_sync_start: Option<i64>,
}

impl Peer {
    /// Creates a peer that has never been sent a SYNC_START
    pub fn new(id: PeerId, addr: SocketAddrV4) -> Self {
        Peer {
            id,
            addr,
            last_sync_start: None,
        }
    }
}

/// Peer contacted with HELLO on startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    /// Host name or dotted IPv4 address
    pub host: String,
    /// UDP port
    pub port: u16,
}

/// Configuration for a synchronization node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local address to bind to
    pub bind_addr: Ipv4Addr,
    /// Local port to bind to
    pub port: u16,
    /// Optional peer to join through
    pub bootstrap: Option<BootstrapPeer>,
    /// Protocol timing
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: super::DEFAULT_PORT,
            bootstrap: None,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from loose command line values
    ///
    /// The bootstrap host and port must be given together or not at all.
    pub fn from_cli_parts(
        bind_addr: Option<&str>,
        port: Option<u16>,
        peer_host: Option<String>,
        peer_port: Option<u16>,
    ) -> Result<Self> {
        let bind_addr = match bind_addr {
            Some(addr) => addr
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::config(format!("invalid bind address {}: {}", addr, e)))?,
            None => Ipv4Addr::UNSPECIFIED,
        };

        let bootstrap = match (peer_host, peer_port) {
            (Some(host), Some(port)) => Some(BootstrapPeer { host, port }),
            (None, None) => None,
            _ => {
                return Err(Error::config(
                    "peer address and peer port must be specified together",
                ))
            }
        };

        let config = Config {
            bind_addr,
            port: port.unwrap_or(super::DEFAULT_PORT),
            bootstrap,
            protocol: ProtocolConfig::default(),
        };
        config.validate()?;

        Ok(config)
    }

    /// Checks the configuration for values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if let Some(peer) = &self.bootstrap {
            if peer.host.is_empty() {
                return Err(Error::config("empty peer address"));
            }
            if peer.port < super::MIN_PEER_PORT {
                return Err(Error::config(format!("invalid peer port: {}", peer.port)));
            }
        }

        self.protocol.validate()
    }

    /// Address the node socket binds to
    pub fn bind_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_classification() {
        assert!(SyncLevel::LEADER.is_leader());
        assert!(SyncLevel::LEADER.can_offer());
        assert!(SyncLevel::UNSYNCED.is_unsynced());
        assert!(!SyncLevel::UNSYNCED.can_offer());
        assert!(!SyncLevel::MAX_SYNCED.can_offer());
        assert!(SyncLevel::MAX_SYNCED.is_synced());
        assert!(SyncLevel::new(253).can_offer());
        assert!(!SyncLevel::LEADER.is_synced());
    }

    #[test]
    fn test_level_child() {
        assert_eq!(SyncLevel::LEADER.child(), SyncLevel::new(1));
        assert_eq!(SyncLevel::new(253).child(), SyncLevel::MAX_SYNCED);
        assert_eq!(SyncLevel::UNSYNCED.child(), SyncLevel::UNSYNCED);
    }

    #[test]
    fn test_config_from_cli_parts() {
        let config = Config::from_cli_parts(
            Some("127.0.0.1"),
            Some(4000),
            Some("10.0.0.2".to_string()),
            Some(4001),
        )
        .unwrap();

        assert_eq!(config.bind_socket_addr(), "127.0.0.1:4000".parse().unwrap());
        assert_eq!(
            config.bootstrap,
            Some(BootstrapPeer { host: "10.0.0.2".to_string(), port: 4001 })
        );
    }

    #[test]
    fn test_config_defaults_bind_any() {
        let config = Config::from_cli_parts(None, None, None, None).unwrap();
        assert_eq!(config.bind_addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.port, 0);
        assert!(config.bootstrap.is_none());
    }

    #[test]
    fn test_config_requires_peer_pair() {
        let err = Config::from_cli_parts(None, None, Some("10.0.0.2".to_string()), None)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_cli_parts(None, None, None, Some(4001)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(Config::from_cli_parts(Some("not-an-ip"), None, None, None).is_err());
        assert!(Config::from_cli_parts(None, None, Some("h".to_string()), Some(0)).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::from_cli_parts(
            None,
            Some(5555),
            Some("seed.local".to_string()),
            Some(4444),
        )
        .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.port, 5555);
        assert_eq!(decoded.bootstrap, config.bootstrap);
        assert_eq!(decoded.protocol.sync_interval, config.protocol.sync_interval);
    }
}
