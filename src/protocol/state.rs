use std::net::SocketAddrV4;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::{Error, Result, PeerId, SyncLevel, MAX_PEERS};
use crate::network::PeerRegistry;
use crate::time::util::{adjusted, elapsed, exceeded};
use super::message::{Message, Outbound};

/// Protocol configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Lifetime of a negotiation and of a SYNC_START for DELAY_REQUEST purposes
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub sync_interval: Duration,
    /// Time between SYNC_START broadcasts
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub sync_start_interval: Duration,
    /// Time without a successful sync after which a node is unsynchronized
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub waiting_interval: Duration,
    /// Upper bound on a single wait for traffic
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub poll_interval: Duration,
    /// How far a new root backdates its last broadcast
    #[serde(serialize_with = "crate::core::serde::serialize_millis")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_millis")]
    pub leader_head_start: Duration,
    /// Maximum number of peers kept in the registry
    pub max_peers: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            sync_interval: Duration::from_millis(5000),
            sync_start_interval: Duration::from_millis(5000),
            waiting_interval: Duration::from_millis(20000),
            poll_interval: Duration::from_millis(2000),
            leader_head_start: Duration::from_millis(3000),
            max_peers: MAX_PEERS,
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl ProtocolConfig {
    /// Checks for settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be positive"));
        }
        if self.sync_start_interval.is_zero() {
            return Err(Error::config("SYNC_START interval must be positive"));
        }
        if self.max_peers == 0 || self.max_peers > MAX_PEERS {
            return Err(Error::config(format!(
                "max peers must be between 1 and {}",
                MAX_PEERS
            )));
        }
        Ok(())
    }
}

/// One in-flight offset negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Peer that offered synchronization
    pub peer: PeerId,
    /// Level the peer claimed in its SYNC_START
    pub peer_level: SyncLevel,
    /// (T2 - T1) + T3, completed with T4 on DELAY_RESPONSE
    pub provisional_offset: i64,
    /// Local monotonic time the DELAY_REQUEST was issued
    pub request_time: i64,
}

/// Synchronization state machine of the local node
///
/// Every method takes the current monotonic time explicitly, so the
/// machine itself never reads a clock.
#[derive(Debug)]
pub struct ProtocolState {
    config: ProtocolConfig,
    /// Monotonic time the node started
    start: i64,
    level: SyncLevel,
    /// Subtracted from elapsed time to approximate root time
    offset: i64,
    session: Option<Session>,
    last_broadcast: Option<i64>,
    last_sync: Option<i64>,
}

impl ProtocolState {
    /// Creates an unsynchronized node that started at `start`
    pub fn new(config: ProtocolConfig, start: i64) -> Self {
        ProtocolState {
            config,
            start,
            level: SyncLevel::UNSYNCED,
            offset: 0,
            session: None,
            last_broadcast: None,
            last_sync: None,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn level(&self) -> SyncLevel {
        self.level
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Milliseconds since the node started
    pub fn elapsed_time(&self, now: i64) -> i64 {
        elapsed(now, self.start)
    }

    /// Elapsed time corrected by the current offset
    pub fn adjusted_time(&self, now: i64) -> i64 {
        adjusted(now, self.start, self.offset)
    }

    fn set_level(&mut self, level: SyncLevel) {
        if level != self.level {
            info!(from = %self.level, to = %level, "synchronization level changed");
            self.level = level;
        }
    }

    /// Drops to unsynchronized when no sync succeeded for too long
    ///
    /// Returns whether the level changed.
    pub fn check_staleness(&mut self, now: i64) -> bool {
        if !self.level.is_synced() {
            return false;
        }

        let stale = match self.last_sync {
            Some(last) => exceeded(now, last, millis(self.config.waiting_interval)),
            None => true,
        };
        if stale {
            info!(level = %self.level, "no successful synchronization within waiting interval");
            self.set_level(SyncLevel::UNSYNCED);
        }
        stale
    }

    /// Whether a SYNC_START broadcast is due at `now`
    pub fn broadcast_due(&self, now: i64) -> bool {
        if !self.level.can_offer() {
            return false;
        }
        match self.last_broadcast {
            Some(last) => now.wrapping_sub(last) >= millis(self.config.sync_start_interval),
            None => true,
        }
    }

    /// Offers synchronization to every known peer when a broadcast is due
    pub fn poll_broadcast(&mut self, registry: &mut PeerRegistry, now: i64) -> Vec<Outbound> {
        if !self.broadcast_due(now) {
            return Vec::new();
        }

        let message = Message::SyncStart {
            level: self.level,
            timestamp: self.adjusted_time(now),
        };
        let outbound: Vec<Outbound> = registry
            .addrs()
            .map(|addr| Outbound::new(message.clone(), addr))
            .collect();

        registry.mark_sync_start_all(now);
        self.last_broadcast = Some(now);
        debug!(level = %self.level, peers = outbound.len(), "broadcasting SYNC_START");

        outbound
    }

    /// Applies an external root assignment or revocation
    pub fn handle_leader(&mut self, level: SyncLevel, now: i64) -> Result<()> {
        match level {
            SyncLevel::LEADER => {
                self.set_level(SyncLevel::LEADER);
                self.offset = 0;
                self.last_broadcast = Some(now.wrapping_sub(millis(self.config.leader_head_start)));
                Ok(())
            }
            SyncLevel::UNSYNCED if self.level.is_leader() => {
                self.set_level(SyncLevel::UNSYNCED);
                Ok(())
            }
            SyncLevel::UNSYNCED => Err(Error::invalid_state(format!(
                "step down requested at level {}",
                self.level
            ))),
            other => Err(Error::protocol(format!("invalid leader level {}", other))),
        }
    }

    /// Checks that `offered` is strictly better than what we have
    ///
    /// Our own informant must simply stay ahead of us; anyone else must be
    /// at least two levels ahead. An informant that fell behind leaves us
    /// unsynchronized.
    fn check_offer_level(&mut self, registry: &PeerRegistry, peer: PeerId, offered: SyncLevel) -> Result<()> {
        if self.level.is_synced() && registry.synchronized() == Some(peer) {
            if offered >= self.level {
                info!(offered = %offered, "synchronized peer is no longer ahead of us");
                self.set_level(SyncLevel::UNSYNCED);
                return Err(Error::sync(format!(
                    "synchronized peer offers level {} at own level {}",
                    offered, self.level
                )));
            }
        } else if u16::from(offered.level()) + 1 >= u16::from(self.level.level()) {
            return Err(Error::sync(format!(
                "offer at level {} does not improve own level {}",
                offered, self.level
            )));
        }
        Ok(())
    }

    /// Handles SYNC_START (T1 = `timestamp`) received at `received_at` (T2)
    ///
    /// On acceptance a session is opened and the DELAY_REQUEST to send is
    /// returned; `now` is its send time (T3).
    pub fn handle_sync_start(
        &mut self,
        registry: &mut PeerRegistry,
        sender: SocketAddrV4,
        level: SyncLevel,
        timestamp: i64,
        received_at: i64,
        now: i64,
    ) -> Result<Outbound> {
        if let Some(session) = &self.session {
            if !exceeded(now, session.request_time, millis(self.config.sync_interval) - 1) {
                return Err(Error::invalid_state("synchronization already in progress"));
            }
        }

        if !level.can_offer() {
            return Err(Error::sync(format!("offered level {} too high", level)));
        }

        let peer = registry
            .id_of(&sender)
            .ok_or_else(|| Error::peer(format!("SYNC_START from unknown peer {}", sender)))?;

        self.check_offer_level(registry, peer, level)?;

        let t2 = self.elapsed_time(received_at);
        let t3 = self.elapsed_time(now);
        self.session = Some(Session {
            peer,
            peer_level: level,
            provisional_offset: t2.wrapping_sub(timestamp).wrapping_add(t3),
            request_time: now,
        });
        registry.set_syncing(peer);
        debug!(%sender, level = %level, "accepted synchronization offer");

        Ok(Outbound::new(Message::DelayRequest, sender))
    }

    /// Answers a delay probe from a peer we recently offered synchronization to
    pub fn handle_delay_request(
        &self,
        registry: &PeerRegistry,
        sender: SocketAddrV4,
        now: i64,
    ) -> Result<Outbound> {
        let peer = registry
            .get(&sender)
            .ok_or_else(|| Error::peer(format!("DELAY_REQUEST from unknown peer {}", sender)))?;

        match peer.last_sync_start {
            Some(sent) if !exceeded(now, sent, millis(self.config.sync_interval)) => {}
            _ => {
                return Err(Error::sync(format!(
                    "no recent SYNC_START sent to {}",
                    sender
                )))
            }
        }

        let response = Message::DelayResponse {
            level: self.level,
            timestamp: self.adjusted_time(now),
        };
        Ok(Outbound::new(response, sender))
    }

    /// Completes the negotiation with DELAY_RESPONSE (T4 = `timestamp`)
    ///
    /// A late response or one whose level changed aborts the session
    /// without touching level or offset.
    pub fn handle_delay_response(
        &mut self,
        registry: &mut PeerRegistry,
        sender: SocketAddrV4,
        level: SyncLevel,
        timestamp: i64,
        now: i64,
    ) -> Result<()> {
        let peer = registry.id_of(&sender);
        if peer.is_none() || peer != registry.syncing() {
            return Err(Error::peer(format!("not synchronizing with {}", sender)));
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no synchronization in progress"))?;

        if exceeded(now, session.request_time, millis(self.config.sync_interval)) {
            self.session = None;
            return Err(Error::sync("DELAY_RESPONSE arrived after the sync interval"));
        }

        if session.peer_level != level {
            let recorded = session.peer_level;
            self.session = None;
            return Err(Error::sync(format!(
                "peer level changed from {} to {} during synchronization",
                recorded, level
            )));
        }

        self.offset = session.provisional_offset.wrapping_sub(timestamp) / 2;
        self.set_level(level.child());
        registry.promote_syncing();
        self.session = None;
        self.last_sync = Some(now);
        info!(%sender, offset = self.offset, level = %self.level, "synchronized");

        Ok(())
    }

    /// TIME answer for a GET_TIME query
    ///
    /// An unsynchronized node reports its raw elapsed time.
    pub fn time_reply(&self, now: i64) -> Message {
        let timestamp = if self.level.is_unsynced() {
            self.elapsed_time(now)
        } else {
            self.adjusted_time(now)
        };

        Message::Time {
            level: self.level,
            timestamp,
        }
    }
}
