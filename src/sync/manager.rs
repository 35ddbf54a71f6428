use std::net::SocketAddrV4;

use tracing::warn;

use crate::core::{Error, Result, SyncLevel};
use crate::network::{LocalEndpoint, PeerDiscovery, PeerRegistry};
use crate::protocol::{Message, MessageType, Outbound, ProtocolConfig, ProtocolState};
use crate::time::{Clock, MonotonicClock};
use crate::util::hex_prefix;

/// Routes inbound datagrams and periodic ticks to the protocol handlers
///
/// The manager never touches a socket. Every entry point returns the
/// messages to send, which keeps the whole node deterministic under a
/// [`ManualClock`](crate::time::ManualClock).
pub struct SyncManager<C: Clock = MonotonicClock> {
    clock: C,
    state: ProtocolState,
    registry: PeerRegistry,
    discovery: PeerDiscovery,
}

impl<C: Clock> SyncManager<C> {
    /// Creates an unsynchronized node starting at the clock's current reading
    pub fn new(
        config: ProtocolConfig,
        endpoint: LocalEndpoint,
        bootstrap: Option<SocketAddrV4>,
        clock: C,
    ) -> Self {
        let discovery = PeerDiscovery::new(endpoint, bootstrap, config.max_peers);
        let state = ProtocolState::new(config, clock.now_ms());

        SyncManager {
            clock,
            state,
            registry: PeerRegistry::new(),
            discovery,
        }
    }

    /// Messages to send once the socket is up
    pub fn start(&self) -> Vec<Outbound> {
        self.discovery.join().into_iter().collect()
    }

    /// Handles a datagram received just now
    pub fn handle_datagram(&mut self, datagram: &[u8], sender: SocketAddrV4) -> Vec<Outbound> {
        let received_at = self.clock.now_ms();
        self.handle_datagram_received_at(datagram, sender, received_at)
    }

    /// Handles a datagram whose arrival was stamped at `received_at`
    ///
    /// Rejected datagrams are logged and leave no reply.
    pub fn handle_datagram_received_at(
        &mut self,
        datagram: &[u8],
        sender: SocketAddrV4,
        received_at: i64,
    ) -> Vec<Outbound> {
        if datagram.is_empty() {
            return Vec::new();
        }

        match self.dispatch(datagram, sender, received_at) {
            Ok(outbound) => outbound,
            Err(e) if e.is_violation() => {
                warn!(
                    %sender,
                    kind = datagram[0],
                    len = datagram.len(),
                    prefix = %hex_prefix(datagram),
                    error = %e,
                    "dropped datagram"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(%sender, kind = datagram[0], error = %e, "failed to handle datagram");
                Vec::new()
            }
        }
    }

    fn dispatch(&mut self, datagram: &[u8], sender: SocketAddrV4, received_at: i64) -> Result<Vec<Outbound>> {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                // A malformed peer list from the bootstrap peer voids the pending batch
                if datagram[0] == MessageType::HelloReply.code()
                    && self.discovery.bootstrap() == Some(sender)
                {
                    self.discovery.discard_pending();
                }
                return Err(e);
            }
        };
        let now = self.clock.now_ms();

        let outbound = match message {
            Message::Hello => vec![self.discovery.handle_hello(&mut self.registry, sender)?],
            Message::HelloReply { peers } => {
                self.discovery.handle_hello_reply(&mut self.registry, sender, &peers)?
            }
            Message::Connect => vec![self.discovery.handle_connect(&mut self.registry, sender)?],
            Message::AckConnect => {
                self.discovery.handle_ack_connect(&mut self.registry, sender)?;
                Vec::new()
            }
            Message::SyncStart { level, timestamp } => vec![self.state.handle_sync_start(
                &mut self.registry,
                sender,
                level,
                timestamp,
                received_at,
                now,
            )?],
            Message::DelayRequest => vec![self.state.handle_delay_request(&self.registry, sender, now)?],
            Message::DelayResponse { level, timestamp } => {
                self.state
                    .handle_delay_response(&mut self.registry, sender, level, timestamp, now)?;
                Vec::new()
            }
            Message::Leader { level } => {
                self.state.handle_leader(level, now)?;
                Vec::new()
            }
            Message::GetTime => vec![Outbound::new(self.state.time_reply(now), sender)],
            Message::Time { .. } => {
                return Err(Error::protocol("TIME is only sent to clients"));
            }
        };

        Ok(outbound)
    }

    /// Periodic work: staleness check, then a SYNC_START broadcast if due
    pub fn handle_tick(&mut self) -> Vec<Outbound> {
        let now = self.clock.now_ms();
        self.state.check_staleness(now);
        self.state.poll_broadcast(&mut self.registry, now)
    }

    pub fn level(&self) -> SyncLevel {
        self.state.level()
    }

    pub fn offset(&self) -> i64 {
        self.state.offset()
    }

    pub fn adjusted_time(&self) -> i64 {
        self.state.adjusted_time(self.clock.now_ms())
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn discovery(&self) -> &PeerDiscovery {
        &self.discovery
    }

    pub fn state(&self) -> &ProtocolState {
        &self.state
    }

    pub fn config(&self) -> &ProtocolConfig {
        self.state.config()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use crate::time::ManualClock;

    fn addr(a: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), 4000)
    }

    const CONTROL: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 1);

    /// In-memory network delivering every message through the codec
    struct Network {
        clock: ManualClock,
        nodes: Vec<(SocketAddrV4, SyncManager<ManualClock>)>,
    }

    impl Network {
        fn new() -> Self {
            Network {
                clock: ManualClock::starting_at(0),
                nodes: Vec::new(),
            }
        }

        fn spawn(&mut self, a: u8, bootstrap: Option<u8>) {
            let manager = SyncManager::new(
                ProtocolConfig::default(),
                LocalEndpoint::new(addr(a), Vec::new()),
                bootstrap.map(addr),
                self.clock.clone(),
            );
            let start = manager.start();
            self.nodes.push((addr(a), manager));
            self.deliver(addr(a), start);
        }

        fn node(&self, a: u8) -> &SyncManager<ManualClock> {
            &self.nodes.iter().find(|(peer, _)| *peer == addr(a)).unwrap().1
        }

        fn deliver(&mut self, from: SocketAddrV4, outbound: Vec<Outbound>) -> Vec<Message> {
            let mut queue: VecDeque<(SocketAddrV4, Outbound)> =
                outbound.into_iter().map(|out| (from, out)).collect();
            let mut unrouted = Vec::new();

            while let Some((sender, out)) = queue.pop_front() {
                let bytes = out.message.to_bytes();
                match self.nodes.iter_mut().find(|(a, _)| *a == out.destination) {
                    Some((a, node)) => {
                        let receiver = *a;
                        let replies = node.handle_datagram(&bytes, sender);
                        queue.extend(replies.into_iter().map(|reply| (receiver, reply)));
                    }
                    None => unrouted.push(out.message),
                }
            }
            unrouted
        }

        fn send(&mut self, from: SocketAddrV4, to: u8, message: Message) -> Vec<Message> {
            self.deliver(from, vec![Outbound::new(message, addr(to))])
        }

        fn tick_all(&mut self) {
            for i in 0..self.nodes.len() {
                let (from, outbound) = {
                    let (a, node) = &mut self.nodes[i];
                    (*a, node.handle_tick())
                };
                self.deliver(from, outbound);
            }
        }
    }

    /// A root with two members that joined through it
    fn three_nodes() -> Network {
        let mut net = Network::new();
        net.spawn(1, None);
        net.clock.advance(500);
        net.spawn(2, Some(1));
        net.clock.advance(300);
        net.spawn(3, Some(1));
        net
    }

    #[test]
    fn test_join_builds_full_mesh() {
        let net = three_nodes();

        let peers = |a| net.node(a).registry().addrs().collect::<Vec<_>>();
        assert_eq!(peers(1), vec![addr(2), addr(3)]);
        assert_eq!(peers(2), vec![addr(1), addr(3)]);
        assert_eq!(peers(3), vec![addr(1), addr(2)]);
        assert!(net.node(3).discovery().pending().is_empty());
    }

    #[test]
    fn test_leader_synchronizes_members() {
        let mut net = three_nodes();
        net.send(CONTROL, 1, Message::Leader { level: SyncLevel::LEADER });
        assert_eq!(net.node(1).level(), SyncLevel::LEADER);

        net.clock.advance(1_999);
        net.tick_all();
        assert_eq!(net.node(2).level(), SyncLevel::UNSYNCED);

        net.clock.advance(1);
        net.tick_all();

        for a in [2, 3] {
            assert_eq!(net.node(a).level(), SyncLevel::new(1));
            assert_eq!(net.node(a).adjusted_time(), net.node(1).adjusted_time());
        }
        assert_eq!(net.node(2).offset(), -500);
        assert_eq!(net.node(3).offset(), -800);
    }

    #[test]
    fn test_levels_settle_over_rounds() {
        let mut net = three_nodes();
        net.send(CONTROL, 1, Message::Leader { level: SyncLevel::LEADER });

        for _ in 0..10 {
            net.clock.advance(1_000);
            net.tick_all();
        }

        assert_eq!(net.node(1).level(), SyncLevel::LEADER);
        assert_eq!(net.node(2).level(), SyncLevel::new(1));
        assert_eq!(net.node(3).level(), SyncLevel::new(1));
    }

    #[test]
    fn test_member_goes_stale_without_root() {
        let mut net = three_nodes();
        net.send(CONTROL, 1, Message::Leader { level: SyncLevel::LEADER });
        net.clock.advance(2_000);
        net.tick_all();
        assert_eq!(net.node(2).level(), SyncLevel::new(1));

        // Root disappears; the members only offer each other equal levels
        net.nodes.retain(|(peer, _)| *peer != addr(1));
        for _ in 0..20 {
            net.clock.advance(1_000);
            net.tick_all();
        }
        assert_eq!(net.node(2).level(), SyncLevel::new(1));

        net.clock.advance(1);
        net.tick_all();
        for a in [2, 3] {
            assert_eq!(net.node(a).level(), SyncLevel::UNSYNCED);
        }
    }

    #[test]
    fn test_get_time_reply() {
        let mut net = three_nodes();
        let replies = net.send(CONTROL, 2, Message::GetTime);
        assert_eq!(
            replies,
            vec![Message::Time { level: SyncLevel::UNSYNCED, timestamp: 300 }]
        );
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        let mut net = three_nodes();
        let node = &mut net.nodes[1].1;

        assert!(node.handle_datagram(&[], CONTROL).is_empty());
        assert!(node.handle_datagram(&[0x7f, 1, 2], CONTROL).is_empty());
        // GET_TIME with trailing garbage
        assert!(node.handle_datagram(&[31, 0], CONTROL).is_empty());
        // SYNC_START one byte short
        assert!(node.handle_datagram(&[11, 0, 0, 0, 0, 0, 0, 0, 0], addr(1)).is_empty());
        assert!(node.handle_datagram(&Message::Time {
            level: SyncLevel::LEADER,
            timestamp: 1,
        }.to_bytes(), addr(1)).is_empty());

        assert_eq!(node.level(), SyncLevel::UNSYNCED);
        assert!(node.state().session().is_none());
        assert_eq!(node.registry().len(), 2);
    }

    #[test]
    fn test_sync_start_from_stranger_is_ignored() {
        let mut net = three_nodes();
        let offer = Message::SyncStart { level: SyncLevel::LEADER, timestamp: 0 };
        assert!(net.send(CONTROL, 2, offer).is_empty());
        assert_eq!(net.node(2).level(), SyncLevel::UNSYNCED);
        assert!(net.node(2).state().session().is_none());
    }

    #[test]
    fn test_malformed_hello_reply_discards_pending() {
        let clock = ManualClock::starting_at(0);
        let mut manager = SyncManager::new(
            ProtocolConfig::default(),
            LocalEndpoint::new(addr(5), Vec::new()),
            Some(addr(1)),
            clock,
        );

        let reply = Message::HelloReply { peers: vec![addr(2)] };
        let out = manager.handle_datagram(&reply.to_bytes(), addr(1));
        assert_eq!(out, vec![Outbound::new(Message::Connect, addr(2))]);
        assert_eq!(manager.discovery().pending().len(), 1);

        // Malformed records from anyone else leave the batch alone
        let bad_length = [2, 0, 1, 16, 10, 0, 0, 3, 0x0f, 0xa0];
        assert!(manager.handle_datagram(&bad_length, addr(9)).is_empty());
        assert_eq!(manager.discovery().pending().len(), 1);

        // Declared address length 16 instead of 4
        assert!(manager.handle_datagram(&bad_length, addr(1)).is_empty());
        assert!(manager.discovery().pending().is_empty());
        assert!(!manager.registry().contains(&addr(2)));
    }

    /// Log sink shared between the subscriber and the test
    #[derive(Clone, Default)]
    struct Capture(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_dropped_datagram_visible_at_info() {
        let mut net = three_nodes();
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let node = &mut net.nodes[1].1;
            assert!(node.handle_datagram(&[0x7f, 1, 2], CONTROL).is_empty());
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("dropped datagram"), "{}", output);
        assert!(output.contains("7f0102"), "{}", output);
        assert!(output.contains("kind=127"), "{}", output);
    }

    #[test]
    fn test_truncated_hello_reply_discards_pending() {
        let clock = ManualClock::starting_at(0);
        let mut manager = SyncManager::new(
            ProtocolConfig::default(),
            LocalEndpoint::new(addr(5), Vec::new()),
            Some(addr(1)),
            clock,
        );

        let reply = Message::HelloReply { peers: vec![addr(2), addr(3)] };
        manager.handle_datagram(&reply.to_bytes(), addr(1));
        assert_eq!(manager.discovery().pending().len(), 2);

        // Count of one, record cut after the address
        let truncated = [2, 0, 1, 4, 10, 0, 0, 4];
        assert!(manager.handle_datagram(&truncated, addr(1)).is_empty());
        assert!(manager.discovery().pending().is_empty());
    }

    #[test]
    fn test_received_at_stamps_t2() {
        let clock = ManualClock::starting_at(0);
        let mut manager = SyncManager::new(
            ProtocolConfig::default(),
            LocalEndpoint::new(addr(2), Vec::new()),
            None,
            clock.clone(),
        );
        manager.handle_datagram(&Message::Connect.to_bytes(), addr(1));

        clock.advance(100);
        let offer = Message::SyncStart { level: SyncLevel::LEADER, timestamp: 0 };
        let out = manager.handle_datagram_received_at(&offer.to_bytes(), addr(1), 90);
        assert_eq!(out, vec![Outbound::new(Message::DelayRequest, addr(1))]);
        // (90 - 0) + 100
        assert_eq!(manager.state().session().unwrap().provisional_offset, 190);
    }
}
