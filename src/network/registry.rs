use std::net::SocketAddrV4;

use crate::core::{Peer, PeerId};

/// Initial capacity of the backing storage
const INITIAL_CAPACITY: usize = 8;

/// Ordered membership store
///
/// Peers are kept strictly sorted by address, then port, with no
/// duplicates. Two tracked references name the peer we are synchronized
/// with and the peer of the current negotiation. They are stable handles,
/// so inserting never moves them; removing the referenced peer clears them.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    next_id: u64,
    synchronized: Option<PeerId>,
    syncing: Option<PeerId>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: Vec::with_capacity(INITIAL_CAPACITY),
            next_id: 0,
            synchronized: None,
            syncing: None,
        }
    }

    /// Binary search for `addr`
    ///
    /// Returns `Ok(index)` when present, `Err(insertion_point)` otherwise.
    pub fn find(&self, addr: &SocketAddrV4) -> Result<usize, usize> {
        self.peers.binary_search_by(|peer| peer.addr.cmp(addr))
    }

    /// Inserts `addr` in sorted position, or returns the existing handle
    pub fn upsert(&mut self, addr: SocketAddrV4) -> PeerId {
        match self.find(&addr) {
            Ok(index) => self.peers[index].id,
            Err(index) => {
                if self.peers.len() == self.peers.capacity() {
                    let grow_by = self.peers.capacity().max(INITIAL_CAPACITY);
                    self.peers.reserve_exact(grow_by);
                }

                let id = PeerId(self.next_id);
                self.next_id += 1;
                self.peers.insert(index, Peer::new(id, addr));
                id
            }
        }
    }

    /// Removes the peer at `index`, compacting the store
    ///
    /// Tracked references to the removed peer are cleared.
    pub fn remove(&mut self, index: usize) -> Option<Peer> {
        if index >= self.peers.len() {
            return None;
        }

        let removed = self.peers.remove(index);
        if self.synchronized == Some(removed.id) {
            self.synchronized = None;
        }
        if self.syncing == Some(removed.id) {
            self.syncing = None;
        }
        Some(removed)
    }

    /// Removes the peer with address `addr`
    pub fn remove_key(&mut self, addr: &SocketAddrV4) -> Option<Peer> {
        let index = self.find(addr).ok()?;
        self.remove(index)
    }

    /// Removes every peer and clears the tracked references
    pub fn clear(&mut self) {
        self.peers.clear();
        self.synchronized = None;
        self.syncing = None;
    }

    pub fn get(&self, addr: &SocketAddrV4) -> Option<&Peer> {
        self.find(addr).ok().map(|index| &self.peers[index])
    }

    pub fn get_by_id(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id == id)
    }

    /// Handle of the peer at `addr`
    pub fn id_of(&self, addr: &SocketAddrV4) -> Option<PeerId> {
        self.get(addr).map(|peer| peer.id)
    }

    pub fn contains(&self, addr: &SocketAddrV4) -> bool {
        self.find(addr).is_ok()
    }

    /// Peers in key order
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    /// Addresses in key order
    pub fn addrs(&self) -> impl Iterator<Item = SocketAddrV4> + '_ {
        self.peers.iter().map(|peer| peer.addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Records that a SYNC_START was sent to every peer at `now`
    pub fn mark_sync_start_all(&mut self, now: i64) {
        for peer in &mut self.peers {
            peer.last_sync_start = Some(now);
        }
    }

    /// Peer we are synchronized with
    pub fn synchronized(&self) -> Option<PeerId> {
        self.synchronized
    }

    /// Peer of the current negotiation
    pub fn syncing(&self) -> Option<PeerId> {
        self.syncing
    }

    pub fn set_syncing(&mut self, id: PeerId) {
        self.syncing = Some(id);
    }

    /// The negotiation peer becomes the synchronized peer
    pub fn promote_syncing(&mut self) {
        self.synchronized = self.syncing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    fn assert_sorted(registry: &PeerRegistry) {
        let addrs: Vec<SocketAddrV4> = registry.addrs().collect();
        for pair in addrs.windows(2) {
            assert!(pair[0] < pair[1], "{:?} not strictly sorted", addrs);
        }
    }

    #[test]
    fn test_upsert_keeps_order() {
        let mut registry = PeerRegistry::new();
        for (a, port) in [(5, 1), (1, 9), (3, 2), (1, 2), (9, 9), (3, 1)] {
            registry.upsert(addr(a, port));
        }

        assert_eq!(registry.len(), 6);
        assert_sorted(&registry);
        assert_eq!(registry.addrs().next(), Some(addr(1, 2)));
    }

    #[test]
    fn test_upsert_existing_returns_same_handle() {
        let mut registry = PeerRegistry::new();
        let first = registry.upsert(addr(1, 1));
        registry.mark_sync_start_all(77);
        let again = registry.upsert(addr(1, 1));

        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&addr(1, 1)).unwrap().last_sync_start, Some(77));
    }

    #[test]
    fn test_find_returns_insertion_point() {
        let mut registry = PeerRegistry::new();
        registry.upsert(addr(2, 1));
        registry.upsert(addr(4, 1));
        registry.upsert(addr(6, 1));

        assert_eq!(registry.find(&addr(4, 1)), Ok(1));
        assert_eq!(registry.find(&addr(1, 1)), Err(0));
        assert_eq!(registry.find(&addr(5, 1)), Err(2));
        assert_eq!(registry.find(&addr(7, 1)), Err(3));
        // Same address, port decides
        assert_eq!(registry.find(&addr(4, 0)), Err(1));
        assert_eq!(registry.find(&addr(4, 2)), Err(2));
    }

    #[test]
    fn test_tracked_references_survive_insertion() {
        let mut registry = PeerRegistry::new();
        let target = registry.upsert(addr(5, 5));
        registry.set_syncing(target);
        registry.promote_syncing();

        for a in 0..5 {
            registry.upsert(addr(a, 1));
        }

        assert_eq!(registry.synchronized(), Some(target));
        assert_eq!(registry.syncing(), Some(target));
        assert_eq!(registry.get_by_id(target).unwrap().addr, addr(5, 5));
    }

    #[test]
    fn test_remove_invalidates_referenced_peer() {
        let mut registry = PeerRegistry::new();
        let first = registry.upsert(addr(1, 1));
        let second = registry.upsert(addr(2, 1));
        registry.set_syncing(first);
        registry.promote_syncing();
        registry.set_syncing(second);

        let removed = registry.remove(0).unwrap();
        assert_eq!(removed.id, first);
        assert_eq!(registry.synchronized(), None);
        // The peer that slid into slot 0 keeps its own identity
        assert_eq!(registry.syncing(), Some(second));
        assert_eq!(registry.find(&addr(2, 1)), Ok(0));
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut registry = PeerRegistry::new();
        registry.upsert(addr(1, 1));
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_key(&addr(9, 9)).is_none());
        assert!(registry.remove_key(&addr(1, 1)).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_growth_by_doubling() {
        let mut registry = PeerRegistry::new();
        assert!(registry.peers.capacity() >= INITIAL_CAPACITY);
        for i in 0..100u16 {
            registry.upsert(addr((i % 7) as u8, i));
        }
        assert_eq!(registry.len(), 100);
        assert!(registry.peers.capacity() >= 100);
        assert_sorted(&registry);
    }

    #[test]
    fn test_mixed_operations_stay_sorted() {
        let mut registry = PeerRegistry::new();
        let mut state: u32 = 0x2545_f491;
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let key = addr((state % 11) as u8, (state >> 8) as u16 % 13);
            if state % 3 == 0 {
                registry.remove_key(&key);
                assert!(!registry.contains(&key));
            } else {
                registry.upsert(key);
                assert!(registry.contains(&key));
            }
            assert_sorted(&registry);
        }
    }

    #[test]
    fn test_clear_drops_references() {
        let mut registry = PeerRegistry::new();
        let id = registry.upsert(addr(1, 1));
        registry.set_syncing(id);
        registry.promote_syncing();
        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(registry.synchronized(), None);
        assert_eq!(registry.syncing(), None);
    }
}
