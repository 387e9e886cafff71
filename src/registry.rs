//! Peer id → network address, used to enrich published records.

use crate::peer::PeerId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Address used in records when a peer was never observed.
pub const SENTINEL_ADDRESS: &str = "127.0.0.1";

pub struct PeerInfoRegistry {
    cache: Mutex<LruCache<PeerId, String>>,
}

impl PeerInfoRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { cache: Mutex::new(LruCache::new(capacity)) }
    }

    /// Record `address` unless the peer already has one. The check and the
    /// insert happen under one lock, so concurrent sightings cannot race.
    pub fn observe(&self, peer: PeerId, address: impl Into<String>) -> bool {
        let mut cache = self.cache.lock();
        if cache.contains(&peer) {
            return false;
        }
        cache.put(peer, address.into());
        true
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<String> {
        self.cache.lock().get(peer).cloned()
    }

    pub fn address_or_sentinel(&self, peer: &PeerId) -> String {
        self.lookup(peer).unwrap_or_else(|| SENTINEL_ADDRESS.to_string())
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_wins() {
        let reg = PeerInfoRegistry::new(8);
        let p = PeerId::random();
        assert!(reg.observe(p, "1.2.3.4:30303"));
        assert!(!reg.observe(p, "5.6.7.8:30303"));
        assert_eq!(reg.lookup(&p).as_deref(), Some("1.2.3.4:30303"));
    }

    #[test]
    fn unknown_peer_gets_sentinel() {
        let reg = PeerInfoRegistry::new(8);
        assert_eq!(reg.lookup(&PeerId::random()), None);
        assert_eq!(reg.address_or_sentinel(&PeerId::random()), SENTINEL_ADDRESS);
    }

    #[test]
    fn bounded_capacity() {
        let reg = PeerInfoRegistry::new(2);
        let peers: Vec<_> = (0..3).map(|_| PeerId::random()).collect();
        for p in &peers {
            reg.observe(*p, "addr");
        }
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.lookup(&peers[0]), None);
    }
}
