//! Bounded memory of artifacts already forwarded downstream.
//!
//! Eviction may forget a hash, after which it can be published again.

use alloy_primitives::B256;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub struct AnnouncementDeduplicator {
    seen: Mutex<LruCache<B256, ()>>,
}

impl AnnouncementDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { seen: Mutex::new(LruCache::new(capacity)) }
    }

    /// True only for the first caller with `hash` while it is resident.
    pub fn mark_if_new(&self, hash: B256) -> bool {
        let mut seen = self.seen.lock();
        if seen.get(&hash).is_some() {
            return false;
        }
        seen.put(hash, ());
        true
    }

    /// Drop `hash` so a later announcement is treated as new.
    pub fn forget(&self, hash: &B256) -> bool {
        self.seen.lock().pop(hash).is_some()
    }

    /// Membership test that does not insert or refresh recency.
    pub fn contains(&self, hash: &B256) -> bool {
        self.seen.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn only_first_mark_wins() {
        let d = AnnouncementDeduplicator::new(16);
        let h = B256::repeat_byte(3);
        assert!(!d.contains(&h));
        assert!(d.mark_if_new(h));
        assert!(!d.mark_if_new(h));
        assert!(!d.mark_if_new(h));
        assert!(d.contains(&h));
    }

    #[test]
    fn eviction_forgets_oldest() {
        let d = AnnouncementDeduplicator::new(2);
        let (a, b, c) = (B256::repeat_byte(1), B256::repeat_byte(2), B256::repeat_byte(3));
        assert!(d.mark_if_new(a));
        assert!(d.mark_if_new(b));
        assert!(d.mark_if_new(c));
        assert_eq!(d.len(), 2);
        assert!(d.mark_if_new(a));
    }

    #[test]
    fn forgotten_hash_marks_again() {
        let d = AnnouncementDeduplicator::new(4);
        let h = B256::repeat_byte(7);
        assert!(!d.forget(&h));
        assert!(d.mark_if_new(h));
        assert!(d.forget(&h));
        assert!(!d.contains(&h));
        assert!(d.mark_if_new(h));
    }

    #[test]
    fn concurrent_marks_yield_one_winner() {
        let d = Arc::new(AnnouncementDeduplicator::new(64));
        let h = B256::repeat_byte(0x42);
        let winners: usize = (0..8)
            .map(|_| {
                let d = d.clone();
                std::thread::spawn(move || d.mark_if_new(h) as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }
}
