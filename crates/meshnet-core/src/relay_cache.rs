//! Short-lived cache of recently accepted network PDUs.
//!
//! The same message usually arrives several times as neighbours relay it.
//! Every relay decrements the TTL, which changes the nonce and therefore
//! every obfuscated and encrypted byte, so copies are matched on what stays
//! fixed: IV Index, source, sequence number and destination. The sequence
//! number restarts at 0 with every IV Index, so the index is part of the
//! key. The cache is consulted
//! as soon as the header is authenticated, before the replay ledger.
//! Correctness never depends on it: a miss falls through to the replay
//! ledger.

use std::{collections::VecDeque, time::Duration};

use sha2::{Digest, Sha256};

use crate::env::MonotonicInstant;

/// Hash identifying one message across all relayed copies.
pub fn msg_hash(iv_index: u32, src: u16, seq: u32, dst: u16) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(iv_index.to_be_bytes());
    hasher.update(src.to_be_bytes());
    hasher.update(&seq.to_be_bytes()[1..]);
    hasher.update(dst.to_be_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry<I> {
    hash: u64,
    src: u16,
    seq: u32,
    inserted: I,
}

/// Bounded, time-windowed set of message hashes.
#[derive(Debug)]
pub struct RelayCache<I> {
    entries: VecDeque<CacheEntry<I>>,
    capacity: usize,
    window: Duration,
}

impl<I: MonotonicInstant> RelayCache<I> {
    /// Create a cache holding at most `capacity` hashes for `window` each.
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity, window }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source and sequence number of a cached PDU with this hash.
    pub fn lookup(&mut self, hash: u64, now: I) -> Option<(u16, u32)> {
        self.expire(now);
        self.entries.iter().find(|entry| entry.hash == hash).map(|entry| (entry.src, entry.seq))
    }

    /// Remember an accepted PDU. The oldest entry is dropped when full.
    pub fn insert(&mut self, hash: u64, src: u16, seq: u32, now: I) {
        if self.capacity == 0 {
            return;
        }
        self.expire(now);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CacheEntry { hash, src, seq, inserted: now });
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn expire(&mut self, now: I) {
        while let Some(front) = self.entries.front() {
            if now < front.inserted + self.window {
                break;
            }
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn hit_reports_source_and_sequence() {
        let now = Instant::now();
        let mut cache = RelayCache::new(4, Duration::from_secs(10));
        let hash = msg_hash(5, 0x0001, 42, 0xC000);

        cache.insert(hash, 0x0001, 42, now);
        assert_eq!(cache.lookup(hash, now), Some((0x0001, 42)));
        assert_eq!(cache.lookup(msg_hash(5, 0x0001, 43, 0xC000), now), None);
    }

    #[test]
    fn entries_expire_after_window() {
        let now = Instant::now();
        let mut cache = RelayCache::new(4, Duration::from_secs(10));
        let hash = msg_hash(0, 1, 1, 2);
        cache.insert(hash, 1, 1, now);

        assert!(cache.lookup(hash, now + Duration::from_secs(9)).is_some());
        assert!(cache.lookup(hash, now + Duration::from_secs(10)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let now = Instant::now();
        let mut cache = RelayCache::new(2, Duration::from_secs(10));
        cache.insert(1, 1, 1, now);
        cache.insert(2, 2, 2, now);
        cache.insert(3, 3, 3, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(1, now).is_none());
        assert!(cache.lookup(3, now).is_some());
    }

    #[test]
    fn hash_covers_index_source_sequence_and_destination() {
        let base = msg_hash(9, 0x0001, 7, 0x0002);

        assert_eq!(base, msg_hash(9, 0x0001, 7, 0x0002));
        assert_ne!(base, msg_hash(10, 0x0001, 7, 0x0002));
        assert_ne!(base, msg_hash(9, 0x0003, 7, 0x0002));
        assert_ne!(base, msg_hash(9, 0x0001, 8, 0x0002));
        assert_ne!(base, msg_hash(9, 0x0001, 7, 0x0004));
    }
}
