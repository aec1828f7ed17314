//! Replay Protection List.
//!
//! Remembers, per source address, the highest sequence number accepted and
//! whether it was accepted under the previous IV Index. A PDU is fresh only
//! if its `(iv, seq)` pair strictly advances the stored pair, where any PDU
//! under the current IV Index outranks every PDU under the previous one.
//!
//! The table has a fixed capacity. When full, the least recently updated
//! entry is evicted; its source loses replay protection until it is heard
//! from again.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::NetError;

/// One ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Source unicast address
    pub src: u16,
    /// Highest accepted sequence number
    pub seq: u32,
    /// Accepted under the previous IV Index
    pub old_iv: bool,
}

impl ReplayEntry {
    /// Ordering key: current-IV entries rank above old-IV entries.
    fn rank(old_iv: bool, seq: u32) -> (bool, u32) {
        (!old_iv, seq)
    }

    fn is_advanced_by(&self, seq: u32, old_iv: bool) -> bool {
        Self::rank(old_iv, seq) > Self::rank(self.old_iv, self.seq)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: ReplayEntry,
    last_used: u64,
}

/// Fixed-capacity replay protection ledger.
#[derive(Debug)]
pub struct ReplayLedger {
    slots: Vec<Slot>,
    capacity: usize,
    clock: u64,
}

impl ReplayLedger {
    /// Create an empty ledger.
    pub fn new(capacity: usize) -> Self {
        Self { slots: Vec::with_capacity(capacity), capacity, clock: 0 }
    }

    /// Maximum number of tracked sources.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no source is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stored state for `src`.
    pub fn get(&self, src: u16) -> Option<&ReplayEntry> {
        self.slots.iter().find(|slot| slot.entry.src == src).map(|slot| &slot.entry)
    }

    /// Check freshness without recording.
    ///
    /// # Errors
    ///
    /// - `ReplayDetected` if `(old_iv, seq)` does not advance the stored state
    pub fn check(&self, src: u16, seq: u32, old_iv: bool) -> Result<(), NetError> {
        match self.get(src) {
            Some(entry) if !entry.is_advanced_by(seq, old_iv) => {
                Err(NetError::ReplayDetected { src, seq })
            },
            _ => Ok(()),
        }
    }

    /// Check freshness and record the PDU in one step.
    ///
    /// # Errors
    ///
    /// - `ReplayDetected` if `(old_iv, seq)` does not advance the stored state;
    ///   the ledger is left unchanged
    pub fn check_and_record(&mut self, src: u16, seq: u32, old_iv: bool) -> Result<(), NetError> {
        self.clock += 1;
        let now = self.clock;
        let entry = ReplayEntry { src, seq, old_iv };

        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.entry.src == src) {
            if !slot.entry.is_advanced_by(seq, old_iv) {
                debug!(src, seq, stored = slot.entry.seq, old_iv, "Replay rejected");
                return Err(NetError::ReplayDetected { src, seq });
            }
            slot.entry = entry;
            slot.last_used = now;
            return Ok(());
        }

        if self.slots.len() < self.capacity {
            self.slots.push(Slot { entry, last_used: now });
            trace!(src, seq, "Replay entry added");
            return Ok(());
        }

        let Some(victim) = self.slots.iter_mut().min_by_key(|slot| slot.last_used) else {
            // Zero-capacity ledger: nothing can be tracked
            warn!(src, "Replay ledger has no capacity");
            return Ok(());
        };
        warn!(evicted = victim.entry.src, src, "Replay ledger full, evicting oldest entry");
        *victim = Slot { entry, last_used: now };
        Ok(())
    }

    /// Adjust the ledger for a new IV Index.
    ///
    /// Entries that were already old are dropped; every remaining entry
    /// becomes old.
    pub fn reset_for_iv_update(&mut self) {
        let before = self.slots.len();
        self.slots.retain(|slot| !slot.entry.old_iv);
        for slot in &mut self.slots {
            slot.entry.old_iv = true;
        }
        debug!(dropped = before - self.slots.len(), kept = self.slots.len(), "Replay ledger reset");
    }

    /// Forget every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Snapshot of all entries, least recently updated first.
    pub fn entries(&self) -> Vec<ReplayEntry> {
        let mut slots: Vec<&Slot> = self.slots.iter().collect();
        slots.sort_by_key(|slot| slot.last_used);
        slots.into_iter().map(|slot| slot.entry).collect()
    }

    /// Rebuild a ledger from a snapshot taken with [`Self::entries`].
    ///
    /// Entries beyond `capacity` are dropped from the front (oldest).
    pub fn from_entries(capacity: usize, entries: &[ReplayEntry]) -> Self {
        let mut ledger = Self::new(capacity);
        let skip = entries.len().saturating_sub(capacity);
        for entry in &entries[skip..] {
            ledger.clock += 1;
            ledger.slots.push(Slot { entry: *entry, last_used: ledger.clock });
        }
        ledger
    }
}
