//! Deadline timers keyed by the entity that owns them.
//!
//! Scheduling a key that is already pending replaces its deadline, and
//! cancelling a key that is not pending is a no-op. Owners check their own
//! state when a timer fires, so a late or duplicate expiry changes nothing.

use std::collections::BTreeMap;

/// Identity of a pending deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKey {
    /// Forced completion of IV Update in progress
    IvUpdateTimeout,
    /// Friendship poll timeout
    FriendPoll {
        /// Subnet of the friendship
        net_idx: u16,
        /// Peer address
        peer: u16,
    },
}

/// Set of pending deadlines.
#[derive(Debug)]
pub struct TimerQueue<I> {
    deadlines: BTreeMap<TimerKey, I>,
}

impl<I> Default for TimerQueue<I> {
    fn default() -> Self {
        Self { deadlines: BTreeMap::new() }
    }
}

impl<I: Copy + Ord> TimerQueue<I> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer.
    pub fn schedule(&mut self, key: TimerKey, deadline: I) {
        self.deadlines.insert(key, deadline);
    }

    /// Disarm a timer. Returns true if it was pending.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.deadlines.remove(&key).is_some()
    }

    /// Deadline of a pending timer.
    pub fn deadline(&self, key: TimerKey) -> Option<I> {
        self.deadlines.get(&key).copied()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<I> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: I) -> Vec<TimerKey> {
        let mut expired: Vec<(I, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, *key))
            .collect();
        expired.sort();

        for (_, key) in &expired {
            self.deadlines.remove(key);
        }
        expired.into_iter().map(|(_, key)| key).collect()
    }
}
