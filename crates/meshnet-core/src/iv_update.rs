//! IV Update procedure.
//!
//! The IV Index is shared by the whole network and feeds every nonce. It
//! advances in two steps:
//!
//! ```text
//!            start / beacon(index + 1, IVU)
//!   Normal ─────────────────────────────────► InProgress
//!     ▲      iv_index += 1, tx index unchanged      │
//!     │                                             │
//!     └─────────────────────────────────────────────┘
//!        complete / beacon(index, !IVU) / timeout
//!              tx index advances, seq = 0
//! ```
//!
//! While in progress the node transmits with `iv_index - 1` and accepts
//! both indices on receive. After completion PDUs under the previous index
//! are still accepted for a configurable grace period.
//!
//! The state machine is sans-IO: every method takes `now` and returns what
//! happened, and [`crate::MeshNet`] applies the side effects (replay ledger
//! reset, sequence reset, deadline timers).

use std::time::Duration;

use tracing::{info, warn};

use crate::{
    config::{IV_RECOVERY_LIMIT, NetConfig},
    env::MonotonicInstant,
    error::NetError,
};

/// Result of driving the IV Update state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvUpdateOutcome {
    /// Nothing changed
    Unchanged,
    /// Entered IV Update in progress with this stored index
    Started {
        /// New stored IV Index
        iv_index: u32,
    },
    /// Returned to normal operation; transmissions now use this index
    Completed {
        /// Current IV Index
        iv_index: u32,
    },
    /// Completion postponed until in-flight SDUs finish
    Deferred,
    /// Jumped to an index observed on the network
    Recovered {
        /// New stored IV Index
        iv_index: u32,
        /// Whether the network is still in IV Update in progress
        in_progress: bool,
    },
}

/// Global IV Index state.
#[derive(Debug, Clone)]
pub struct IvState<I> {
    iv_index: u32,
    in_progress: bool,
    initiator: bool,
    pending_update: bool,
    last_transition: I,
    old_iv_valid_until: Option<I>,
    sdu_in_flight: usize,
}

impl<I: MonotonicInstant> IvState<I> {
    /// State after provisioning or restart.
    ///
    /// The current time counts as the last transition, so the minimum
    /// interval applies before the first update.
    pub fn new(iv_index: u32, in_progress: bool, now: I) -> Self {
        Self {
            iv_index,
            in_progress,
            initiator: false,
            pending_update: false,
            last_transition: now,
            old_iv_valid_until: None,
            sdu_in_flight: 0,
        }
    }

    /// Stored IV Index.
    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    /// Returns true while IV Update is in progress.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Returns true if this node started the running update.
    pub fn initiator(&self) -> bool {
        self.initiator
    }

    /// Returns true if completion is waiting for SDUs to finish.
    pub fn pending_update(&self) -> bool {
        self.pending_update
    }

    /// When the state last changed.
    pub fn last_transition(&self) -> I {
        self.last_transition
    }

    /// Number of SDUs whose transmission depends on the current index.
    pub fn sdu_in_flight(&self) -> usize {
        self.sdu_in_flight
    }

    /// IV Index used for transmission.
    pub fn tx_iv_index(&self) -> u32 {
        self.iv_index.wrapping_sub(u32::from(self.in_progress))
    }

    /// Resolve the IV Index of a received PDU from its IVI bit.
    ///
    /// Returns the index and whether it is the previous one.
    pub fn resolve_rx(&self, ivi: u8) -> (u32, bool) {
        let old_iv = (ivi & 0x01) != (self.iv_index & 0x01) as u8;
        (self.iv_index.wrapping_sub(u32::from(old_iv)), old_iv)
    }

    /// Whether PDUs under the previous IV Index are still accepted.
    pub fn accepts_old_iv(&self, now: I) -> bool {
        self.iv_index > 0
            && (self.in_progress || self.old_iv_valid_until.is_some_and(|until| now < until))
    }

    /// Time left before the minimum interval allows another transition.
    pub fn remaining_interval(&self, now: I, config: &NetConfig) -> Option<Duration> {
        let elapsed = now - self.last_transition;
        config.iv_update_min_interval.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    /// Enter IV Update in progress.
    ///
    /// Already being in progress is not an error.
    ///
    /// # Errors
    ///
    /// - `IvUpdateTooSoon` if the minimum interval has not elapsed
    /// - `IvIndexExhausted` if the index cannot advance
    pub fn start(
        &mut self,
        now: I,
        config: &NetConfig,
        initiator: bool,
    ) -> Result<IvUpdateOutcome, NetError> {
        if self.in_progress {
            return Ok(IvUpdateOutcome::Unchanged);
        }
        if let Some(left) = self.remaining_interval(now, config) {
            return Err(NetError::IvUpdateTooSoon { remaining_secs: left.as_secs() });
        }
        let next = self.iv_index.checked_add(1).ok_or(NetError::IvIndexExhausted)?;

        self.iv_index = next;
        self.in_progress = true;
        self.initiator = initiator;
        self.pending_update = false;
        self.last_transition = now;
        self.old_iv_valid_until = None;

        info!(iv_index = next, initiator, "IV update started");
        Ok(IvUpdateOutcome::Started { iv_index: next })
    }

    /// Leave IV Update in progress, or defer while SDUs are in flight.
    pub fn complete(&mut self, now: I, config: &NetConfig) -> IvUpdateOutcome {
        if !self.in_progress {
            return IvUpdateOutcome::Unchanged;
        }
        if self.sdu_in_flight > 0 {
            if !self.pending_update {
                info!(sdu_in_flight = self.sdu_in_flight, "IV update completion deferred");
            }
            self.pending_update = true;
            return IvUpdateOutcome::Deferred;
        }

        self.in_progress = false;
        self.initiator = false;
        self.pending_update = false;
        self.last_transition = now;
        self.old_iv_valid_until = Some(now + config.old_iv_grace);

        info!(iv_index = self.iv_index, "IV update completed");
        IvUpdateOutcome::Completed { iv_index: self.iv_index }
    }

    /// Leave IV Update in progress even while SDUs are in flight.
    ///
    /// Used when the maximum duration expires. SDUs still in flight are
    /// forgotten; their completion callbacks no longer gate anything.
    pub fn force_complete(&mut self, now: I, config: &NetConfig) -> IvUpdateOutcome {
        if self.sdu_in_flight > 0 {
            warn!(sdu_in_flight = self.sdu_in_flight, "Abandoning SDUs blocking IV update");
            self.sdu_in_flight = 0;
        }
        self.complete(now, config)
    }

    /// Note that an SDU depending on the current index is being sent.
    pub fn begin_sdu(&mut self) {
        self.sdu_in_flight += 1;
    }

    /// Note that an SDU finished, resuming a deferred completion.
    pub fn end_sdu(&mut self, now: I, config: &NetConfig) -> IvUpdateOutcome {
        self.sdu_in_flight = self.sdu_in_flight.saturating_sub(1);
        if self.pending_update && self.sdu_in_flight == 0 {
            return self.complete(now, config);
        }
        IvUpdateOutcome::Unchanged
    }

    /// Process the IV Index and IV Update flag of an authenticated beacon.
    ///
    /// # Errors
    ///
    /// - `IvIndexMismatch` if the observed index cannot be reconciled: a
    ///   different index while in progress, an index behind ours, or one
    ///   more than the recovery limit ahead
    pub fn on_beacon(
        &mut self,
        iv_index: u32,
        iv_update: bool,
        now: I,
        config: &NetConfig,
    ) -> Result<IvUpdateOutcome, NetError> {
        let mismatch = NetError::IvIndexMismatch { local: self.iv_index, observed: iv_index };

        if self.in_progress {
            if iv_index != self.iv_index {
                return Err(mismatch);
            }
            if iv_update {
                return Ok(IvUpdateOutcome::Unchanged);
            }
            if self.remaining_interval(now, config).is_some() {
                warn!(iv_index, "Ignoring IV update completion before minimum duration");
                return Ok(IvUpdateOutcome::Unchanged);
            }
            return Ok(self.complete(now, config));
        }

        if iv_index == self.iv_index {
            return Ok(IvUpdateOutcome::Unchanged);
        }
        if iv_index < self.iv_index || iv_index - self.iv_index > IV_RECOVERY_LIMIT {
            return Err(mismatch);
        }
        if iv_index > self.iv_index + 1 {
            return Ok(self.recover(iv_index, iv_update, now));
        }
        if !iv_update {
            warn!(iv_index, "Ignoring new IV index in normal mode");
            return Ok(IvUpdateOutcome::Unchanged);
        }
        if self.remaining_interval(now, config).is_some() {
            warn!(iv_index, "Ignoring IV update before minimum interval");
            return Ok(IvUpdateOutcome::Unchanged);
        }

        self.start(now, config, false)
    }

    fn recover(&mut self, iv_index: u32, iv_update: bool, now: I) -> IvUpdateOutcome {
        warn!(from = self.iv_index, to = iv_index, iv_update, "IV index recovery");

        self.iv_index = iv_index;
        self.in_progress = iv_update;
        self.initiator = false;
        self.pending_update = false;
        self.last_transition = now;
        self.old_iv_valid_until = None;

        IvUpdateOutcome::Recovered { iv_index, in_progress: iv_update }
    }
}
