//! Key Refresh procedure.
//!
//! # Phases
//!
//! ```text
//! Normal ──install candidate──► Phase1 ──beacon with new key / set_phase──► Phase2
//!   ▲                             │                                           │
//!   │                             └────────────── commit ─────────┬───────────┘
//!   │                                                             ▼
//!   └───────────────────────── old keys revoked ─────────────── Phase3
//! ```
//!
//! Phase 1 receives with both keys and transmits with the old one. Phase 2
//! transmits with the new key. Phase 3 only exists inside a commit: the
//! subnet, its application keys and its friendship credentials switch to the
//! new key under one write guard, and the subnet is back in Normal before the
//! guard is released.
//!
//! # Invariants
//!
//! - The candidate slot is populated exactly in Phase 1 and Phase 2
//! - Phases never move backwards; only a commit retires the old key
//! - Traffic can advance Phase 1 to Phase 2 but never commits

use meshnet_crypto::KEY_SIZE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{env::MonotonicInstant, error::NetError, keyring::Keyring};

/// Key Refresh phase of a subnet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum KeyRefreshPhase {
    /// No refresh in progress
    #[default]
    Normal,
    /// New key distributed; transmit with the old key
    Phase1,
    /// New key in use for transmission
    Phase2,
    /// Revoking the old key
    Phase3,
}

impl KeyRefreshPhase {
    /// Wire value used by configuration messages.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Phase1 => 1,
            Self::Phase2 => 2,
            Self::Phase3 => 3,
        }
    }

    /// Parse a wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Phase1),
            2 => Some(Self::Phase2),
            3 => Some(Self::Phase3),
            _ => None,
        }
    }

    /// Returns true in the phases that keep a candidate key.
    pub fn holds_candidate(self) -> bool {
        matches!(self, Self::Phase1 | Self::Phase2)
    }

    /// Validate an explicit phase change.
    ///
    /// Requesting the current phase is accepted and changes nothing.
    ///
    /// # Errors
    ///
    /// - `PhaseRegression` if `target` precedes the current phase
    /// - `InvalidPhaseTransition` if `target` skips ahead
    pub fn transition(self, target: Self) -> Result<Self, NetError> {
        use KeyRefreshPhase::{Normal, Phase1, Phase2, Phase3};

        match (self, target) {
            (from, to) if from == to => Ok(to),
            (Normal, Phase1) | (Phase1, Phase2) | (Phase1 | Phase2, Phase3) | (Phase3, Normal) => {
                Ok(target)
            },
            (from, to) if to < from => Err(NetError::PhaseRegression { from, to }),
            (from, to) => Err(NetError::InvalidPhaseTransition { from, to }),
        }
    }

    /// Phase after observing a secure network beacon.
    ///
    /// `new_key` is true when the beacon authenticated with the candidate
    /// key. Only Phase 1 reacts: the candidate is confirmed live on the
    /// network and transmission switches to it. The Key Refresh flag never
    /// moves a phase by itself.
    pub fn on_beacon(self, kr_flag: bool, new_key: bool) -> Self {
        match self {
            Self::Phase1 if new_key => {
                debug!(kr_flag, "Candidate key confirmed by beacon");
                Self::Phase2
            },
            phase => phase,
        }
    }
}

impl<I: MonotonicInstant> Keyring<I> {
    /// Begin a Key Refresh by installing the new NetKey (Normal → Phase 1).
    ///
    /// Installing the same key again while in Phase 1 succeeds without
    /// changes.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    /// - `AlreadyExists` if Phase 1 is running with a different key
    /// - `InvalidPhaseTransition` if the subnet is past Phase 1
    pub fn start_key_refresh(
        &mut self,
        net_idx: u16,
        net_key: &[u8; KEY_SIZE],
        iv_index: u32,
        iv_update: bool,
    ) -> Result<(), NetError> {
        let subnet = self.subnets.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;

        match subnet.phase() {
            KeyRefreshPhase::Normal => {},
            KeyRefreshPhase::Phase1 if subnet.candidate().is_some_and(|c| c.holds(net_key)) => {
                return Ok(());
            },
            KeyRefreshPhase::Phase1 => {
                return Err(NetError::AlreadyExists {
                    what: format!("key refresh on subnet {net_idx:#05x}"),
                });
            },
            phase => {
                return Err(NetError::InvalidPhaseTransition {
                    from: phase,
                    to: KeyRefreshPhase::Phase1,
                });
            },
        }

        subnet.install_candidate(net_key);
        subnet.set_phase(KeyRefreshPhase::Phase1);
        subnet.update_beacon_auth(iv_index, iv_update);
        self.friends.update_candidate(net_idx, net_key);

        info!(net_idx, "Key refresh started");
        Ok(())
    }

    /// Apply the Key Refresh state observed in a secure network beacon.
    ///
    /// Returns true if the phase changed.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    pub fn apply_key_refresh(
        &mut self,
        net_idx: u16,
        kr_flag: bool,
        new_key: bool,
        iv_index: u32,
        iv_update: bool,
    ) -> Result<bool, NetError> {
        let subnet = self.subnets.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        subnet.set_kr_flag(kr_flag);

        let current = subnet.phase();
        if current == KeyRefreshPhase::Normal && new_key {
            warn!(net_idx, "Beacon claims new key while no refresh is running");
            return Ok(false);
        }

        let next = current.on_beacon(kr_flag, new_key);
        if next == current {
            return Ok(false);
        }

        subnet.set_phase(next);
        subnet.update_beacon_auth(iv_index, iv_update);
        info!(net_idx, from = ?current, to = ?next, "Key refresh phase changed by beacon");
        Ok(true)
    }

    /// Move a subnet to an explicitly requested phase.
    ///
    /// Phase 3 commits. Returns true if the phase changed.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    /// - `PhaseRegression` for a backwards move
    /// - `InvalidPhaseTransition` for Phase 1 without a candidate key or a
    ///   skipped phase
    pub fn set_key_refresh_phase(
        &mut self,
        net_idx: u16,
        target: KeyRefreshPhase,
        iv_index: u32,
        iv_update: bool,
    ) -> Result<bool, NetError> {
        let subnet = self.subnets.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        let current = subnet.phase();
        let next = current.transition(target)?;

        if next == current {
            return Ok(false);
        }

        match next {
            KeyRefreshPhase::Phase2 => {
                subnet.set_phase(next);
                subnet.update_beacon_auth(iv_index, iv_update);
                info!(net_idx, "Key refresh phase 2");
                Ok(true)
            },
            KeyRefreshPhase::Phase3 => {
                self.commit_key_refresh(net_idx, iv_index, iv_update)?;
                Ok(true)
            },
            // Phase 1 needs key material; Normal is only reached by commit
            KeyRefreshPhase::Phase1 | KeyRefreshPhase::Normal => {
                Err(NetError::InvalidPhaseTransition { from: current, to: target })
            },
        }
    }

    /// Commit a Key Refresh (Phase 1 or Phase 2 → Phase 3 → Normal).
    ///
    /// Promotes the candidate NetKey, every updated application key bound
    /// to the subnet, and the subnet's friendship credentials, then
    /// recomputes the beacon authentication value. All checks happen before
    /// the first mutation.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    /// - `InvalidPhaseTransition` if no refresh is running
    pub fn commit_key_refresh(
        &mut self,
        net_idx: u16,
        iv_index: u32,
        iv_update: bool,
    ) -> Result<(), NetError> {
        let subnet = self.subnets.get(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        let from = subnet.phase();
        from.transition(KeyRefreshPhase::Phase3)?;

        let Some(candidate) = subnet.candidate() else {
            return Err(NetError::InvalidPhaseTransition { from, to: KeyRefreshPhase::Phase3 });
        };
        let committed = Zeroizing::new(*candidate.net_key());

        self.subnets.revoke_old_keys(net_idx, iv_index, iv_update)?;
        self.app_keys.commit(net_idx);
        self.friends.refresh(net_idx, &committed);

        info!(net_idx, ?from, "Key refresh committed");
        Ok(())
    }
}
