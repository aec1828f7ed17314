//! Application key store.
//!
//! Every application key is bound to one subnet and follows that subnet's
//! Key Refresh procedure: a new key can only be written into the candidate
//! slot while the subnet is refreshing, and the active slot is locked for
//! the same period.

use meshnet_crypto::{KEY_SIZE, k4};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::{error::NetError, key_refresh::KeyRefreshPhase};

/// Which slot of a key pair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// Slot 0: the key currently in use
    Active,
    /// Slot 1: the replacement key during Key Refresh
    Candidate,
}

/// One application key and its AID.
#[derive(Clone)]
pub struct AppKeyMaterial {
    key: [u8; KEY_SIZE],
    aid: u8,
}

impl AppKeyMaterial {
    fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self { key: *key, aid: k4(key) }
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// 6-bit application key identifier.
    pub fn aid(&self) -> u8 {
        self.aid
    }

    fn holds(&self, key: &[u8; KEY_SIZE]) -> bool {
        self.key.ct_eq(key).into()
    }
}

impl std::fmt::Debug for AppKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppKeyMaterial").field("aid", &self.aid).finish_non_exhaustive()
    }
}

impl Drop for AppKeyMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// An application key bound to a subnet.
#[derive(Debug, Clone)]
pub struct AppKey {
    net_idx: u16,
    app_idx: u16,
    active: AppKeyMaterial,
    candidate: Option<AppKeyMaterial>,
}

impl AppKey {
    /// Index of the bound subnet.
    pub fn net_idx(&self) -> u16 {
        self.net_idx
    }

    /// AppKey index.
    pub fn app_idx(&self) -> u16 {
        self.app_idx
    }

    /// Key currently in use.
    pub fn active(&self) -> &AppKeyMaterial {
        &self.active
    }

    /// Replacement key, if one was written during the running Key Refresh.
    pub fn candidate(&self) -> Option<&AppKeyMaterial> {
        self.candidate.as_ref()
    }

    /// Returns true once a replacement key has been written.
    pub fn updated(&self) -> bool {
        self.candidate.is_some()
    }

    /// Key used for transmission in the given subnet phase.
    pub fn tx_key(&self, phase: KeyRefreshPhase) -> &AppKeyMaterial {
        match (&self.candidate, phase) {
            (Some(candidate), KeyRefreshPhase::Phase2) => candidate,
            _ => &self.active,
        }
    }
}

/// Fixed-capacity table of application keys.
#[derive(Debug)]
pub struct AppKeyStore {
    slots: Vec<Option<AppKey>>,
}

impl AppKeyStore {
    /// Create an empty store with room for `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity] }
    }

    /// Maximum number of application keys.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Install key material into one slot of an application key.
    ///
    /// `phase` is the current Key Refresh phase of the owning subnet.
    ///
    /// Writing the active slot creates the key. It is refused while the
    /// subnet is in Phase 1 or Phase 2. Writing the candidate slot requires
    /// a refresh in Phase 1 or Phase 2 and an existing key. Repeating a
    /// write with identical key material succeeds without changes.
    ///
    /// # Errors
    ///
    /// - `SlotLocked` if the active slot is written during a refresh
    /// - `NoRefreshInProgress` if the candidate slot is written outside one
    /// - `UnknownAppKey` if the candidate slot is written for a missing key
    /// - `AlreadyExists` if the slot already holds a different key
    /// - `CapacityExceeded` if a new key does not fit
    pub fn install(
        &mut self,
        phase: KeyRefreshPhase,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
        slot: KeySlot,
    ) -> Result<(), NetError> {
        let refreshing = phase.holds_candidate();

        match slot {
            KeySlot::Active => {
                if refreshing {
                    return Err(NetError::SlotLocked { net_idx });
                }
                if let Some(existing) = self.get(app_idx) {
                    if existing.net_idx == net_idx && existing.active.holds(key) {
                        return Ok(());
                    }
                    return Err(NetError::AlreadyExists { what: format!("app key {app_idx:#05x}") });
                }

                let capacity = self.capacity();
                let free = self
                    .slots
                    .iter_mut()
                    .find(|slot| slot.is_none())
                    .ok_or(NetError::CapacityExceeded { table: "app key", capacity })?;
                *free = Some(AppKey {
                    net_idx,
                    app_idx,
                    active: AppKeyMaterial::new(key),
                    candidate: None,
                });
                info!(net_idx, app_idx, "App key added");
                Ok(())
            },
            KeySlot::Candidate => {
                if !refreshing {
                    return Err(NetError::NoRefreshInProgress { net_idx });
                }
                let app = self
                    .get_mut(app_idx)
                    .filter(|app| app.net_idx == net_idx)
                    .ok_or(NetError::UnknownAppKey { net_idx, app_idx })?;

                match &app.candidate {
                    Some(candidate) if candidate.holds(key) => Ok(()),
                    Some(_) => {
                        Err(NetError::AlreadyExists { what: format!("app key {app_idx:#05x} update") })
                    },
                    None => {
                        app.candidate = Some(AppKeyMaterial::new(key));
                        info!(net_idx, app_idx, "App key updated");
                        Ok(())
                    },
                }
            },
        }
    }

    /// Write a replacement key (candidate slot).
    pub fn update(
        &mut self,
        phase: KeyRefreshPhase,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
    ) -> Result<(), NetError> {
        self.install(phase, net_idx, app_idx, key, KeySlot::Candidate)
    }

    /// Promote every updated key bound to `net_idx`.
    ///
    /// Keys without a replacement keep their active slot.
    pub fn commit(&mut self, net_idx: u16) {
        for app in self.iter_mut().filter(|app| app.net_idx == net_idx) {
            if let Some(candidate) = app.candidate.take() {
                app.active = candidate;
                debug!(net_idx, app_idx = app.app_idx, aid = app.active.aid, "App key committed");
            }
        }
    }

    /// Delete one application key.
    pub fn remove(&mut self, net_idx: u16, app_idx: u16) -> Result<(), NetError> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| {
                slot.as_ref().is_some_and(|app| app.app_idx == app_idx && app.net_idx == net_idx)
            })
            .ok_or(NetError::UnknownAppKey { net_idx, app_idx })?;
        *slot = None;
        info!(net_idx, app_idx, "App key deleted");
        Ok(())
    }

    /// Delete every application key bound to `net_idx`.
    pub fn remove_subnet(&mut self, net_idx: u16) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|app| app.net_idx == net_idx) {
                *slot = None;
            }
        }
    }

    /// Look up an application key.
    pub fn get(&self, app_idx: u16) -> Option<&AppKey> {
        self.iter().find(|app| app.app_idx == app_idx)
    }

    fn get_mut(&mut self, app_idx: u16) -> Option<&mut AppKey> {
        self.iter_mut().find(|app| app.app_idx == app_idx)
    }

    /// Iterate over installed keys.
    pub fn iter(&self) -> impl Iterator<Item = &AppKey> {
        self.slots.iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut AppKey> {
        self.slots.iter_mut().flatten()
    }
}
