//! Subnet store: the NetKeys this node is a member of.
//!
//! Each subnet holds an active key slot and, while a Key Refresh is running,
//! a candidate slot with the replacement NetKey. Both slots keep the NetKey
//! itself next to everything derived from it, so a slot can always be
//! re-derived and persisted from the 16 key bytes alone.

use meshnet_crypto::{
    BEACON_AUTH_SIZE, KEY_SIZE, NETWORK_ID_SIZE, NetKeys, TrafficKeys, beacon_auth,
    derive_net_keys, verify_beacon_auth,
};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::{env::MonotonicInstant, error::NetError, key_refresh::KeyRefreshPhase};

/// Beacon flag: Key Refresh Phase 2 in progress
pub const BEACON_FLAG_KEY_REFRESH: u8 = 0x01;

/// Beacon flag: IV Update in progress
pub const BEACON_FLAG_IV_UPDATE: u8 = 0x02;

/// A NetKey together with every key derived from it.
#[derive(Clone)]
pub struct SubnetKeys {
    net_key: [u8; KEY_SIZE],
    keys: NetKeys,
}

impl SubnetKeys {
    /// Derive a key slot from a NetKey.
    pub fn new(net_key: &[u8; KEY_SIZE]) -> Self {
        Self { net_key: *net_key, keys: derive_net_keys(net_key) }
    }

    /// The root NetKey.
    pub fn net_key(&self) -> &[u8; KEY_SIZE] {
        &self.net_key
    }

    /// Keys derived from the NetKey.
    pub fn keys(&self) -> &NetKeys {
        &self.keys
    }

    /// Master credentials.
    pub fn traffic(&self) -> &TrafficKeys {
        self.keys.traffic()
    }

    /// Returns true if this slot holds `net_key`.
    pub fn holds(&self, net_key: &[u8; KEY_SIZE]) -> bool {
        self.net_key.ct_eq(net_key).into()
    }
}

impl std::fmt::Debug for SubnetKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubnetKeys").field("keys", &self.keys).finish_non_exhaustive()
    }
}

impl Drop for SubnetKeys {
    fn drop(&mut self) {
        self.net_key.zeroize();
    }
}

/// Proxy Node Identity advertising state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NodeIdentity {
    /// Not advertising
    Stopped,
    /// Advertising with the IdentityKey
    Running,
    /// Node has no proxy support
    NotSupported,
}

/// Secure network beacon bookkeeping for one subnet.
#[derive(Debug, Clone)]
pub struct BeaconStats<I> {
    /// Beacons observed during the previous observation window
    pub last_window: u8,
    /// Beacons observed during the current observation window
    pub current_window: u8,
    /// When this node last sent a beacon for the subnet
    pub last_sent: Option<I>,
}

impl<I> Default for BeaconStats<I> {
    fn default() -> Self {
        Self { last_window: 0, current_window: 0, last_sent: None }
    }
}

/// A subnet the node is a member of.
#[derive(Debug)]
pub struct Subnet<I> {
    net_idx: u16,
    active: SubnetKeys,
    candidate: Option<SubnetKeys>,
    phase: KeyRefreshPhase,
    kr_flag: bool,
    node_identity: NodeIdentity,
    beacon: BeaconStats<I>,
    auth: [u8; BEACON_AUTH_SIZE],
}

impl<I: MonotonicInstant> Subnet<I> {
    fn new(net_idx: u16, net_key: &[u8; KEY_SIZE], iv_index: u32, iv_update: bool) -> Self {
        let active = SubnetKeys::new(net_key);
        let node_identity = if active.keys().identity_key().is_some() {
            NodeIdentity::Stopped
        } else {
            NodeIdentity::NotSupported
        };

        let mut subnet = Self {
            net_idx,
            active,
            candidate: None,
            phase: KeyRefreshPhase::Normal,
            kr_flag: false,
            node_identity,
            beacon: BeaconStats::default(),
            auth: [0u8; BEACON_AUTH_SIZE],
        };
        subnet.update_beacon_auth(iv_index, iv_update);
        subnet
    }

    /// NetKey index.
    pub fn net_idx(&self) -> u16 {
        self.net_idx
    }

    /// Key Refresh phase.
    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Last Key Refresh flag observed in a beacon.
    pub fn kr_flag(&self) -> bool {
        self.kr_flag
    }

    /// Active (old) key slot.
    pub fn active(&self) -> &SubnetKeys {
        &self.active
    }

    /// Candidate (new) key slot, present only during Phase 1 and Phase 2.
    pub fn candidate(&self) -> Option<&SubnetKeys> {
        self.candidate.as_ref()
    }

    /// Keys used for transmission.
    ///
    /// Phase 2 transmits with the candidate; every other phase with the
    /// active slot.
    pub fn tx_keys(&self) -> &SubnetKeys {
        match (&self.candidate, self.phase) {
            (Some(candidate), KeyRefreshPhase::Phase2) => candidate,
            _ => &self.active,
        }
    }

    /// Keys accepted on receive, each tagged with whether it is the
    /// candidate slot.
    pub fn rx_keys(&self) -> impl Iterator<Item = (&SubnetKeys, bool)> {
        std::iter::once((&self.active, false))
            .chain(self.candidate.as_ref().map(|candidate| (candidate, true)))
    }

    /// Proxy Node Identity state.
    pub fn node_identity(&self) -> NodeIdentity {
        self.node_identity
    }

    /// Start or stop Node Identity advertising.
    ///
    /// Has no effect on nodes without proxy support.
    pub fn set_node_identity(&mut self, running: bool) {
        if self.node_identity == NodeIdentity::NotSupported {
            return;
        }
        self.node_identity = if running { NodeIdentity::Running } else { NodeIdentity::Stopped };
    }

    /// Flags advertised in this subnet's secure network beacon.
    pub fn beacon_flags(&self, iv_update: bool) -> u8 {
        let mut flags = 0;
        if self.phase == KeyRefreshPhase::Phase2 {
            flags |= BEACON_FLAG_KEY_REFRESH;
        }
        if iv_update {
            flags |= BEACON_FLAG_IV_UPDATE;
        }
        flags
    }

    /// Cached authentication value of our own beacon.
    pub fn beacon_auth(&self) -> &[u8; BEACON_AUTH_SIZE] {
        &self.auth
    }

    /// Network ID advertised in our own beacon.
    pub fn beacon_network_id(&self) -> &[u8; NETWORK_ID_SIZE] {
        self.tx_keys().keys().network_id()
    }

    /// Beacon counters.
    pub fn beacon_stats(&self) -> &BeaconStats<I> {
        &self.beacon
    }

    /// Count a beacon heard for this subnet.
    pub fn observe_beacon(&mut self) {
        self.beacon.current_window = self.beacon.current_window.saturating_add(1);
    }

    /// Close the current observation window.
    pub fn rotate_beacon_window(&mut self) {
        self.beacon.last_window = self.beacon.current_window;
        self.beacon.current_window = 0;
    }

    /// Remember that a beacon was just sent.
    pub fn record_beacon_sent(&mut self, now: I) {
        self.beacon.last_sent = Some(now);
    }

    /// Recompute the cached beacon authentication value.
    pub fn update_beacon_auth(&mut self, iv_index: u32, iv_update: bool) {
        let flags = self.beacon_flags(iv_update);
        let keys = self.tx_keys().keys();
        self.auth = beacon_auth(keys.beacon_key(), flags, keys.network_id(), iv_index);
    }

    pub(crate) fn set_phase(&mut self, phase: KeyRefreshPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_kr_flag(&mut self, kr_flag: bool) {
        self.kr_flag = kr_flag;
    }

    pub(crate) fn install_candidate(&mut self, net_key: &[u8; KEY_SIZE]) {
        self.candidate = Some(SubnetKeys::new(net_key));
    }

    /// Promote the candidate slot to active. The previous active keys are
    /// zeroized as they drop.
    pub(crate) fn promote_candidate(&mut self) {
        if let Some(candidate) = self.candidate.take() {
            self.active = candidate;
        }
    }
}

/// Fixed-capacity table of subnets.
#[derive(Debug)]
pub struct SubnetStore<I> {
    slots: Vec<Option<Subnet<I>>>,
}

impl<I: MonotonicInstant> SubnetStore<I> {
    /// Create an empty store with room for `capacity` subnets.
    pub fn new(capacity: usize) -> Self {
        Self { slots: (0..capacity).map(|_| None).collect() }
    }

    /// Maximum number of subnets.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of subnets in use.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns true if no subnet is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a subnet.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if `net_idx` is in use, whatever its NetKey
    /// - `CapacityExceeded` if every slot is taken
    pub fn create(
        &mut self,
        net_idx: u16,
        net_key: &[u8; KEY_SIZE],
        iv_index: u32,
        iv_update: bool,
    ) -> Result<&Subnet<I>, NetError> {
        if self.position(net_idx).is_some() {
            return Err(NetError::AlreadyExists { what: format!("subnet {net_idx:#05x}") });
        }
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            return Err(NetError::CapacityExceeded { table: "subnet", capacity: self.capacity() });
        };
        self.slots[free] = Some(Subnet::new(net_idx, net_key, iv_index, iv_update));
        info!(net_idx, "Subnet created");

        self.slots[free].as_ref().ok_or(NetError::UnknownSubnet { net_idx })
    }

    /// Remove a subnet. Its key material is zeroized.
    pub fn remove(&mut self, net_idx: u16) -> Option<Subnet<I>> {
        let removed = self.position(net_idx).and_then(|position| self.slots[position].take());
        if removed.is_some() {
            info!(net_idx, "Subnet removed");
        }
        removed
    }

    /// Look up a subnet.
    pub fn get(&self, net_idx: u16) -> Option<&Subnet<I>> {
        self.iter().find(|subnet| subnet.net_idx == net_idx)
    }

    /// Look up a subnet for modification.
    pub fn get_mut(&mut self, net_idx: u16) -> Option<&mut Subnet<I>> {
        self.iter_mut().find(|subnet| subnet.net_idx == net_idx)
    }

    /// Iterate over configured subnets.
    pub fn iter(&self) -> impl Iterator<Item = &Subnet<I>> {
        self.slots.iter().flatten()
    }

    /// Iterate mutably over configured subnets.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subnet<I>> {
        self.slots.iter_mut().flatten()
    }

    /// Find the subnet and key slot a received secure beacon belongs to.
    ///
    /// The candidate slot is tried before the active one. Returns the NetKey
    /// index and whether the candidate slot matched.
    pub fn find_by_network_id(
        &self,
        network_id: &[u8; NETWORK_ID_SIZE],
        flags: u8,
        iv_index: u32,
        auth: &[u8; BEACON_AUTH_SIZE],
    ) -> Option<(u16, bool)> {
        self.iter().find_map(|subnet| {
            let candidate = subnet.candidate.iter().map(|keys| (keys, true));
            let matched =
                candidate.chain(std::iter::once((&subnet.active, false))).find(|(keys, _)| {
                    let keys = keys.keys();
                    keys.network_id() == network_id
                        && verify_beacon_auth(keys.beacon_key(), flags, network_id, iv_index, auth)
                });
            matched.map(|(_, new_key)| (subnet.net_idx, new_key))
        })
    }

    /// Retire the old keys of a subnet whose Key Refresh completed.
    ///
    /// The candidate becomes the active slot, the phase returns to Normal
    /// and the beacon authentication value is recomputed.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if `net_idx` is not configured
    pub fn revoke_old_keys(
        &mut self,
        net_idx: u16,
        iv_index: u32,
        iv_update: bool,
    ) -> Result<(), NetError> {
        let subnet = self.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;

        subnet.promote_candidate();
        subnet.phase = KeyRefreshPhase::Normal;
        subnet.kr_flag = false;
        subnet.update_beacon_auth(iv_index, iv_update);

        debug!(net_idx, nid = subnet.active.keys().nid(), "Old subnet keys revoked");
        Ok(())
    }

    /// Recompute every cached beacon authentication value.
    pub fn update_beacons(&mut self, iv_index: u32, iv_update: bool) {
        for subnet in self.iter_mut() {
            subnet.update_beacon_auth(iv_index, iv_update);
        }
    }

    fn position(&self, net_idx: u16) -> Option<usize> {
        self.slots.iter().position(|slot| slot.as_ref().is_some_and(|s| s.net_idx == net_idx))
    }
}
