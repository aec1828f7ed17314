//! Friendship credentials and the Low Power Node state.
//!
//! A friendship derives its own traffic keys from the subnet NetKey, bound
//! to both peer addresses and both friendship counters. Like subnets, each
//! credential keeps an active and a candidate key set so that a Key Refresh
//! on the subnet carries friendship traffic through every phase.

use meshnet_crypto::{KEY_SIZE, TrafficKeys, derive_friend_keys};
use tracing::{debug, info};

use crate::{
    env::MonotonicInstant, error::NetError, key_refresh::KeyRefreshPhase, subnet::Subnet,
};

/// The role this node plays in a friendship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FriendRole {
    /// This node is the Low Power Node; the peer is its Friend
    LowPower,
    /// This node is the Friend; the peer is a Low Power Node
    Friend,
}

/// Parameters of an established friendship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Friendship {
    /// Subnet the friendship lives on
    pub net_idx: u16,
    /// Address of the peer node
    pub peer: u16,
    /// Address of this node in the friendship
    pub own_addr: u16,
    /// This node's role
    pub role: FriendRole,
    /// Counter chosen by the Low Power Node
    pub lpn_counter: u16,
    /// Counter chosen by the Friend
    pub friend_counter: u16,
}

impl Friendship {
    /// Address of the Low Power Node.
    pub fn lpn_addr(&self) -> u16 {
        match self.role {
            FriendRole::LowPower => self.own_addr,
            FriendRole::Friend => self.peer,
        }
    }

    /// Address of the Friend node.
    pub fn friend_addr(&self) -> u16 {
        match self.role {
            FriendRole::LowPower => self.peer,
            FriendRole::Friend => self.own_addr,
        }
    }

    /// Derive this friendship's traffic keys from a NetKey.
    pub fn derive(&self, net_key: &[u8; KEY_SIZE]) -> TrafficKeys {
        derive_friend_keys(
            net_key,
            self.lpn_addr(),
            self.friend_addr(),
            self.lpn_counter,
            self.friend_counter,
        )
    }
}

/// Friendship credential with per-slot traffic keys.
#[derive(Debug, Clone)]
pub struct FriendCred {
    friendship: Friendship,
    active: TrafficKeys,
    candidate: Option<TrafficKeys>,
}

impl FriendCred {
    /// Friendship parameters.
    pub fn friendship(&self) -> &Friendship {
        &self.friendship
    }

    /// Subnet index.
    pub fn net_idx(&self) -> u16 {
        self.friendship.net_idx
    }

    /// Peer address.
    pub fn peer(&self) -> u16 {
        self.friendship.peer
    }

    /// Keys derived from the subnet's active NetKey.
    pub fn active(&self) -> &TrafficKeys {
        &self.active
    }

    /// Keys derived from the subnet's candidate NetKey.
    pub fn candidate(&self) -> Option<&TrafficKeys> {
        self.candidate.as_ref()
    }

    /// Keys used for transmission in the given subnet phase.
    pub fn tx_keys(&self, phase: KeyRefreshPhase) -> &TrafficKeys {
        match (&self.candidate, phase) {
            (Some(candidate), KeyRefreshPhase::Phase2) => candidate,
            _ => &self.active,
        }
    }

    /// Keys accepted on receive, tagged with whether they are the candidate.
    pub fn rx_keys(&self) -> impl Iterator<Item = (&TrafficKeys, bool)> {
        std::iter::once((&self.active, false))
            .chain(self.candidate.as_ref().map(|candidate| (candidate, true)))
    }
}

/// Fixed-capacity table of friendship credentials.
#[derive(Debug)]
pub struct FriendCredStore {
    slots: Vec<Option<FriendCred>>,
}

impl FriendCredStore {
    /// Create an empty store with room for `capacity` credentials.
    pub fn new(capacity: usize) -> Self {
        Self { slots: vec![None; capacity] }
    }

    /// Maximum number of credentials.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Add a credential for a new friendship.
    ///
    /// A credential for the same subnet and peer is replaced, otherwise the
    /// first free slot is used. Keys are derived from every key slot the
    /// subnet currently holds.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if no slot is available
    pub fn add<I: MonotonicInstant>(
        &mut self,
        subnet: &Subnet<I>,
        friendship: Friendship,
    ) -> Result<&FriendCred, NetError> {
        let capacity = self.capacity();
        let slot = match self.position(friendship.net_idx, friendship.peer) {
            Some(position) => &mut self.slots[position],
            None => self
                .slots
                .iter_mut()
                .find(|slot| slot.is_none())
                .ok_or(NetError::CapacityExceeded { table: "friend credential", capacity })?,
        };

        let cred = FriendCred {
            friendship,
            active: friendship.derive(subnet.active().net_key()),
            candidate: subnet.candidate().map(|keys| friendship.derive(keys.net_key())),
        };
        info!(
            net_idx = friendship.net_idx,
            peer = friendship.peer,
            role = ?friendship.role,
            nid = cred.active.nid(),
            "Friend credentials added"
        );

        Ok(slot.insert(cred))
    }

    /// Derive candidate keys for every credential on `net_idx` from a new
    /// NetKey.
    pub fn update_candidate(&mut self, net_idx: u16, net_key: &[u8; KEY_SIZE]) {
        for cred in self.iter_mut().filter(|cred| cred.friendship.net_idx == net_idx) {
            cred.candidate = Some(cred.friendship.derive(net_key));
            debug!(net_idx, peer = cred.friendship.peer, "Friend credentials updated");
        }
    }

    /// Re-derive the active keys of every credential on `net_idx` from the
    /// committed NetKey and drop the candidate.
    pub fn refresh(&mut self, net_idx: u16, net_key: &[u8; KEY_SIZE]) {
        for cred in self.iter_mut().filter(|cred| cred.friendship.net_idx == net_idx) {
            cred.active = cred.friendship.derive(net_key);
            cred.candidate = None;
            debug!(net_idx, peer = cred.friendship.peer, "Friend credentials refreshed");
        }
    }

    /// Remove the credential for one friendship.
    pub fn remove(&mut self, net_idx: u16, peer: u16) -> bool {
        match self.position(net_idx, peer) {
            Some(position) => {
                self.slots[position] = None;
                info!(net_idx, peer, "Friend credentials removed");
                true
            },
            None => false,
        }
    }

    /// Remove every credential on `net_idx`. Returns the removed peers.
    pub fn clear(&mut self, net_idx: u16) -> Vec<u16> {
        let mut removed = Vec::new();
        for slot in &mut self.slots {
            if let Some(cred) = slot.take_if(|cred| cred.friendship.net_idx == net_idx) {
                removed.push(cred.friendship.peer);
            }
        }
        removed
    }

    /// Look up the credential for one friendship.
    pub fn get(&self, net_idx: u16, peer: u16) -> Option<&FriendCred> {
        self.iter().find(|cred| cred.friendship.net_idx == net_idx && cred.friendship.peer == peer)
    }

    /// Credential for transmitting to `dst` on `net_idx`.
    ///
    /// Falls back to any credential on the subnet, which covers a Low Power
    /// Node addressing group destinations through its single Friend.
    pub fn for_destination(&self, net_idx: u16, dst: u16) -> Option<&FriendCred> {
        self.get(net_idx, dst)
            .or_else(|| self.iter().find(|cred| cred.friendship.net_idx == net_idx))
    }

    /// Iterate over all credentials.
    pub fn iter(&self) -> impl Iterator<Item = &FriendCred> {
        self.slots.iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut FriendCred> {
        self.slots.iter_mut().flatten()
    }

    fn position(&self, net_idx: u16, peer: u16) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|cred| {
                cred.friendship.net_idx == net_idx && cred.friendship.peer == peer
            })
        })
    }
}

/// Low Power Node state.
///
/// ```text
/// Disabled ──► Clear ──► Enabled ──► WaitOffer ──► Establishing ──► Established
///                          ▲  ▲                         │              │   ▲
///                          │  └─────────────────────────┘              ▼   │
///                          │                                     RecvDelay │
///                          │                                           │   │
///                          └──────────── friendship lost ──────── WaitUpdate
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LpnState {
    /// Low power feature off
    #[default]
    Disabled,
    /// Sending Friend Clear to the previous Friend
    Clear,
    /// Looking for a Friend
    Enabled,
    /// Friend Request sent, collecting offers
    WaitOffer,
    /// Friend Poll sent, waiting for the first Friend Update
    Establishing,
    /// Friendship established, idle between polls
    Established,
    /// Poll sent, waiting out the receive delay
    RecvDelay,
    /// Receive window open, waiting for a response
    WaitUpdate,
}

impl LpnState {
    /// Human-readable state name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Clear => "clear",
            Self::Enabled => "enabled",
            Self::WaitOffer => "wait offer",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::RecvDelay => "recv delay",
            Self::WaitUpdate => "wait update",
        }
    }

    /// Returns true while a friendship is in place.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Established | Self::RecvDelay | Self::WaitUpdate)
    }

    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Disabling is always allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use LpnState::{
            Clear, Disabled, Enabled, Established, Establishing, RecvDelay, WaitOffer, WaitUpdate,
        };

        matches!(
            (self, next),
            (_, Disabled)
                | (Disabled, Clear | Enabled)
                | (Clear, Enabled)
                | (Enabled, WaitOffer)
                | (WaitOffer, Establishing | Enabled)
                | (Establishing, Established | Enabled)
                | (Established, RecvDelay | Clear)
                | (RecvDelay, WaitUpdate)
                | (WaitUpdate, Established | Enabled)
        )
    }
}

impl std::fmt::Display for LpnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::subnet::SubnetStore;

    const LPN: u16 = 0x0010;
    const FRIEND: u16 = 0x0020;

    fn friendship(role: FriendRole) -> Friendship {
        let (own_addr, peer) = match role {
            FriendRole::LowPower => (LPN, FRIEND),
            FriendRole::Friend => (FRIEND, LPN),
        };
        Friendship { net_idx: 0, peer, own_addr, role, lpn_counter: 1, friend_counter: 2 }
    }

    fn subnets() -> SubnetStore<Instant> {
        let mut subnets = SubnetStore::new(1);
        subnets.create(0, &[0x44; KEY_SIZE], 0, false).unwrap();
        subnets
    }

    #[test]
    fn both_roles_derive_identical_keys() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut lpn_side = FriendCredStore::new(1);
        let mut friend_side = FriendCredStore::new(1);

        let a = lpn_side.add(subnet, friendship(FriendRole::LowPower)).unwrap().active().clone();
        let b = friend_side.add(subnet, friendship(FriendRole::Friend)).unwrap().active().clone();

        assert_eq!(a, b);
        assert_ne!(&a, subnet.active().traffic());
    }

    #[test]
    fn add_replaces_same_peer() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut store = FriendCredStore::new(1);
        store.add(subnet, friendship(FriendRole::LowPower)).unwrap();

        let mut renewed = friendship(FriendRole::LowPower);
        renewed.lpn_counter = 9;
        store.add(subnet, renewed).unwrap();

        assert_eq!(store.iter().count(), 1);
        assert_eq!(store.get(0, FRIEND).unwrap().friendship().lpn_counter, 9);
    }

    #[test]
    fn add_fails_when_full() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut store = FriendCredStore::new(1);
        store.add(subnet, friendship(FriendRole::LowPower)).unwrap();

        let mut other = friendship(FriendRole::LowPower);
        other.peer = 0x0030;
        let result = store.add(subnet, other);
        assert!(matches!(result, Err(NetError::CapacityExceeded { .. })));
    }

    #[test]
    fn update_then_refresh_follows_key_refresh() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut store = FriendCredStore::new(1);
        let params = friendship(FriendRole::Friend);
        store.add(subnet, params).unwrap();
        let new_key = [0x55; KEY_SIZE];

        store.update_candidate(0, &new_key);
        let cred = store.get(0, LPN).unwrap();
        assert_eq!(cred.candidate(), Some(&params.derive(&new_key)));
        assert_eq!(cred.tx_keys(KeyRefreshPhase::Phase1), cred.active());
        assert_eq!(cred.tx_keys(KeyRefreshPhase::Phase2), &params.derive(&new_key));
        assert_eq!(cred.rx_keys().count(), 2);

        store.refresh(0, &new_key);
        let cred = store.get(0, LPN).unwrap();
        assert_eq!(cred.active(), &params.derive(&new_key));
        assert!(cred.candidate().is_none());
    }

    #[test]
    fn clear_removes_subnet_credentials() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut store = FriendCredStore::new(2);
        store.add(subnet, friendship(FriendRole::Friend)).unwrap();

        assert_eq!(store.clear(0), vec![LPN]);
        assert!(store.get(0, LPN).is_none());
        assert!(!store.remove(0, LPN));
    }

    #[test]
    fn for_destination_falls_back_to_subnet() {
        let subnets = subnets();
        let subnet = subnets.get(0).unwrap();
        let mut store = FriendCredStore::new(2);
        store.add(subnet, friendship(FriendRole::LowPower)).unwrap();

        assert!(store.for_destination(0, FRIEND).is_some());
        assert!(store.for_destination(0, 0xC000).is_some());
        assert!(store.for_destination(1, FRIEND).is_none());
    }

    #[test]
    fn lpn_cycle() {
        let cycle = [
            LpnState::Disabled,
            LpnState::Enabled,
            LpnState::WaitOffer,
            LpnState::Establishing,
            LpnState::Established,
            LpnState::RecvDelay,
            LpnState::WaitUpdate,
            LpnState::Established,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(LpnState::WaitUpdate.can_transition_to(LpnState::Enabled));
        assert!(!LpnState::Disabled.can_transition_to(LpnState::Established));
        assert!(!LpnState::Enabled.can_transition_to(LpnState::RecvDelay));
        assert!(LpnState::RecvDelay.is_established());
        assert!(!LpnState::Establishing.is_established());
    }
}
