//! All key material of a node, guarded as one unit.
//!
//! Subnets, application keys and friendship credentials change together
//! during a Key Refresh commit, so they live behind a single lock in
//! [`crate::MeshNet`]. A decode holding a read guard therefore sees either
//! the complete pre-commit or the complete post-commit key set.

use meshnet_crypto::{KEY_SIZE, TrafficKeys};

use crate::{
    app_key::{AppKeyStore, KeySlot},
    config::NetConfig,
    env::MonotonicInstant,
    error::NetError,
    friend::{FriendCredStore, Friendship},
    subnet::{Subnet, SubnetStore},
};

/// Traffic keys that may have protected a received PDU.
#[derive(Debug)]
pub struct RxCandidate<'a> {
    /// Subnet the keys belong to
    pub net_idx: u16,
    /// Keys come from the candidate slot
    pub new_key: bool,
    /// Keys are friendship credentials
    pub friend_cred: bool,
    /// The keys themselves
    pub keys: &'a TrafficKeys,
}

/// Subnets, application keys and friendship credentials.
#[derive(Debug)]
pub struct Keyring<I> {
    pub(crate) subnets: SubnetStore<I>,
    pub(crate) app_keys: AppKeyStore,
    pub(crate) friends: FriendCredStore,
}

impl<I: MonotonicInstant> Keyring<I> {
    /// Create empty tables sized by `config`.
    pub fn new(config: &NetConfig) -> Self {
        Self {
            subnets: SubnetStore::new(config.subnet_capacity),
            app_keys: AppKeyStore::new(config.app_key_capacity),
            friends: FriendCredStore::new(config.friend_cred_capacity),
        }
    }

    /// Subnet table.
    pub fn subnets(&self) -> &SubnetStore<I> {
        &self.subnets
    }

    /// Application key table.
    pub fn app_keys(&self) -> &AppKeyStore {
        &self.app_keys
    }

    /// Friendship credential table.
    pub fn friends(&self) -> &FriendCredStore {
        &self.friends
    }

    /// Look up a subnet, failing if it is unknown.
    pub fn subnet(&self, net_idx: u16) -> Result<&Subnet<I>, NetError> {
        self.subnets.get(net_idx).ok_or(NetError::UnknownSubnet { net_idx })
    }

    /// Remove a subnet together with its application keys and friendship
    /// credentials. Returns the peers whose friendships ended.
    pub fn remove_subnet(&mut self, net_idx: u16) -> Result<Vec<u16>, NetError> {
        self.subnets.remove(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        self.app_keys.remove_subnet(net_idx);
        Ok(self.friends.clear(net_idx))
    }

    /// Install an application key into one slot.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the owning subnet does not exist
    /// - any error of [`AppKeyStore::install`]
    pub fn install_app_key(
        &mut self,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
        slot: KeySlot,
    ) -> Result<(), NetError> {
        let phase = self.subnet(net_idx)?.phase();
        self.app_keys.install(phase, net_idx, app_idx, key, slot)
    }

    /// Write a replacement application key during a Key Refresh.
    pub fn update_app_key(
        &mut self,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
    ) -> Result<(), NetError> {
        let phase = self.subnet(net_idx)?.phase();
        self.app_keys.update(phase, net_idx, app_idx, key)
    }

    /// Add friendship credentials.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    /// - `CapacityExceeded` if the credential table is full
    pub fn add_friend_cred(&mut self, friendship: Friendship) -> Result<(), NetError> {
        let subnet = self
            .subnets
            .get(friendship.net_idx)
            .ok_or(NetError::UnknownSubnet { net_idx: friendship.net_idx })?;
        self.friends.add(subnet, friendship).map(|_| ())
    }

    /// Keys for transmitting on `net_idx`.
    ///
    /// With `friend_dst` set, the friendship credentials for that
    /// destination are used instead of the master credentials.
    ///
    /// # Errors
    ///
    /// - `NoMatchingKey` if the subnet or the friendship is gone
    pub fn tx_keys(&self, net_idx: u16, friend_dst: Option<u16>) -> Result<&TrafficKeys, NetError> {
        let subnet = self.subnets.get(net_idx).ok_or(NetError::NoMatchingKey { net_idx })?;

        match friend_dst {
            None => Ok(subnet.tx_keys().traffic()),
            Some(dst) => self
                .friends
                .for_destination(net_idx, dst)
                .map(|cred| cred.tx_keys(subnet.phase()))
                .ok_or(NetError::NoMatchingKey { net_idx }),
        }
    }

    /// Every key set whose NID matches, across all subnets, both slots and
    /// all friendship credentials.
    pub fn rx_candidates(&self, nid: u8) -> Vec<RxCandidate<'_>> {
        let master = self.subnets.iter().flat_map(|subnet| {
            subnet.rx_keys().map(move |(slot, new_key)| RxCandidate {
                net_idx: subnet.net_idx(),
                new_key,
                friend_cred: false,
                keys: slot.traffic(),
            })
        });
        let friendship = self.friends.iter().flat_map(|cred| {
            cred.rx_keys().map(move |(keys, new_key)| RxCandidate {
                net_idx: cred.net_idx(),
                new_key,
                friend_cred: true,
                keys,
            })
        });

        master.chain(friendship).filter(|candidate| candidate.keys.nid() == nid).collect()
    }
}
