//! Network-layer configuration.
//!
//! Table capacities are fixed at construction; none of the stores grow past
//! them. Timing values follow the Mesh Profile defaults and can be shortened
//! for tests.

use std::time::Duration;

/// Default number of subnets a node can be a member of
pub const DEFAULT_SUBNET_CAPACITY: usize = 4;

/// Default number of application keys
pub const DEFAULT_APP_KEY_CAPACITY: usize = 8;

/// Default number of friendship credentials
pub const DEFAULT_FRIEND_CRED_CAPACITY: usize = 4;

/// Default number of replay protection entries
pub const DEFAULT_REPLAY_CAPACITY: usize = 64;

/// Default number of relay cache entries
pub const DEFAULT_RELAY_CACHE_CAPACITY: usize = 32;

/// Minimum time between two IV Index transitions (96 hours)
pub const IV_UPDATE_MIN_INTERVAL: Duration = Duration::from_secs(96 * 60 * 60);

/// Longest time a node stays in IV Update in progress (144 hours)
pub const IV_UPDATE_MAX_DURATION: Duration = Duration::from_secs(144 * 60 * 60);

/// Sequence number beyond which the node initiates an IV Update itself
pub const IV_UPDATE_SEQ_LIMIT: u32 = 8_000_000;

/// Largest 24-bit sequence number
pub const SEQ_MAX: u32 = 0x00FF_FFFF;

/// Largest IV Index jump that is applied as IV Index Recovery
pub const IV_RECOVERY_LIMIT: u32 = 42;

/// Configuration for a [`crate::MeshNet`] instance.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Primary unicast address of this node
    pub primary_address: u16,
    /// Number of elements (consecutive unicast addresses)
    pub element_count: u8,
    /// Subnet table capacity
    pub subnet_capacity: usize,
    /// Application key table capacity
    pub app_key_capacity: usize,
    /// Friendship credential table capacity
    pub friend_cred_capacity: usize,
    /// Replay protection list capacity
    pub replay_capacity: usize,
    /// Relay cache capacity
    pub relay_cache_capacity: usize,
    /// How long a message stays in the relay cache
    pub relay_cache_window: Duration,
    /// Retransmit PDUs addressed to other nodes (Relay feature)
    pub relay: bool,
    /// Minimum interval between IV Index transitions
    pub iv_update_min_interval: Duration,
    /// Forced completion deadline for IV Update in progress
    pub iv_update_max_duration: Duration,
    /// How long PDUs under the previous IV Index are still accepted after an
    /// update completes
    pub old_iv_grace: Duration,
    /// Sequence number that triggers a self-initiated IV Update
    pub iv_update_seq_limit: u32,
    /// TTL used when the caller does not pick one
    pub default_ttl: u8,
    /// Poll timeout after which a friendship is considered lost
    pub friend_poll_timeout: Duration,
}

impl NetConfig {
    /// Configuration for a node with the given primary address.
    pub fn new(primary_address: u16) -> Self {
        Self { primary_address, ..Self::default() }
    }

    /// Returns true if `addr` is one of this node's element addresses.
    pub fn is_local(&self, addr: u16) -> bool {
        let first = u32::from(self.primary_address);
        let addr = u32::from(addr);
        addr >= first && addr < first + u32::from(self.element_count)
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            primary_address: 0x0001,
            element_count: 1,
            subnet_capacity: DEFAULT_SUBNET_CAPACITY,
            app_key_capacity: DEFAULT_APP_KEY_CAPACITY,
            friend_cred_capacity: DEFAULT_FRIEND_CRED_CAPACITY,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            relay_cache_capacity: DEFAULT_RELAY_CACHE_CAPACITY,
            relay_cache_window: Duration::from_secs(10),
            relay: false,
            iv_update_min_interval: IV_UPDATE_MIN_INTERVAL,
            iv_update_max_duration: IV_UPDATE_MAX_DURATION,
            old_iv_grace: IV_UPDATE_MIN_INTERVAL,
            iv_update_seq_limit: IV_UPDATE_SEQ_LIMIT,
            default_ttl: 7,
            friend_poll_timeout: Duration::from_secs(10),
        }
    }
}
