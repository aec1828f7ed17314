//! Mesh Network-Layer Core
//!
//! Stateful security core of a mesh network layer: subnet and application
//! key tables, the Key Refresh and IV Update procedures, replay protection,
//! friendship credentials and the network PDU codec.
//!
//! # Architecture
//!
//! Sans-IO and action based, like a session state machine: no clocks, no
//! sockets, no tasks. Callers pass `now` in and execute the returned
//! [`NetAction`]s. All shared state lives in [`MeshNet`], which is `Sync`
//! and can be driven from a receive path and a control path at once.
//!
//! ```text
//!   bearer ──pdu──► MeshNet::decode ──► (RxContext, transport PDU) ──► transport
//!   transport ──► MeshNet::send ──► NetAction::Transmit ──► bearer
//!   beacons ──► MeshNet::on_secure_beacon ──► IV Update / Key Refresh
//!   driver ──► MeshNet::tick ──► timeouts (IV Update, friend poll)
//! ```
//!
//! # Components
//!
//! - [`SubnetStore`], [`AppKeyStore`], [`FriendCredStore`]: fixed-capacity
//!   key tables, grouped in a [`Keyring`]
//! - [`KeyRefreshPhase`]: Key Refresh state and transition function
//! - [`IvState`]: IV Update state machine
//! - [`ReplayLedger`]: replay protection list
//! - [`RelayCache`]: duplicate suppression for relayed PDUs
//! - [`storage`]: snapshot persistence

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod app_key;
pub mod beacon;
pub mod codec;
pub mod config;
pub mod env;
pub mod error;
pub mod friend;
pub mod iv_update;
pub mod key_refresh;
pub mod keyring;
pub mod net;
pub mod relay_cache;
pub mod replay;
pub mod storage;
pub mod subnet;
pub mod timer;

pub use app_key::{AppKey, AppKeyStore, KeySlot};
pub use beacon::SecureBeacon;
pub use codec::{MessageContext, NetInterface, RxContext, TxContext};
pub use config::NetConfig;
pub use env::{Environment, MonotonicInstant};
pub use error::{ErrorKind, NetError};
pub use friend::{FriendCred, FriendCredStore, FriendRole, Friendship, LpnState};
pub use iv_update::{IvState, IvUpdateOutcome};
pub use key_refresh::KeyRefreshPhase;
pub use keyring::Keyring;
pub use net::{MeshNet, NetAction, PRIMARY_NET_IDX, Received};
pub use relay_cache::RelayCache;
pub use replay::{ReplayEntry, ReplayLedger};
pub use storage::{MemoryStorage, NetSnapshot, Storage, StorageError};
pub use subnet::{NodeIdentity, Subnet, SubnetStore};
