//! Node runtime.
//!
//! Wraps the sans-IO [`MeshNet`] with an [`Environment`] and a [`Storage`]
//! backend, executes the actions it returns and persists state after every
//! change that must survive a restart.
//!
//! Saves are serialized and each one snapshots the network layer under the
//! save lock, so the last write to storage always holds the newest state.

use std::time::Duration;

use meshnet_core::{
    Environment, MeshNet, NetAction, NetConfig, NetInterface, PRIMARY_NET_IDX, RxContext,
    SecureBeacon, Storage, TxContext,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;

/// Provisioning data used when storage holds no snapshot.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Network-layer configuration
    pub net: NetConfig,
    /// NetKey of the primary subnet
    pub net_key: [u8; 16],
    /// IV Index at provisioning time
    pub iv_index: u32,
    /// AppKey index stamped on outgoing access messages
    pub app_idx: u16,
}

/// Frames handed to the bearer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Network PDU
    Network(Vec<u8>),
    /// Secure network beacon
    Beacon(Vec<u8>),
}

/// Message delivered to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// What the network layer learned about the PDU
    pub rx: RxContext,
    /// Transport PDU
    pub payload: Vec<u8>,
    /// Relayed copy for the bearer
    pub relay: Vec<Outbound>,
}

/// One mesh node: network layer, clock and durable state.
pub struct Node<E: Environment, S: Storage> {
    env: E,
    storage: S,
    net: MeshNet<E::Instant>,
    app_idx: u16,
    save_lock: Mutex<()>,
}

impl<E: Environment, S: Storage> Node<E, S> {
    /// Restore the node from `storage`, or provision it from `config` if
    /// nothing was saved yet.
    ///
    /// # Errors
    ///
    /// - `Storage` if the snapshot cannot be read or is inconsistent
    /// - `Net` if provisioning fails
    pub fn open(env: E, storage: S, config: NodeConfig) -> Result<Self, NodeError> {
        let now = env.now();
        let addr = config.net.primary_address;

        let net = if let Some(net) = MeshNet::load(config.net.clone(), &storage, now)? {
            let (iv_index, iv_update) = net.iv_index();
            info!(addr, iv_index, iv_update, seq = net.seq(), "Node restored");
            net
        } else {
            let net = MeshNet::new(config.net, config.iv_index, now);
            net.create_subnet(PRIMARY_NET_IDX, &config.net_key)?;
            storage.save_snapshot(&net.snapshot())?;
            info!(addr, iv_index = config.iv_index, "Node provisioned");
            net
        };

        Ok(Self { env, storage, net, app_idx: config.app_idx, save_lock: Mutex::new(()) })
    }

    /// Primary unicast address.
    pub fn address(&self) -> u16 {
        self.net.config().primary_address
    }

    /// The network layer.
    pub fn net(&self) -> &MeshNet<E::Instant> {
        &self.net
    }

    /// Send an access message to `dst`.
    ///
    /// State is saved before the PDU is released so a restart never
    /// reuses its sequence number.
    ///
    /// # Errors
    ///
    /// - `Net` if the PDU cannot be encoded
    /// - `Storage` if the new sequence number cannot be saved
    pub fn send(&self, dst: u16, payload: &[u8]) -> Result<Vec<Outbound>, NodeError> {
        let tx = TxContext::new(PRIMARY_NET_IDX, Some(self.app_idx), self.address(), dst);
        let actions = self.net.send(&tx, payload, self.env.now())?;
        self.persist()?;
        Ok(self.execute(actions))
    }

    /// Process a network PDU from the bearer. Dropped PDUs return `None`.
    ///
    /// The updated replay list is saved before the message is handed over,
    /// so a restart cannot accept it a second time.
    ///
    /// # Errors
    ///
    /// - `Storage` if the replay list cannot be saved; the message is
    ///   withheld
    pub fn receive(&self, pdu: &[u8], rssi: i8) -> Result<Option<Delivered>, NodeError> {
        self.receive_on(pdu, NetInterface::Adv, rssi)
    }

    fn receive_on(
        &self,
        pdu: &[u8],
        net_if: NetInterface,
        rssi: i8,
    ) -> Result<Option<Delivered>, NodeError> {
        let Ok(received) = self.net.receive(pdu, net_if, rssi, self.env.now()) else {
            return Ok(None);
        };
        self.persist()?;

        let relay = self.execute(received.relay.into_iter().collect());
        Ok(Some(Delivered { rx: received.rx, payload: received.transport, relay }))
    }

    /// Current secure network beacon of the primary subnet.
    ///
    /// # Errors
    ///
    /// - `Net` if the primary subnet is gone
    pub fn beacon(&self) -> Result<Outbound, NodeError> {
        let beacon = self.net.secure_beacon(PRIMARY_NET_IDX, self.env.now())?;
        Ok(Outbound::Beacon(beacon.to_bytes().to_vec()))
    }

    /// Process a secure network beacon from the bearer.
    ///
    /// # Errors
    ///
    /// - `Net` if the beacon is malformed, unauthenticated or carries an
    ///   unreconcilable IV Index
    pub fn receive_beacon(&self, bytes: &[u8]) -> Result<Vec<Outbound>, NodeError> {
        let beacon = SecureBeacon::parse(bytes)?;
        let actions = self.net.on_secure_beacon(&beacon, self.env.now())?;
        Ok(self.execute(actions))
    }

    /// Fire due timers.
    pub fn tick(&self) -> Vec<Outbound> {
        let actions = self.net.tick(self.env.now());
        self.execute(actions)
    }

    /// Sleep until the next network-layer deadline, at most `max`.
    pub async fn sleep_until_due(&self, max: Duration) {
        let wait = self
            .net
            .next_deadline()
            .map_or(max, |deadline| (deadline - self.env.now()).min(max));
        self.env.sleep(wait).await;
    }

    fn execute(&self, actions: Vec<NetAction>) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let mut changed = false;

        for action in actions {
            match action {
                NetAction::Transmit { net_if: NetInterface::Local, seq, pdu } => {
                    debug!(seq, "Looping back PDU to own element");
                    match self.receive_on(&pdu, NetInterface::Local, 0) {
                        Ok(Some(delivered)) => log_delivered(&delivered),
                        Ok(None) => {},
                        Err(err) => error!(seq, %err, "Local message withheld"),
                    }
                },
                NetAction::Transmit { pdu, .. } => outbound.push(Outbound::Network(pdu)),
                NetAction::BeaconChanged { net_idx } => {
                    changed = true;
                    match self.net.secure_beacon(net_idx, self.env.now()) {
                        Ok(beacon) => outbound.push(Outbound::Beacon(beacon.to_bytes().to_vec())),
                        Err(err) => debug!(net_idx, %err, "No beacon for subnet"),
                    }
                },
                NetAction::IvUpdateStarted { iv_index } => {
                    changed = true;
                    info!(iv_index, "IV update in progress");
                },
                NetAction::IvUpdateCompleted { iv_index } => {
                    changed = true;
                    info!(iv_index, "IV update complete");
                },
                NetAction::IvUpdateDeferred => debug!("IV update waiting for SDUs"),
                NetAction::IvIndexRecovered { iv_index, in_progress } => {
                    changed = true;
                    warn!(iv_index, in_progress, "IV index recovered");
                },
                NetAction::FriendshipLost { net_idx, peer } => {
                    changed = true;
                    info!(net_idx, peer, "Friendship lost");
                },
            }
        }

        if changed {
            if let Err(err) = self.persist() {
                error!(addr = self.address(), %err, "Failed to save network state");
            }
        }
        outbound
    }

    fn persist(&self) -> Result<(), NodeError> {
        let _guard = self.save_lock.lock();
        self.storage.save_snapshot(&self.net.snapshot())?;
        Ok(())
    }
}

/// Log a delivered message at info level.
pub fn log_delivered(delivered: &Delivered) {
    let rx = &delivered.rx;
    info!(
        src = rx.src,
        dst = rx.dst,
        seq = rx.seq,
        ttl = rx.ttl,
        rssi = rx.rssi,
        old_iv = rx.old_iv,
        payload = %hex::encode(&delivered.payload),
        "Message received"
    );
}
