//! Network-layer orchestrator.
//!
//! [`MeshNet`] owns every shared resource of the network layer and is the
//! only type the bearer and transport layers talk to. It follows the action
//! pattern: methods take `now` and return [`NetAction`]s for the driver to
//! execute, so no I/O happens here.
//!
//! # Locking
//!
//! ```text
//! iv (RwLock) ─► keys (RwLock) ─► rpl (Mutex)
//!             ─► relay_cache (Mutex) ─► timers (Mutex) ─► lpn (Mutex)
//! ```
//!
//! Locks are always taken in this order. Decode and send hold `iv` and
//! `keys` for reading, so any number of them run in parallel while a Key
//! Refresh commit or IV Index change waits for exclusive access. The replay
//! check and the record of an accepted PDU happen under one `rpl` guard.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

use meshnet_crypto::{KEY_SIZE, MAX_NETWORK_PDU_SIZE, MIN_NETWORK_PDU_SIZE, NetworkHeader};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::{
    app_key::KeySlot,
    beacon::SecureBeacon,
    codec::{
        self, ADDR_UNASSIGNED, MessageContext, NetInterface, RxContext, TxContext, is_unicast,
    },
    config::{NetConfig, SEQ_MAX},
    env::MonotonicInstant,
    error::NetError,
    friend::{FriendRole, Friendship, LpnState},
    iv_update::{IvState, IvUpdateOutcome},
    key_refresh::KeyRefreshPhase,
    keyring::Keyring,
    relay_cache::{RelayCache, msg_hash},
    replay::{ReplayEntry, ReplayLedger},
    storage::{AppKeyRecord, NetSnapshot, Storage, SubnetRecord},
    subnet::NodeIdentity,
    timer::{TimerKey, TimerQueue},
};

/// NetKey index of the primary subnet
pub const PRIMARY_NET_IDX: u16 = 0x000;

/// Actions returned by [`MeshNet`] for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAction {
    /// Hand this network PDU to the bearer
    Transmit {
        /// Interface to send on
        net_if: NetInterface,
        /// Sequence number carried by the PDU
        seq: u32,
        /// Wire bytes
        pdu: Vec<u8>,
    },
    /// IV Update in progress was entered
    IvUpdateStarted {
        /// New stored IV Index
        iv_index: u32,
    },
    /// IV Update completed; transmissions use the new index
    IvUpdateCompleted {
        /// Current IV Index
        iv_index: u32,
    },
    /// IV Update completion waits for in-flight SDUs
    IvUpdateDeferred,
    /// IV Index Recovery jumped to a newer index
    IvIndexRecovered {
        /// New stored IV Index
        iv_index: u32,
        /// Network still in IV Update in progress
        in_progress: bool,
    },
    /// Friendship credentials were dropped
    FriendshipLost {
        /// Subnet of the friendship
        net_idx: u16,
        /// Peer address
        peer: u16,
    },
    /// The subnet's secure beacon content changed and should be resent
    BeaconChanged {
        /// NetKey index
        net_idx: u16,
    },
}

/// A received PDU that passed every network-layer check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// What the decoder learned about the PDU
    pub rx: RxContext,
    /// Transport PDU for the layer above
    pub transport: Vec<u8>,
    /// Relayed copy to hand to the bearer, if any
    pub relay: Option<NetAction>,
}

/// Network layer of one node.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug)]
pub struct MeshNet<I = Instant> {
    config: NetConfig,
    iv: RwLock<IvState<I>>,
    keys: RwLock<Keyring<I>>,
    rpl: Mutex<ReplayLedger>,
    relay_cache: Mutex<RelayCache<I>>,
    timers: Mutex<TimerQueue<I>>,
    /// Next sequence number to use
    seq: AtomicU32,
    lpn: Mutex<LpnState>,
}

impl<I: MonotonicInstant> MeshNet<I> {
    /// Create a freshly provisioned network layer with no subnets.
    pub fn new(config: NetConfig, iv_index: u32, now: I) -> Self {
        Self::with_iv_state(config, IvState::new(iv_index, false, now), 0)
    }

    fn with_iv_state(config: NetConfig, iv: IvState<I>, seq: u32) -> Self {
        Self {
            keys: RwLock::new(Keyring::new(&config)),
            rpl: Mutex::new(ReplayLedger::new(config.replay_capacity)),
            relay_cache: Mutex::new(RelayCache::new(
                config.relay_cache_capacity,
                config.relay_cache_window,
            )),
            timers: Mutex::new(TimerQueue::new()),
            iv: RwLock::new(iv),
            seq: AtomicU32::new(seq),
            lpn: Mutex::new(LpnState::default()),
            config,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Stored IV Index and whether IV Update is in progress.
    pub fn iv_index(&self) -> (u32, bool) {
        let iv = self.iv.read();
        (iv.iv_index(), iv.in_progress())
    }

    /// IV Index used for transmission.
    pub fn tx_iv_index(&self) -> u32 {
        self.iv.read().tx_iv_index()
    }

    /// Next sequence number that will be used.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Replay ledger entry for a source address.
    pub fn replay_entry(&self, src: u16) -> Option<ReplayEntry> {
        self.rpl.lock().get(src).copied()
    }

    /// Run `f` with read access to all key material.
    pub fn with_keyring<R>(&self, f: impl FnOnce(&Keyring<I>) -> R) -> R {
        f(&self.keys.read())
    }

    /// Earliest pending timer deadline. The driver calls [`Self::tick`]
    /// when it passes.
    pub fn next_deadline(&self) -> Option<I> {
        self.timers.lock().next_deadline()
    }

    // Subnets

    /// Add a subnet.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if `net_idx` is already in use
    /// - `CapacityExceeded` if the subnet table is full
    pub fn create_subnet(&self, net_idx: u16, net_key: &[u8; KEY_SIZE]) -> Result<(), NetError> {
        let iv = self.iv.read();
        let mut keys = self.keys.write();
        keys.subnets.create(net_idx, net_key, iv.iv_index(), iv.in_progress()).map(|_| ())
    }

    /// Remove a subnet with its application keys and friendships.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    pub fn remove_subnet(&self, net_idx: u16) -> Result<Vec<NetAction>, NetError> {
        let mut keys = self.keys.write();
        let lost: Vec<(u16, FriendRole)> = keys
            .friends
            .iter()
            .filter(|cred| cred.net_idx() == net_idx)
            .map(|cred| (cred.peer(), cred.friendship().role))
            .collect();
        keys.remove_subnet(net_idx)?;
        drop(keys);

        Ok(lost.into_iter().map(|(peer, role)| self.friendship_lost(net_idx, peer, role)).collect())
    }

    /// Start or stop Node Identity advertising on a subnet.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    pub fn set_node_identity(&self, net_idx: u16, running: bool) -> Result<NodeIdentity, NetError> {
        let mut keys = self.keys.write();
        let subnet = keys.subnets.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        subnet.set_node_identity(running);
        Ok(subnet.node_identity())
    }

    // Application keys

    /// Install an application key into one slot.
    pub fn install_app_key(
        &self,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
        slot: KeySlot,
    ) -> Result<(), NetError> {
        self.keys.write().install_app_key(net_idx, app_idx, key, slot)
    }

    /// Write a replacement application key during a Key Refresh.
    pub fn update_app_key(
        &self,
        net_idx: u16,
        app_idx: u16,
        key: &[u8; KEY_SIZE],
    ) -> Result<(), NetError> {
        self.keys.write().update_app_key(net_idx, app_idx, key)
    }

    /// Delete an application key.
    pub fn remove_app_key(&self, net_idx: u16, app_idx: u16) -> Result<(), NetError> {
        self.keys.write().app_keys.remove(net_idx, app_idx)
    }

    // Key Refresh

    /// Install a new NetKey and enter Phase 1.
    pub fn start_key_refresh(
        &self,
        net_idx: u16,
        net_key: &[u8; KEY_SIZE],
    ) -> Result<(), NetError> {
        let iv = self.iv.read();
        self.keys.write().start_key_refresh(net_idx, net_key, iv.iv_index(), iv.in_progress())
    }

    /// Move a subnet to an explicitly requested Key Refresh phase.
    ///
    /// # Errors
    ///
    /// See [`Keyring::set_key_refresh_phase`].
    pub fn set_key_refresh_phase(
        &self,
        net_idx: u16,
        phase: KeyRefreshPhase,
    ) -> Result<Vec<NetAction>, NetError> {
        let iv = self.iv.read();
        let changed = self.keys.write().set_key_refresh_phase(
            net_idx,
            phase,
            iv.iv_index(),
            iv.in_progress(),
        )?;
        Ok(if changed { vec![NetAction::BeaconChanged { net_idx }] } else { Vec::new() })
    }

    /// Commit a running Key Refresh.
    ///
    /// # Errors
    ///
    /// See [`Keyring::commit_key_refresh`].
    pub fn commit_key_refresh(&self, net_idx: u16) -> Result<Vec<NetAction>, NetError> {
        let iv = self.iv.read();
        self.keys.write().commit_key_refresh(net_idx, iv.iv_index(), iv.in_progress())?;
        Ok(vec![NetAction::BeaconChanged { net_idx }])
    }

    /// Key Refresh phase of a subnet.
    pub fn key_refresh_phase(&self, net_idx: u16) -> Result<KeyRefreshPhase, NetError> {
        self.keys.read().subnet(net_idx).map(|subnet| subnet.phase())
    }

    // Beacons

    /// Process an authenticated-looking secure network beacon.
    ///
    /// IV Index state is handled before Key Refresh state, and an IV Index
    /// that cannot be reconciled rejects the whole beacon. Only the primary
    /// subnet drives IV Update when the node is a member of it.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailed` if no subnet key authenticates the beacon
    /// - `IvIndexMismatch` if the beacon's IV Index cannot be applied
    pub fn on_secure_beacon(
        &self,
        beacon: &SecureBeacon,
        now: I,
    ) -> Result<Vec<NetAction>, NetError> {
        let mut iv = self.iv.write();
        let mut keys = self.keys.write();

        let Some((net_idx, new_key)) = keys.subnets.find_by_network_id(
            &beacon.network_id,
            beacon.flags,
            beacon.iv_index,
            &beacon.auth,
        ) else {
            debug!(iv_index = beacon.iv_index, "Secure beacon matches no subnet");
            return Err(NetError::AuthenticationFailed);
        };
        if let Some(subnet) = keys.subnets.get_mut(net_idx) {
            subnet.observe_beacon();
        }

        let drives_iv = net_idx == PRIMARY_NET_IDX || keys.subnets.get(PRIMARY_NET_IDX).is_none();
        let outcome = if drives_iv {
            iv.on_beacon(beacon.iv_index, beacon.iv_update(), now, &self.config)
                .inspect_err(|err| warn!(net_idx, %err, "Rejecting secure beacon"))?
        } else {
            trace!(net_idx, "Ignoring IV state of secondary subnet beacon");
            IvUpdateOutcome::Unchanged
        };

        let kr_changed = keys.apply_key_refresh(
            net_idx,
            beacon.key_refresh(),
            new_key,
            iv.iv_index(),
            iv.in_progress(),
        )?;

        let mut actions = self.apply_iv_outcome(&iv, &mut keys, outcome, now);
        let announced = actions.contains(&NetAction::BeaconChanged { net_idx });
        if kr_changed && !announced {
            actions.push(NetAction::BeaconChanged { net_idx });
        }
        Ok(actions)
    }

    /// Build this node's secure network beacon for a subnet and record it
    /// as sent.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    pub fn secure_beacon(&self, net_idx: u16, now: I) -> Result<SecureBeacon, NetError> {
        let iv = self.iv.read();
        let mut keys = self.keys.write();
        let subnet = keys.subnets.get_mut(net_idx).ok_or(NetError::UnknownSubnet { net_idx })?;
        subnet.record_beacon_sent(now);

        Ok(SecureBeacon {
            flags: subnet.beacon_flags(iv.in_progress()),
            network_id: *subnet.beacon_network_id(),
            iv_index: iv.iv_index(),
            auth: *subnet.beacon_auth(),
        })
    }

    /// Close the beacon observation window of every subnet.
    pub fn rotate_beacon_windows(&self) {
        for subnet in self.keys.write().subnets.iter_mut() {
            subnet.rotate_beacon_window();
        }
    }

    // IV Update

    /// Initiate an IV Update.
    ///
    /// # Errors
    ///
    /// - `IvUpdateTooSoon` if the minimum interval has not elapsed
    /// - `IvIndexExhausted` if the IV Index cannot advance
    pub fn start_iv_update(&self, now: I) -> Result<Vec<NetAction>, NetError> {
        let mut iv = self.iv.write();
        let outcome = iv.start(now, &self.config, true)?;
        let mut keys = self.keys.write();
        Ok(self.apply_iv_outcome(&iv, &mut keys, outcome, now))
    }

    /// Finish a running IV Update, or defer while SDUs are in flight.
    pub fn complete_iv_update(&self, now: I) -> Vec<NetAction> {
        let mut iv = self.iv.write();
        let outcome = iv.complete(now, &self.config);
        let mut keys = self.keys.write();
        self.apply_iv_outcome(&iv, &mut keys, outcome, now)
    }

    /// Note that a segmented SDU depending on the current IV Index started.
    pub fn begin_sdu(&self) {
        self.iv.write().begin_sdu();
    }

    /// Transmission completion callback for an SDU started with
    /// [`Self::begin_sdu`]. Resumes a deferred IV Update completion.
    pub fn end_sdu(&self, now: I) -> Vec<NetAction> {
        let mut iv = self.iv.write();
        let outcome = iv.end_sdu(now, &self.config);
        let mut keys = self.keys.write();
        self.apply_iv_outcome(&iv, &mut keys, outcome, now)
    }

    fn apply_iv_outcome(
        &self,
        iv: &IvState<I>,
        keys: &mut Keyring<I>,
        outcome: IvUpdateOutcome,
        now: I,
    ) -> Vec<NetAction> {
        let action = match outcome {
            IvUpdateOutcome::Unchanged => return Vec::new(),
            IvUpdateOutcome::Deferred => return vec![NetAction::IvUpdateDeferred],
            IvUpdateOutcome::Started { iv_index } => {
                self.rpl.lock().reset_for_iv_update();
                self.timers.lock().schedule(
                    TimerKey::IvUpdateTimeout,
                    now + self.config.iv_update_max_duration,
                );
                NetAction::IvUpdateStarted { iv_index }
            },
            IvUpdateOutcome::Completed { iv_index } => {
                self.seq.store(0, Ordering::Release);
                self.timers.lock().cancel(TimerKey::IvUpdateTimeout);
                NetAction::IvUpdateCompleted { iv_index }
            },
            IvUpdateOutcome::Recovered { iv_index, in_progress } => {
                self.rpl.lock().clear();
                self.relay_cache.lock().clear();
                self.seq.store(0, Ordering::Release);
                let mut timers = self.timers.lock();
                if in_progress {
                    timers.schedule(
                        TimerKey::IvUpdateTimeout,
                        now + self.config.iv_update_max_duration,
                    );
                } else {
                    timers.cancel(TimerKey::IvUpdateTimeout);
                }
                NetAction::IvIndexRecovered { iv_index, in_progress }
            },
        };

        keys.subnets.update_beacons(iv.iv_index(), iv.in_progress());
        let beacons = keys
            .subnets
            .iter()
            .map(|subnet| NetAction::BeaconChanged { net_idx: subnet.net_idx() });
        std::iter::once(action).chain(beacons).collect()
    }

    // Network PDUs

    /// Encode and queue a transport PDU.
    ///
    /// Destinations owned by this node go out on the local interface. Once
    /// the sequence number passes the configured limit an IV Update is
    /// started, if the minimum interval allows it.
    ///
    /// # Errors
    ///
    /// - `Malformed` or `PayloadTooLarge` if the PDU cannot be encoded
    /// - `NoMatchingKey` if the subnet or friendship is gone
    /// - `SequenceExhausted` if the sequence number space is used up
    pub fn send(&self, tx: &TxContext, payload: &[u8], now: I) -> Result<Vec<NetAction>, NetError> {
        let net_if =
            if self.config.is_local(tx.ctx.addr) { NetInterface::Local } else { NetInterface::Adv };
        let (transmit, seq) = self.encode_with(tx, payload, net_if)?;
        let mut actions = vec![transmit];

        if seq >= self.config.iv_update_seq_limit && !self.iv.read().in_progress() {
            match self.start_iv_update(now) {
                Ok(started) => actions.extend(started),
                Err(err) => debug!(seq, %err, "Sequence limit reached, IV update not started"),
            }
        }
        Ok(actions)
    }

    /// Encode a proxy configuration message (proxy nonce, TTL 0, unassigned
    /// destination).
    pub fn encode_proxy_config(
        &self,
        net_idx: u16,
        payload: &[u8],
    ) -> Result<Vec<NetAction>, NetError> {
        let tx = TxContext {
            ctx: MessageContext { net_idx, app_idx: None, addr: ADDR_UNASSIGNED, ttl: Some(0) },
            src: self.config.primary_address,
            friend_cred: false,
        };
        let (transmit, _) = self.encode_with(&tx, payload, NetInterface::ProxyCfg)?;
        Ok(vec![transmit])
    }

    fn encode_with(
        &self,
        tx: &TxContext,
        payload: &[u8],
        net_if: NetInterface,
    ) -> Result<(NetAction, u32), NetError> {
        let kind = net_if.nonce_kind();
        codec::check_payload(tx, payload, kind)?;

        let iv = self.iv.read();
        let keys = self.keys.read();
        keys.tx_keys(tx.ctx.net_idx, tx.friend_cred.then_some(tx.ctx.addr))?;

        let seq = self.next_seq()?;
        let header = codec::tx_header(tx, self.config.default_ttl, seq);
        let pdu = codec::encode_pdu(&*keys, tx, &header, iv.tx_iv_index(), payload, kind)?;

        trace!(net_idx = tx.ctx.net_idx, src = tx.src, seq, ?net_if, "Encoded network PDU");
        Ok((NetAction::Transmit { net_if, seq, pdu }, seq))
    }

    fn next_seq(&self) -> Result<u32, NetError> {
        self.seq
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| {
                (seq <= SEQ_MAX).then_some(seq + 1)
            })
            .map_err(|_| {
                error!("Sequence number space exhausted");
                NetError::SequenceExhausted
            })
    }

    /// Authenticate, decrypt and replay-check a received network PDU.
    ///
    /// Every failure drops only this PDU.
    ///
    /// # Errors
    ///
    /// - `Malformed` for a bad length or address fields
    /// - `ReplayDetected` for a relayed duplicate, our own echo, or a PDU that
    ///   does not advance the replay ledger
    /// - `StaleIvIndex` for the previous IV Index outside IV Update or its
    ///   grace period
    /// - `AuthenticationFailed` if no key validates the NetMIC
    pub fn decode(
        &self,
        pdu: &[u8],
        net_if: NetInterface,
        rssi: i8,
        now: I,
    ) -> Result<(RxContext, Vec<u8>), NetError> {
        self.decode_inner(pdu, net_if, rssi, now)
            .inspect_err(|err| debug!(?net_if, len = pdu.len(), %err, "Dropping network PDU"))
    }

    fn decode_inner(
        &self,
        pdu: &[u8],
        net_if: NetInterface,
        rssi: i8,
        now: I,
    ) -> Result<(RxContext, Vec<u8>), NetError> {
        if !(MIN_NETWORK_PDU_SIZE..=MAX_NETWORK_PDU_SIZE).contains(&pdu.len()) {
            return Err(NetError::Malformed(format!("network PDU of {} bytes", pdu.len())));
        }

        let iv = self.iv.read();
        let (iv_index, old_iv) = iv.resolve_rx(pdu[0] >> 7);
        if old_iv && !iv.accepts_old_iv(now) {
            return Err(NetError::StaleIvIndex { iv_index, current: iv.iv_index() });
        }

        let keys = self.keys.read();
        let (found, header, transport) =
            codec::decode_pdu(&*keys, pdu, iv_index, net_if.nonce_kind())?;
        codec::validate_rx_header(&header, net_if)?;

        if matches!(net_if, NetInterface::Adv | NetInterface::Proxy)
            && self.config.is_local(header.src)
        {
            return Err(NetError::ReplayDetected { src: header.src, seq: header.seq });
        }

        let hash = msg_hash(iv_index, header.src, header.seq, header.dst);
        if net_if.uses_relay_cache() {
            if let Some((src, seq)) = self.relay_cache.lock().lookup(hash, now) {
                return Err(NetError::ReplayDetected { src, seq });
            }
        }

        self.rpl.lock().check_and_record(header.src, header.seq, old_iv)?;
        if net_if.uses_relay_cache() {
            self.relay_cache.lock().insert(hash, header.src, header.seq, now);
        }

        let rx = RxContext {
            net_idx: found.net_idx,
            src: header.src,
            dst: header.dst,
            seq: header.seq,
            ttl: header.ttl,
            ctl: header.ctl,
            old_iv,
            new_key: found.new_key,
            friend_cred: found.friend_cred,
            net_if,
            rssi,
            hash,
        };
        trace!(net_idx = rx.net_idx, src = rx.src, seq = rx.seq, old_iv, "Accepted network PDU");
        Ok((rx, transport))
    }

    /// Decode a received PDU and, with the Relay feature enabled, prepare
    /// the copy to retransmit.
    ///
    /// A PDU is relayed when it arrived over the air or from a proxy client,
    /// its TTL is at least 2, and it is not addressed to one of this node's
    /// elements. The copy carries TTL - 1 and goes out on the advertising
    /// bearer. A copy that cannot be encoded is logged and skipped; the
    /// received PDU is still returned.
    ///
    /// # Errors
    ///
    /// See [`Self::decode`].
    pub fn receive(
        &self,
        pdu: &[u8],
        net_if: NetInterface,
        rssi: i8,
        now: I,
    ) -> Result<Received, NetError> {
        let (rx, transport) = self.decode(pdu, net_if, rssi, now)?;
        let relay = self.relay(&rx, &transport).unwrap_or_else(|err| {
            warn!(net_idx = rx.net_idx, src = rx.src, seq = rx.seq, %err, "Relay failed");
            None
        });
        Ok(Received { rx, transport, relay })
    }

    fn relay(&self, rx: &RxContext, transport: &[u8]) -> Result<Option<NetAction>, NetError> {
        if !self.config.relay || !rx.net_if.uses_relay_cache() || rx.ttl < 2 {
            return Ok(None);
        }
        if is_unicast(rx.dst) && self.config.is_local(rx.dst) {
            return Ok(None);
        }

        let iv = self.iv.read();
        let keys = self.keys.read();
        let header =
            NetworkHeader { ctl: rx.ctl, ttl: rx.ttl - 1, seq: rx.seq, src: rx.src, dst: rx.dst };
        let iv_index = iv.iv_index().wrapping_sub(u32::from(rx.old_iv));
        let pdu = codec::encode_relay(&*keys, rx.net_idx, &header, iv_index, transport)?;

        trace!(net_idx = rx.net_idx, src = rx.src, seq = rx.seq, ttl = header.ttl, "Relaying PDU");
        Ok(Some(NetAction::Transmit { net_if: NetInterface::Adv, seq: rx.seq, pdu }))
    }

    // Friendship

    /// Add friendship credentials and arm the poll timeout.
    ///
    /// # Errors
    ///
    /// - `UnknownSubnet` if the subnet does not exist
    /// - `CapacityExceeded` if the credential table is full
    pub fn add_friend_cred(&self, friendship: Friendship, now: I) -> Result<(), NetError> {
        let mut keys = self.keys.write();
        keys.add_friend_cred(friendship)?;
        self.timers.lock().schedule(
            TimerKey::FriendPoll { net_idx: friendship.net_idx, peer: friendship.peer },
            now + self.config.friend_poll_timeout,
        );
        Ok(())
    }

    /// Note a poll exchange with a friend, re-arming its timeout. Returns
    /// false if no such friendship exists.
    pub fn friend_poll(&self, net_idx: u16, peer: u16, now: I) -> bool {
        let keys = self.keys.read();
        if keys.friends.get(net_idx, peer).is_none() {
            return false;
        }
        let deadline = now + self.config.friend_poll_timeout;
        self.timers.lock().schedule(TimerKey::FriendPoll { net_idx, peer }, deadline);
        true
    }

    /// Drop friendship credentials. Returns true if they existed.
    pub fn remove_friend_cred(&self, net_idx: u16, peer: u16) -> bool {
        let mut keys = self.keys.write();
        let removed = keys.friends.remove(net_idx, peer);
        self.timers.lock().cancel(TimerKey::FriendPoll { net_idx, peer });
        removed
    }

    /// Low Power Node state.
    pub fn lpn_state(&self) -> LpnState {
        *self.lpn.lock()
    }

    /// Move the Low Power Node state machine.
    ///
    /// Leaving an established friendship drops every credential this node
    /// holds as a Low Power Node.
    ///
    /// # Errors
    ///
    /// - `InvalidLpnTransition` if the move is not allowed
    pub fn set_lpn_state(&self, next: LpnState) -> Result<Vec<NetAction>, NetError> {
        let mut keys = self.keys.write();
        let mut timers = self.timers.lock();
        let mut lpn = self.lpn.lock();

        let current = *lpn;
        if current == next {
            return Ok(Vec::new());
        }
        if !current.can_transition_to(next) {
            return Err(NetError::InvalidLpnTransition { from: current.name(), to: next.name() });
        }
        *lpn = next;
        debug!(from = %current, to = %next, "LPN state changed");

        if !current.is_established() || next.is_established() {
            return Ok(Vec::new());
        }
        let lost: Vec<(u16, u16)> = keys
            .friends
            .iter()
            .filter(|cred| cred.friendship().role == FriendRole::LowPower)
            .map(|cred| (cred.net_idx(), cred.peer()))
            .collect();

        Ok(lost
            .into_iter()
            .map(|(net_idx, peer)| {
                keys.friends.remove(net_idx, peer);
                timers.cancel(TimerKey::FriendPoll { net_idx, peer });
                info!(net_idx, peer, "Friendship ended");
                NetAction::FriendshipLost { net_idx, peer }
            })
            .collect())
    }

    fn friendship_lost(&self, net_idx: u16, peer: u16, role: FriendRole) -> NetAction {
        self.timers.lock().cancel(TimerKey::FriendPoll { net_idx, peer });
        if role == FriendRole::LowPower {
            let mut lpn = self.lpn.lock();
            if lpn.is_established() {
                *lpn = LpnState::Enabled;
            }
        }
        info!(net_idx, peer, ?role, "Friendship lost");
        NetAction::FriendshipLost { net_idx, peer }
    }

    // Timers

    /// Fire every timer due at `now`. Late or duplicate firing is harmless.
    pub fn tick(&self, now: I) -> Vec<NetAction> {
        let expired = self.timers.lock().pop_expired(now);
        let mut actions = Vec::new();

        for key in expired {
            match key {
                TimerKey::IvUpdateTimeout => {
                    let mut iv = self.iv.write();
                    if iv.in_progress() {
                        warn!(iv_index = iv.iv_index(), "IV update timed out, forcing completion");
                    }
                    let outcome = iv.force_complete(now, &self.config);
                    let mut keys = self.keys.write();
                    actions.extend(self.apply_iv_outcome(&iv, &mut keys, outcome, now));
                },
                TimerKey::FriendPoll { net_idx, peer } => {
                    let mut keys = self.keys.write();
                    let Some(role) = keys.friends.get(net_idx, peer).map(|c| c.friendship().role)
                    else {
                        continue;
                    };
                    keys.friends.remove(net_idx, peer);
                    drop(keys);
                    actions.push(self.friendship_lost(net_idx, peer, role));
                },
            }
        }
        actions
    }

    // Persistence

    /// Capture everything that must survive a restart.
    pub fn snapshot(&self) -> NetSnapshot {
        let iv = self.iv.read();
        let keys = self.keys.read();
        let replay = self.rpl.lock().entries();

        NetSnapshot {
            iv_index: iv.iv_index(),
            iv_update: iv.in_progress(),
            seq: self.seq.load(Ordering::Acquire),
            subnets: keys
                .subnets
                .iter()
                .map(|subnet| SubnetRecord {
                    net_idx: subnet.net_idx(),
                    net_key: *subnet.active().net_key(),
                    candidate: subnet.candidate().map(|keys| *keys.net_key()),
                    phase: subnet.phase(),
                    kr_flag: subnet.kr_flag(),
                    node_identity: subnet.node_identity(),
                })
                .collect(),
            app_keys: keys
                .app_keys
                .iter()
                .map(|app| AppKeyRecord {
                    net_idx: app.net_idx(),
                    app_idx: app.app_idx(),
                    key: *app.active().key(),
                    candidate: app.candidate().map(|material| *material.key()),
                })
                .collect(),
            friendships: keys.friends.iter().map(|cred| *cred.friendship()).collect(),
            replay,
        }
    }

    /// Rebuild the network layer from a snapshot.
    ///
    /// Derived keys and beacon values are recomputed. Restoring counts as
    /// an IV Index transition, so the minimum interval starts again.
    ///
    /// # Errors
    ///
    /// - `Storage` if the snapshot is inconsistent
    /// - any error of the stores it is replayed into (for example
    ///   `CapacityExceeded` with a smaller configuration)
    pub fn restore(config: NetConfig, snapshot: &NetSnapshot, now: I) -> Result<Self, NetError> {
        if snapshot.seq > SEQ_MAX + 1 {
            let seq = snapshot.seq;
            return Err(NetError::Storage(format!("sequence number {seq:#x} out of range")));
        }
        let iv = IvState::new(snapshot.iv_index, snapshot.iv_update, now);
        let net = Self::with_iv_state(config, iv, snapshot.seq);
        let (iv_index, iv_update) = (snapshot.iv_index, snapshot.iv_update);

        {
            let mut keys = net.keys.write();

            // App keys go in while every subnet is still in Normal phase
            for record in &snapshot.subnets {
                if record.candidate.is_some() != record.phase.holds_candidate() {
                    return Err(NetError::Storage(format!(
                        "subnet {:#05x} in {:?} with candidate {}",
                        record.net_idx,
                        record.phase,
                        record.candidate.is_some()
                    )));
                }
                keys.subnets.create(record.net_idx, &record.net_key, iv_index, iv_update)?;
            }
            for record in &snapshot.app_keys {
                keys.install_app_key(record.net_idx, record.app_idx, &record.key, KeySlot::Active)?;
            }

            for record in &snapshot.subnets {
                if let Some(candidate) = &record.candidate {
                    keys.start_key_refresh(record.net_idx, candidate, iv_index, iv_update)?;
                    if record.phase == KeyRefreshPhase::Phase2 {
                        keys.set_key_refresh_phase(
                            record.net_idx,
                            KeyRefreshPhase::Phase2,
                            iv_index,
                            iv_update,
                        )?;
                    }
                }
                if let Some(subnet) = keys.subnets.get_mut(record.net_idx) {
                    subnet.set_kr_flag(record.kr_flag);
                    subnet.set_node_identity(record.node_identity == NodeIdentity::Running);
                }
            }
            for record in &snapshot.app_keys {
                if let Some(candidate) = &record.candidate {
                    keys.update_app_key(record.net_idx, record.app_idx, candidate)?;
                }
            }

            let mut timers = net.timers.lock();
            for friendship in &snapshot.friendships {
                keys.add_friend_cred(*friendship)?;
                timers.schedule(
                    TimerKey::FriendPoll { net_idx: friendship.net_idx, peer: friendship.peer },
                    now + net.config.friend_poll_timeout,
                );
            }
            if iv_update {
                timers.schedule(TimerKey::IvUpdateTimeout, now + net.config.iv_update_max_duration);
            }
        }

        *net.rpl.lock() = ReplayLedger::from_entries(net.config.replay_capacity, &snapshot.replay);

        info!(
            iv_index,
            iv_update,
            seq = snapshot.seq,
            subnets = snapshot.subnets.len(),
            app_keys = snapshot.app_keys.len(),
            replay = snapshot.replay.len(),
            "Network state restored"
        );
        Ok(net)
    }

    /// Save a snapshot to `storage`.
    pub fn persist(&self, storage: &impl Storage) -> Result<(), NetError> {
        storage.save_snapshot(&self.snapshot())?;
        Ok(())
    }

    /// Restore from `storage`. `None` if nothing was saved.
    pub fn load(
        config: NetConfig,
        storage: &impl Storage,
        now: I,
    ) -> Result<Option<Self>, NetError> {
        storage.load_snapshot()?.map(|snapshot| Self::restore(config, &snapshot, now)).transpose()
    }
}
