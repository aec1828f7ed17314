//! Network PDU codec: per-packet contexts and key selection.
//!
//! The cryptographic transform lives in `meshnet-crypto`. This module picks
//! the keys: the transmit slot for the subnet's Key Refresh phase (or the
//! friendship credentials) on encode, and every NID match across subnets,
//! slots and friendships on decode.

use meshnet_crypto::{
    NetworkHeader, NonceKind, decrypt_network_pdu, encrypt_network_pdu, max_transport_pdu_size,
};
use tracing::trace;

use crate::{env::MonotonicInstant, error::NetError, keyring::Keyring};

/// Unassigned address
pub const ADDR_UNASSIGNED: u16 = 0x0000;

/// Largest TTL value (7 bits)
pub const TTL_MAX: u8 = 0x7F;

/// Returns true for unicast element addresses.
pub fn is_unicast(addr: u16) -> bool {
    addr != ADDR_UNASSIGNED && addr < 0x8000
}

/// Network interface a PDU arrived on or leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetInterface {
    /// Advertising bearer
    Adv,
    /// Local loopback between elements of this node
    Local,
    /// GATT proxy, network PDUs
    Proxy,
    /// GATT proxy, proxy configuration messages
    ProxyCfg,
}

impl NetInterface {
    /// Nonce construction used on this interface.
    pub fn nonce_kind(self) -> NonceKind {
        match self {
            Self::ProxyCfg => NonceKind::Proxy,
            Self::Adv | Self::Local | Self::Proxy => NonceKind::Network,
        }
    }

    /// Whether relayed duplicates can arrive on this interface.
    pub fn uses_relay_cache(self) -> bool {
        matches!(self, Self::Adv | Self::Proxy)
    }
}

/// Addressing of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Subnet to send on
    pub net_idx: u16,
    /// Application key index; `None` for network control messages
    pub app_idx: Option<u16>,
    /// Destination address
    pub addr: u16,
    /// TTL; `None` uses the configured default
    pub ttl: Option<u8>,
}

impl MessageContext {
    /// Returns true for network control messages (no application key).
    pub fn is_control(&self) -> bool {
        self.app_idx.is_none()
    }
}

/// Everything needed to encode one PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    /// Message addressing
    pub ctx: MessageContext,
    /// Source element address
    pub src: u16,
    /// Protect with friendship credentials instead of the master ones
    pub friend_cred: bool,
}

impl TxContext {
    /// Access message with master credentials.
    pub fn new(net_idx: u16, app_idx: Option<u16>, src: u16, dst: u16) -> Self {
        Self { ctx: MessageContext { net_idx, app_idx, addr: dst, ttl: None }, src, friend_cred: false }
    }
}

/// What the decoder learned about a received PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxContext {
    /// Subnet whose keys authenticated the PDU
    pub net_idx: u16,
    /// Source address
    pub src: u16,
    /// Destination address
    pub dst: u16,
    /// Sequence number
    pub seq: u32,
    /// Received TTL
    pub ttl: u8,
    /// Network control message
    pub ctl: bool,
    /// Protected with the previous IV Index
    pub old_iv: bool,
    /// Protected with the subnet's candidate key
    pub new_key: bool,
    /// Protected with friendship credentials
    pub friend_cred: bool,
    /// Interface the PDU arrived on
    pub net_if: NetInterface,
    /// Signal strength reported by the bearer
    pub rssi: i8,
    /// Relay cache hash of IV Index, source, sequence number and destination
    pub hash: u64,
}

/// Header fields of a PDU about to be encoded.
pub(crate) fn tx_header(tx: &TxContext, default_ttl: u8, seq: u32) -> NetworkHeader {
    let ttl = tx.ctx.ttl.unwrap_or(default_ttl);
    NetworkHeader { ctl: tx.ctx.is_control(), ttl, seq, src: tx.src, dst: tx.ctx.addr }
}

/// Reject PDUs that can never be encoded, before a sequence number is
/// spent on them.
///
/// Proxy configuration messages are addressed to the unassigned address.
pub(crate) fn check_payload(
    tx: &TxContext,
    payload: &[u8],
    kind: NonceKind,
) -> Result<(), NetError> {
    if payload.is_empty() {
        return Err(NetError::Malformed("empty transport PDU".to_string()));
    }
    let max = max_transport_pdu_size(tx.ctx.is_control());
    if payload.len() > max {
        return Err(NetError::PayloadTooLarge { len: payload.len(), max });
    }
    if !is_unicast(tx.src) {
        return Err(NetError::Malformed(format!("source {:#06x} is not unicast", tx.src)));
    }
    if tx.ctx.addr == ADDR_UNASSIGNED && kind != NonceKind::Proxy {
        return Err(NetError::Malformed("unassigned destination".to_string()));
    }
    if tx.ctx.ttl.is_some_and(|ttl| ttl > TTL_MAX) {
        return Err(NetError::Malformed("TTL exceeds 7 bits".to_string()));
    }
    Ok(())
}

/// Protect a transport PDU with the keys `tx` selects.
pub(crate) fn encode_pdu<I: MonotonicInstant>(
    keyring: &Keyring<I>,
    tx: &TxContext,
    header: &NetworkHeader,
    iv_index: u32,
    payload: &[u8],
    kind: NonceKind,
) -> Result<Vec<u8>, NetError> {
    let friend_dst = tx.friend_cred.then_some(tx.ctx.addr);
    let keys = keyring.tx_keys(tx.ctx.net_idx, friend_dst)?;

    Ok(encrypt_network_pdu(keys, header, iv_index, payload, kind)?)
}

/// Re-protect a received PDU for relaying.
///
/// The relayed copy always uses the subnet's master transmit keys for its
/// current Key Refresh phase, whichever credentials protected the original.
pub(crate) fn encode_relay<I: MonotonicInstant>(
    keyring: &Keyring<I>,
    net_idx: u16,
    header: &NetworkHeader,
    iv_index: u32,
    transport: &[u8],
) -> Result<Vec<u8>, NetError> {
    let keys = keyring.tx_keys(net_idx, None)?;

    Ok(encrypt_network_pdu(keys, header, iv_index, transport, NonceKind::Network)?)
}

/// The key set that authenticated a received PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyMatch {
    pub net_idx: u16,
    pub new_key: bool,
    pub friend_cred: bool,
}

/// Try every key set whose NID matches; the first valid NetMIC wins.
pub(crate) fn decode_pdu<I: MonotonicInstant>(
    keyring: &Keyring<I>,
    pdu: &[u8],
    iv_index: u32,
    kind: NonceKind,
) -> Result<(KeyMatch, NetworkHeader, Vec<u8>), NetError> {
    let nid = pdu.first().map(|byte| byte & 0x7F).ok_or_else(|| {
        NetError::Malformed("empty network PDU".to_string())
    })?;

    for candidate in keyring.rx_candidates(nid) {
        match decrypt_network_pdu(candidate.keys, pdu, iv_index, kind) {
            Ok((header, transport)) => {
                let found = KeyMatch {
                    net_idx: candidate.net_idx,
                    new_key: candidate.new_key,
                    friend_cred: candidate.friend_cred,
                };
                return Ok((found, header, transport));
            },
            Err(err) => {
                trace!(net_idx = candidate.net_idx, new_key = candidate.new_key, %err, "Candidate key rejected");
            },
        }
    }

    Err(NetError::AuthenticationFailed)
}

/// Reject decoded headers with addresses no sender may use.
pub(crate) fn validate_rx_header(
    header: &NetworkHeader,
    net_if: NetInterface,
) -> Result<(), NetError> {
    if !is_unicast(header.src) {
        return Err(NetError::Malformed(format!("source {:#06x} is not unicast", header.src)));
    }
    if header.dst == ADDR_UNASSIGNED && net_if != NetInterface::ProxyCfg {
        return Err(NetError::Malformed("unassigned destination".to_string()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use meshnet_crypto::KEY_SIZE;

    use super::*;
    use crate::{
        config::NetConfig,
        friend::{FriendRole, Friendship},
        key_refresh::KeyRefreshPhase,
    };

    fn keyring() -> Keyring<Instant> {
        let mut keyring = Keyring::new(&NetConfig::default());
        keyring.subnets.create(0, &[0x31; KEY_SIZE], 0, false).unwrap();
        keyring.subnets.create(1, &[0x32; KEY_SIZE], 0, false).unwrap();
        keyring
    }

    fn encode(keyring: &Keyring<Instant>, tx: &TxContext, seq: u32, payload: &[u8]) -> Vec<u8> {
        check_payload(tx, payload, NonceKind::Network).unwrap();
        let header = tx_header(tx, 5, seq);
        encode_pdu(keyring, tx, &header, 0, payload, NonceKind::Network).unwrap()
    }

    #[test]
    fn decode_finds_the_right_subnet() {
        let keyring = keyring();
        let tx = TxContext::new(1, Some(0), 0x0001, 0x0002);
        let pdu = encode(&keyring, &tx, 3, b"hello");

        let (found, header, payload) = decode_pdu(&keyring, &pdu, 0, NonceKind::Network).unwrap();
        assert_eq!(found, KeyMatch { net_idx: 1, new_key: false, friend_cred: false });
        assert_eq!(header.seq, 3);
        assert_eq!(header.ttl, 5);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn control_messages_use_long_mic() {
        let keyring = keyring();
        let access = encode(&keyring, &TxContext::new(0, Some(0), 1, 2), 1, b"x");
        let control = encode(&keyring, &TxContext::new(0, None, 1, 2), 1, b"x");

        assert_eq!(control.len(), access.len() + 4);
    }

    #[test]
    fn candidate_key_sets_new_key_flag() {
        let mut keyring = keyring();
        let subnet = keyring.subnets.get_mut(0).unwrap();
        subnet.install_candidate(&[0x41; KEY_SIZE]);
        subnet.set_phase(KeyRefreshPhase::Phase2);

        let pdu = encode(&keyring, &TxContext::new(0, Some(0), 1, 2), 1, b"new");
        let (found, _, _) = decode_pdu(&keyring, &pdu, 0, NonceKind::Network).unwrap();
        assert!(found.new_key);
    }

    #[test]
    fn friendship_credentials_roundtrip() {
        let mut keyring = keyring();
        keyring
            .add_friend_cred(Friendship {
                net_idx: 0,
                peer: 0x0002,
                own_addr: 0x0001,
                role: FriendRole::LowPower,
                lpn_counter: 4,
                friend_counter: 5,
            })
            .unwrap();
        let mut tx = TxContext::new(0, Some(0), 0x0001, 0x0002);
        tx.friend_cred = true;

        let pdu = encode(&keyring, &tx, 9, b"poll");
        let (found, _, payload) = decode_pdu(&keyring, &pdu, 0, NonceKind::Network).unwrap();
        assert!(found.friend_cred);
        assert_eq!(payload, b"poll");
    }

    #[test]
    fn unknown_keys_fail_authentication() {
        let keyring = keyring();
        let mut other = Keyring::<Instant>::new(&NetConfig::default());
        other.subnets.create(0, &[0x99; KEY_SIZE], 0, false).unwrap();
        let pdu = encode(&other, &TxContext::new(0, Some(0), 1, 2), 1, b"x");

        assert_eq!(
            decode_pdu(&keyring, &pdu, 0, NonceKind::Network).err(),
            Some(NetError::AuthenticationFailed)
        );
    }

    #[test]
    fn payload_checks_run_before_encoding() {
        let network = NonceKind::Network;
        let tx = TxContext::new(0, Some(0), 1, 2);
        assert!(matches!(check_payload(&tx, &[], network), Err(NetError::Malformed(_))));
        assert_eq!(
            check_payload(&tx, &[0u8; 17], network),
            Err(NetError::PayloadTooLarge { len: 17, max: 16 })
        );
        assert!(check_payload(&TxContext::new(0, Some(0), 0x8001, 2), b"x", network).is_err());

        let unassigned = TxContext::new(0, None, 1, ADDR_UNASSIGNED);
        assert!(check_payload(&unassigned, b"x", network).is_err());
        assert!(check_payload(&unassigned, b"x", NonceKind::Proxy).is_ok());
    }

    #[test]
    fn proxy_configuration_uses_proxy_nonce() {
        assert_eq!(NetInterface::ProxyCfg.nonce_kind(), NonceKind::Proxy);
        assert_eq!(NetInterface::Adv.nonce_kind(), NonceKind::Network);
        assert!(!NetInterface::Local.uses_relay_cache());
    }
}
