//! Network PDU protection using AES-CCM
//!
//! All functions are pure: the caller supplies the sequence number and the
//! IV Index. Reusing a (SEQ, SRC, IV Index) triple under the same key breaks
//! confidentiality, so sequence allocation lives with the caller.
//!
//! Wire layout:
//!
//! ```text
//! | IVI:1 NID:7 | CTL:1 TTL:7 | SEQ:24 | SRC:16 | DST:16 | TransportPDU | NetMIC |
//!               '--------- obfuscated --------'  '------- encrypted ------'
//! ```

use aes::Aes128;
use ccm::{
    Ccm,
    aead::{Aead, KeyInit, generic_array::GenericArray},
    consts::{U4, U8, U13},
};

use super::{
    derivation::{KEY_SIZE, TrafficKeys},
    error::CryptoError,
    obfuscation::{MIN_OBFUSCATION_LEN, obfuscate_header},
};

/// AES-CCM with a 32-bit NetMIC (access messages)
type NetCcm32 = Ccm<Aes128, U4, U13>;

/// AES-CCM with a 64-bit NetMIC (control messages)
type NetCcm64 = Ccm<Aes128, U8, U13>;

/// Size of the cleartext network header including DST (9 bytes)
pub const NETWORK_HEADER_SIZE: usize = 9;

/// Largest network PDU carried by a single advertising packet
pub const MAX_NETWORK_PDU_SIZE: usize = 29;

/// Smallest valid network PDU: header, one transport byte, 32-bit NetMIC
pub const MIN_NETWORK_PDU_SIZE: usize = MIN_OBFUSCATION_LEN;

/// Offset of the encrypted part (DST onwards)
const ENCRYPTED_START: usize = 7;

/// Nonce type octet for network nonces
const NETWORK_NONCE: u8 = 0x00;

/// Nonce type octet for proxy nonces
const PROXY_NONCE: u8 = 0x03;

/// Size of the AES-CCM nonce
const NONCE_SIZE: usize = 13;

/// Largest sequence number representable in 24 bits
const SEQ_MASK: u32 = 0x00FF_FFFF;

/// Which nonce construction protects the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    /// Network nonce (advertising bearer, loopback, proxy data)
    Network,
    /// Proxy nonce (proxy configuration messages)
    Proxy,
}

/// Cleartext fields of a network PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHeader {
    /// Network control message (selects the 64-bit NetMIC)
    pub ctl: bool,
    /// Time to live (7 bits)
    pub ttl: u8,
    /// Sequence number (24 bits)
    pub seq: u32,
    /// Source element address
    pub src: u16,
    /// Destination address
    pub dst: u16,
}

/// NetMIC length for a PDU: 8 bytes for control messages, 4 otherwise.
pub fn mic_size(ctl: bool) -> usize {
    if ctl { 8 } else { 4 }
}

/// Largest transport PDU that fits in one network PDU.
pub fn max_transport_pdu_size(ctl: bool) -> usize {
    MAX_NETWORK_PDU_SIZE - NETWORK_HEADER_SIZE - mic_size(ctl)
}

/// Build the 13-byte AES-CCM nonce.
///
/// Structure:
/// - byte 0: nonce type (0x00 network, 0x03 proxy)
/// - byte 1: CTL|TTL for network nonces, zero padding for proxy nonces
/// - bytes 2-4: SEQ (big-endian)
/// - bytes 5-6: SRC (big-endian)
/// - bytes 7-8: zero padding
/// - bytes 9-12: IV Index (big-endian)
fn build_nonce(
    kind: NonceKind,
    ctl: bool,
    ttl: u8,
    seq: u32,
    src: u16,
    iv_index: u32,
) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];

    match kind {
        NonceKind::Network => {
            nonce[0] = NETWORK_NONCE;
            nonce[1] = ctl_ttl(ctl, ttl);
        },
        NonceKind::Proxy => {
            nonce[0] = PROXY_NONCE;
        },
    }

    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());

    nonce
}

fn ctl_ttl(ctl: bool, ttl: u8) -> u8 {
    (u8::from(ctl) << 7) | (ttl & 0x7F)
}

fn seal(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    ctl: bool,
) -> Vec<u8> {
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);

    let result = if ctl {
        NetCcm64::new(key).encrypt(nonce, plaintext)
    } else {
        NetCcm32::new(key).encrypt(nonce, plaintext)
    };

    let Ok(ciphertext) = result else {
        unreachable!("AES-CCM encryption cannot fail for network PDU sizes");
    };
    ciphertext
}

fn open(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    ctl: bool,
) -> Result<Vec<u8>, CryptoError> {
    let nonce = GenericArray::from_slice(nonce);
    let key = GenericArray::from_slice(key);

    let result = if ctl {
        NetCcm64::new(key).decrypt(nonce, ciphertext)
    } else {
        NetCcm32::new(key).decrypt(nonce, ciphertext)
    };

    result.map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encrypt, authenticate and obfuscate a transport PDU into a network PDU.
///
/// # Errors
///
/// - `PduTooShort` if `transport_pdu` is empty
/// - `PduTooLong` if `transport_pdu` exceeds [`max_transport_pdu_size`]
pub fn encrypt_network_pdu(
    keys: &TrafficKeys,
    header: &NetworkHeader,
    iv_index: u32,
    transport_pdu: &[u8],
    kind: NonceKind,
) -> Result<Vec<u8>, CryptoError> {
    if transport_pdu.is_empty() {
        return Err(CryptoError::PduTooShort { len: 0, min: 1 });
    }

    let max = max_transport_pdu_size(header.ctl);
    if transport_pdu.len() > max {
        return Err(CryptoError::PduTooLong { len: transport_pdu.len(), max });
    }

    debug_assert!(header.ttl <= 0x7F, "TTL is a 7-bit field");
    debug_assert!(header.seq <= SEQ_MASK, "SEQ is a 24-bit field");
    let seq = header.seq & SEQ_MASK;

    let nonce = build_nonce(kind, header.ctl, header.ttl, seq, header.src, iv_index);

    let mut plaintext = Vec::with_capacity(2 + transport_pdu.len());
    plaintext.extend_from_slice(&header.dst.to_be_bytes());
    plaintext.extend_from_slice(transport_pdu);

    let encrypted = seal(keys.encryption_key(), &nonce, &plaintext, header.ctl);

    let mut pdu = Vec::with_capacity(ENCRYPTED_START + encrypted.len());
    pdu.push((((iv_index & 0x01) as u8) << 7) | keys.nid());
    pdu.push(ctl_ttl(header.ctl, header.ttl));
    pdu.extend_from_slice(&seq.to_be_bytes()[1..]);
    pdu.extend_from_slice(&header.src.to_be_bytes());
    pdu.extend_from_slice(&encrypted);

    debug_assert!(pdu.len() >= MIN_NETWORK_PDU_SIZE && pdu.len() <= MAX_NETWORK_PDU_SIZE);

    obfuscate_header(&mut pdu, keys.privacy_key(), iv_index);

    Ok(pdu)
}

/// Deobfuscate, authenticate and decrypt a network PDU.
///
/// Returns the recovered header and the transport PDU. The caller is
/// responsible for picking candidate keys by NID and for resolving the IV
/// Index from the IVI bit.
///
/// # Errors
///
/// - `PduTooShort` / `PduTooLong` if the length is outside the valid range
/// - `AuthenticationFailed` if the NID does not match or the NetMIC fails
pub fn decrypt_network_pdu(
    keys: &TrafficKeys,
    pdu: &[u8],
    iv_index: u32,
    kind: NonceKind,
) -> Result<(NetworkHeader, Vec<u8>), CryptoError> {
    if pdu.len() < MIN_NETWORK_PDU_SIZE {
        return Err(CryptoError::PduTooShort { len: pdu.len(), min: MIN_NETWORK_PDU_SIZE });
    }
    if pdu.len() > MAX_NETWORK_PDU_SIZE {
        return Err(CryptoError::PduTooLong { len: pdu.len(), max: MAX_NETWORK_PDU_SIZE });
    }
    if pdu[0] & 0x7F != keys.nid() {
        return Err(CryptoError::AuthenticationFailed);
    }

    let mut clear = pdu.to_vec();
    obfuscate_header(&mut clear, keys.privacy_key(), iv_index);

    let ctl = clear[1] & 0x80 != 0;
    let ttl = clear[1] & 0x7F;
    let seq = u32::from_be_bytes([0, clear[2], clear[3], clear[4]]);
    let src = u16::from_be_bytes([clear[5], clear[6]]);

    // A control PDU needs room for the 64-bit NetMIC. Under the wrong
    // PrivacyKey the CTL bit is noise, so this is an authentication failure.
    if pdu.len() < NETWORK_HEADER_SIZE + 1 + mic_size(ctl) {
        return Err(CryptoError::AuthenticationFailed);
    }

    let nonce = build_nonce(kind, ctl, ttl, seq, src, iv_index);
    let plaintext = open(keys.encryption_key(), &nonce, &pdu[ENCRYPTED_START..], ctl)?;

    let dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    let transport_pdu = plaintext[2..].to_vec();

    Ok((NetworkHeader { ctl, ttl, seq, src, dst }, transport_pdu))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::network::derivation::derive_net_keys;

    fn sample_keys() -> TrafficKeys {
        let net_key: [u8; KEY_SIZE] =
            hex::decode("7dd7364cd842ad18c17c2b820c84c3d6").unwrap().try_into().unwrap();
        derive_net_keys(&net_key).traffic().clone()
    }

    fn access_header(seq: u32) -> NetworkHeader {
        NetworkHeader { ctl: false, ttl: 4, seq, src: 0x0001, dst: 0xC000 }
    }

    #[test]
    fn control_message_matches_sample_data() {
        let keys = sample_keys();
        let header = NetworkHeader { ctl: true, ttl: 0, seq: 1, src: 0x1201, dst: 0xFFFD };
        let transport = hex::decode("034b50057e400000010000").unwrap();

        let pdu =
            encrypt_network_pdu(&keys, &header, 0x1234_5678, &transport, NonceKind::Network)
                .unwrap();

        assert_eq!(pdu, hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap());
    }

    #[test]
    fn sample_data_decrypts() {
        let keys = sample_keys();
        let pdu = hex::decode("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df").unwrap();

        let (header, transport) =
            decrypt_network_pdu(&keys, &pdu, 0x1234_5678, NonceKind::Network).unwrap();

        assert_eq!(header, NetworkHeader { ctl: true, ttl: 0, seq: 1, src: 0x1201, dst: 0xFFFD });
        assert_eq!(transport, hex::decode("034b50057e400000010000").unwrap());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keys = sample_keys();
        let header = access_header(42);

        let pdu = encrypt_network_pdu(&keys, &header, 100, b"PING", NonceKind::Network).unwrap();
        let (decoded, transport) = decrypt_network_pdu(&keys, &pdu, 100, NonceKind::Network).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(transport, b"PING");
    }

    #[test]
    fn pdu_carries_ivi_and_nid() {
        let keys = sample_keys();

        let even = encrypt_network_pdu(&keys, &access_header(1), 100, b"x", NonceKind::Network)
            .unwrap();
        let odd = encrypt_network_pdu(&keys, &access_header(1), 101, b"x", NonceKind::Network)
            .unwrap();

        assert_eq!(even[0], keys.nid());
        assert_eq!(odd[0], 0x80 | keys.nid());
    }

    #[test]
    fn pdu_length_includes_mic() {
        let keys = sample_keys();
        let pdu =
            encrypt_network_pdu(&keys, &access_header(1), 0, b"abcd", NonceKind::Network).unwrap();

        assert_eq!(pdu.len(), NETWORK_HEADER_SIZE + 4 + mic_size(false));
    }

    #[test]
    fn wrong_iv_index_fails() {
        let keys = sample_keys();
        let pdu =
            encrypt_network_pdu(&keys, &access_header(9), 100, b"PING", NonceKind::Network).unwrap();

        let result = decrypt_network_pdu(&keys, &pdu, 102, NonceKind::Network);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn wrong_key_fails() {
        let keys = sample_keys();
        let pdu =
            encrypt_network_pdu(&keys, &access_header(9), 100, b"PING", NonceKind::Network).unwrap();

        let other = derive_net_keys(&[0xEE; KEY_SIZE]).traffic().clone();
        assert!(decrypt_network_pdu(&other, &pdu, 100, NonceKind::Network).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let keys = sample_keys();
        let mut pdu =
            encrypt_network_pdu(&keys, &access_header(9), 100, b"PING", NonceKind::Network).unwrap();

        let last = pdu.len() - 1;
        pdu[last] ^= 0x01;

        let result = decrypt_network_pdu(&keys, &pdu, 100, NonceKind::Network);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn nonce_kind_must_match() {
        let keys = sample_keys();
        let pdu =
            encrypt_network_pdu(&keys, &access_header(3), 100, b"PING", NonceKind::Proxy).unwrap();

        assert!(decrypt_network_pdu(&keys, &pdu, 100, NonceKind::Network).is_err());
        assert!(decrypt_network_pdu(&keys, &pdu, 100, NonceKind::Proxy).is_ok());
    }

    #[test]
    fn oversized_transport_pdu_rejected() {
        let keys = sample_keys();
        let payload = vec![0u8; max_transport_pdu_size(false) + 1];

        let result = encrypt_network_pdu(&keys, &access_header(1), 0, &payload, NonceKind::Network);
        assert_eq!(result, Err(CryptoError::PduTooLong { len: 17, max: 16 }));
    }

    #[test]
    fn empty_transport_pdu_rejected() {
        let keys = sample_keys();
        let result = encrypt_network_pdu(&keys, &access_header(1), 0, &[], NonceKind::Network);
        assert_eq!(result, Err(CryptoError::PduTooShort { len: 0, min: 1 }));
    }

    #[test]
    fn short_pdu_rejected() {
        let keys = sample_keys();
        let result = decrypt_network_pdu(&keys, &[0x68; 10], 0, NonceKind::Network);
        assert_eq!(result, Err(CryptoError::PduTooShort { len: 10, min: MIN_NETWORK_PDU_SIZE }));
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(NonceKind::Network, true, 0x05, 0x0A0B0C, 0x1201, 0x1234_5678);
        assert_eq!(nonce, [0x00, 0x85, 0x0A, 0x0B, 0x0C, 0x12, 0x01, 0, 0, 0x12, 0x34, 0x56, 0x78]);

        let proxy = build_nonce(NonceKind::Proxy, true, 0x05, 0x0A0B0C, 0x1201, 0x1234_5678);
        assert_eq!(proxy[0], 0x03);
        assert_eq!(proxy[1], 0x00);
        assert_eq!(proxy[2..], nonce[2..]);
    }
}
