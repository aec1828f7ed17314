//! Key derivation for network keys using AES-CMAC

use aes::Aes128;
use cmac::{Cmac, Mac};
use zeroize::Zeroize;

use super::error::CryptoError;

type AesCmac = Cmac<Aes128>;

/// Size of every symmetric key in the network layer (16 bytes)
pub const KEY_SIZE: usize = 16;

/// Size of the public Network ID (8 bytes)
pub const NETWORK_ID_SIZE: usize = 8;

/// Salt label for k2
const K2_SALT_LABEL: &[u8] = b"smk2";

/// Salt label for k3
const K3_SALT_LABEL: &[u8] = b"smk3";

/// Salt label for k4
const K4_SALT_LABEL: &[u8] = b"smk4";

/// k4 parameter
const ID6: &[u8] = b"id6\x01";

/// Salt label for the BeaconKey
const BEACON_SALT_LABEL: &[u8] = b"nkbk";

/// Salt label for the IdentityKey
#[cfg(feature = "proxy")]
const IDENTITY_SALT_LABEL: &[u8] = b"nkik";

/// k1 parameter shared by the BeaconKey and IdentityKey derivations
const ID128: &[u8] = b"id128\x01";

/// k3 parameter
const ID64: &[u8] = b"id64\x01";

/// k2 parameter for master (flooding) credentials
const MASTER_CREDENTIALS: &[u8] = &[0x00];

/// k2 parameter prefix for friendship credentials
const FRIENDSHIP_CREDENTIALS: u8 = 0x01;

fn aes_cmac(key: &[u8; KEY_SIZE], parts: &[&[u8]]) -> [u8; KEY_SIZE] {
    let Ok(mut mac) = <AesCmac as Mac>::new_from_slice(key) else {
        unreachable!("AES-CMAC accepts 16-byte keys");
    };
    for part in parts {
        mac.update(part);
    }
    let result = mac.finalize().into_bytes();

    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&result);
    out
}

/// Salt generation function: `AES-CMAC` with an all-zero key.
pub fn s1(m: &[u8]) -> [u8; KEY_SIZE] {
    aes_cmac(&[0u8; KEY_SIZE], &[m])
}

/// Derivation function k1: `AES-CMAC_T(P)` where `T = AES-CMAC_SALT(N)`.
pub fn k1(n: &[u8], salt: &[u8; KEY_SIZE], p: &[u8]) -> [u8; KEY_SIZE] {
    let t = aes_cmac(salt, &[n]);
    aes_cmac(&t, &[p])
}

/// Derivation function k2: produces `(NID, EncryptionKey, PrivacyKey)`.
///
/// The NID is the 7 least significant bits of the first CMAC block.
pub fn k2(n: &[u8; KEY_SIZE], p: &[u8]) -> (u8, [u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let salt = s1(K2_SALT_LABEL);
    let mut t = aes_cmac(&salt, &[n]);

    let mut t1 = aes_cmac(&t, &[p, &[0x01]]);
    let t2 = aes_cmac(&t, &[&t1, p, &[0x02]]);
    let t3 = aes_cmac(&t, &[&t2, p, &[0x03]]);

    let nid = t1[15] & 0x7F;
    t.zeroize();
    t1.zeroize();

    (nid, t2, t3)
}

/// Derivation function k3: the 64-bit public Network ID.
pub fn k3(n: &[u8; KEY_SIZE]) -> [u8; NETWORK_ID_SIZE] {
    let salt = s1(K3_SALT_LABEL);
    let mut t = aes_cmac(&salt, &[n]);
    let result = aes_cmac(&t, &[ID64]);
    t.zeroize();

    let mut id = [0u8; NETWORK_ID_SIZE];
    id.copy_from_slice(&result[KEY_SIZE - NETWORK_ID_SIZE..]);
    id
}

/// Derivation function k4: the 6-bit AID of an application key.
pub fn k4(n: &[u8; KEY_SIZE]) -> u8 {
    let salt = s1(K4_SALT_LABEL);
    let mut t = aes_cmac(&salt, &[n]);
    let result = aes_cmac(&t, &[ID6]);
    t.zeroize();

    result[KEY_SIZE - 1] & 0x3F
}

/// The keys needed to protect a network PDU: NID, EncryptionKey and
/// PrivacyKey.
///
/// Produced both for a subnet (master credentials) and for a friendship.
#[derive(Clone, PartialEq, Eq)]
pub struct TrafficKeys {
    nid: u8,
    encryption_key: [u8; KEY_SIZE],
    privacy_key: [u8; KEY_SIZE],
}

impl TrafficKeys {
    /// 7-bit key identifier carried in cleartext.
    pub fn nid(&self) -> u8 {
        self.nid
    }

    /// AES-CCM key for the network payload.
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption_key
    }

    /// AES key for header obfuscation.
    pub fn privacy_key(&self) -> &[u8; KEY_SIZE] {
        &self.privacy_key
    }
}

impl std::fmt::Debug for TrafficKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficKeys").field("nid", &self.nid).finish_non_exhaustive()
    }
}

impl Drop for TrafficKeys {
    fn drop(&mut self) {
        self.encryption_key.zeroize();
        self.privacy_key.zeroize();
    }
}

/// Full key set derived from a subnet's NetKey.
#[derive(Clone, PartialEq, Eq)]
pub struct NetKeys {
    traffic: TrafficKeys,
    network_id: [u8; NETWORK_ID_SIZE],
    beacon_key: [u8; KEY_SIZE],
    identity_key: Option<[u8; KEY_SIZE]>,
}

impl NetKeys {
    /// Derive the key set from a NetKey given as a byte slice.
    ///
    /// # Errors
    ///
    /// - `InvalidKeyLength` if `net_key` is not exactly 16 bytes
    pub fn from_slice(net_key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; KEY_SIZE] = net_key.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: KEY_SIZE, actual: net_key.len() }
        })?;
        Ok(derive_net_keys(key))
    }

    /// Master credentials used for flooding traffic.
    pub fn traffic(&self) -> &TrafficKeys {
        &self.traffic
    }

    /// 7-bit key identifier.
    pub fn nid(&self) -> u8 {
        self.traffic.nid
    }

    /// Public 64-bit Network ID advertised in secure network beacons.
    pub fn network_id(&self) -> &[u8; NETWORK_ID_SIZE] {
        &self.network_id
    }

    /// Key authenticating secure network beacons.
    pub fn beacon_key(&self) -> &[u8; KEY_SIZE] {
        &self.beacon_key
    }

    /// Key for proxy Node Identity advertising. `None` when the `proxy`
    /// feature is disabled.
    pub fn identity_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.identity_key.as_ref()
    }
}

impl std::fmt::Debug for NetKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetKeys")
            .field("nid", &self.traffic.nid)
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

impl Drop for NetKeys {
    fn drop(&mut self) {
        self.beacon_key.zeroize();
        if let Some(key) = self.identity_key.as_mut() {
            key.zeroize();
        }
    }
}

/// Derive the full key set for a subnet from its 128-bit NetKey.
///
/// Deterministic: the same NetKey always yields bit-identical keys, which is
/// what lets a Key Refresh regenerate a slot from the stored NetKey alone.
pub fn derive_net_keys(net_key: &[u8; KEY_SIZE]) -> NetKeys {
    let (nid, encryption_key, privacy_key) = k2(net_key, MASTER_CREDENTIALS);
    let network_id = k3(net_key);
    let beacon_key = k1(net_key, &s1(BEACON_SALT_LABEL), ID128);

    #[cfg(feature = "proxy")]
    let identity_key = Some(k1(net_key, &s1(IDENTITY_SALT_LABEL), ID128));
    #[cfg(not(feature = "proxy"))]
    let identity_key = None;

    NetKeys {
        traffic: TrafficKeys { nid, encryption_key, privacy_key },
        network_id,
        beacon_key,
        identity_key,
    }
}

/// Derive friendship credentials.
///
/// The k2 parameter is `0x01 ‖ LPNAddress ‖ FriendAddress ‖ LPNCounter ‖
/// FriendCounter`, so two friendships on the same subnet never share keys,
/// and the same pair of nodes gets fresh keys every time the friendship is
/// re-established with new counters.
pub fn derive_friend_keys(
    net_key: &[u8; KEY_SIZE],
    lpn_addr: u16,
    friend_addr: u16,
    lpn_counter: u16,
    friend_counter: u16,
) -> TrafficKeys {
    let mut p = [0u8; 9];
    p[0] = FRIENDSHIP_CREDENTIALS;
    p[1..3].copy_from_slice(&lpn_addr.to_be_bytes());
    p[3..5].copy_from_slice(&friend_addr.to_be_bytes());
    p[5..7].copy_from_slice(&lpn_counter.to_be_bytes());
    p[7..9].copy_from_slice(&friend_counter.to_be_bytes());

    let (nid, encryption_key, privacy_key) = k2(net_key, &p);
    TrafficKeys { nid, encryption_key, privacy_key }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> [u8; KEY_SIZE] {
        let bytes = hex::decode(hex_str).unwrap();
        bytes.try_into().unwrap()
    }

    #[test]
    fn s1_matches_sample_data() {
        assert_eq!(s1(b"test").to_vec(), hex::decode("b73cefbd641ef2ea598c2b6efb62f79c").unwrap());
    }

    #[test]
    fn k2_matches_sample_data() {
        let (nid, enc, privacy) = k2(&key("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]);

        assert_eq!(nid, 0x7F);
        assert_eq!(enc, key("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(privacy, key("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn k3_matches_sample_data() {
        let id = k3(&key("f7a2a44f8e8a8029064f173ddc1e2b00"));
        assert_eq!(id.to_vec(), hex::decode("ff046958233db014").unwrap());
    }

    #[test]
    fn k4_matches_sample_data() {
        assert_eq!(k4(&key("3216d1509884b533248541792b877f98")), 0x38);
    }

    #[test]
    fn net_keys_match_message_sample_data() {
        let keys = derive_net_keys(&key("7dd7364cd842ad18c17c2b820c84c3d6"));

        assert_eq!(keys.nid(), 0x68);
        assert_eq!(keys.traffic().encryption_key(), &key("0953fa93e7caac9638f58820220a398e"));
        assert_eq!(keys.traffic().privacy_key(), &key("8b84eedec100067d670971dd2aa700cf"));
        assert_eq!(keys.network_id().to_vec(), hex::decode("3ecaff672f673370").unwrap());
    }

    #[test]
    fn derive_is_deterministic() {
        let net_key = [0x42; KEY_SIZE];
        assert_eq!(derive_net_keys(&net_key), derive_net_keys(&net_key));
    }

    #[test]
    fn different_net_keys_produce_different_keys() {
        let a = derive_net_keys(&[0x01; KEY_SIZE]);
        let b = derive_net_keys(&[0x02; KEY_SIZE]);

        assert_ne!(a.traffic().encryption_key(), b.traffic().encryption_key());
        assert_ne!(a.network_id(), b.network_id());
        assert_ne!(a.beacon_key(), b.beacon_key());
    }

    #[test]
    fn beacon_and_identity_keys_are_distinct() {
        let keys = derive_net_keys(&[0x11; KEY_SIZE]);

        assert_ne!(keys.beacon_key(), keys.traffic().encryption_key());
        if let Some(identity) = keys.identity_key() {
            assert_ne!(identity, keys.beacon_key());
        }
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let result = NetKeys::from_slice(&[0u8; 15]);
        assert_eq!(result.err(), Some(CryptoError::InvalidKeyLength { expected: 16, actual: 15 }));
    }

    #[test]
    fn from_slice_matches_array_derivation() {
        let net_key = [0x5A; KEY_SIZE];
        assert_eq!(NetKeys::from_slice(&net_key).unwrap(), derive_net_keys(&net_key));
    }

    #[test]
    fn friend_keys_differ_from_master_keys() {
        let net_key = [0x33; KEY_SIZE];
        let master = derive_net_keys(&net_key);
        let friend = derive_friend_keys(&net_key, 0x0203, 0x0405, 0x0607, 0x0809);

        assert_ne!(master.traffic(), &friend);
    }

    #[test]
    fn friend_keys_are_directional() {
        let net_key = [0x33; KEY_SIZE];
        let forward = derive_friend_keys(&net_key, 0x0001, 0x0002, 7, 9);
        let swapped_roles = derive_friend_keys(&net_key, 0x0002, 0x0001, 7, 9);
        let swapped_counters = derive_friend_keys(&net_key, 0x0001, 0x0002, 9, 7);

        assert_ne!(forward, swapped_roles);
        assert_ne!(forward, swapped_counters);
    }

    #[test]
    fn debug_output_hides_key_material() {
        let keys = derive_net_keys(&[0x77; KEY_SIZE]);
        let rendered = format!("{keys:?}");

        assert!(rendered.contains("nid"));
        assert!(!rendered.contains("beacon_key"));
        assert!(!rendered.contains("encryption_key"));
    }
}
