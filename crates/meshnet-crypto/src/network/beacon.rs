//! Secure network beacon authentication

use aes::Aes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

use super::derivation::{KEY_SIZE, NETWORK_ID_SIZE};

/// Size of the beacon authentication value (8 bytes)
pub const BEACON_AUTH_SIZE: usize = 8;

/// Compute the authentication value of a secure network beacon.
///
/// `AES-CMAC_BeaconKey(Flags ‖ NetworkID ‖ IVIndex)` truncated to 64 bits.
pub fn beacon_auth(
    beacon_key: &[u8; KEY_SIZE],
    flags: u8,
    network_id: &[u8; NETWORK_ID_SIZE],
    iv_index: u32,
) -> [u8; BEACON_AUTH_SIZE] {
    let Ok(mut mac) = <Cmac<Aes128> as Mac>::new_from_slice(beacon_key) else {
        unreachable!("AES-CMAC accepts 16-byte keys");
    };
    mac.update(&[flags]);
    mac.update(network_id);
    mac.update(&iv_index.to_be_bytes());
    let result = mac.finalize().into_bytes();

    let mut auth = [0u8; BEACON_AUTH_SIZE];
    auth.copy_from_slice(&result[..BEACON_AUTH_SIZE]);
    auth
}

/// Check a received beacon authentication value in constant time.
pub fn verify_beacon_auth(
    beacon_key: &[u8; KEY_SIZE],
    flags: u8,
    network_id: &[u8; NETWORK_ID_SIZE],
    iv_index: u32,
    auth: &[u8; BEACON_AUTH_SIZE],
) -> bool {
    let expected = beacon_auth(beacon_key, flags, network_id, iv_index);
    expected.as_slice().ct_eq(auth.as_slice()).into()
}
