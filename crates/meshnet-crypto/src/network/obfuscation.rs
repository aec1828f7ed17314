//! Network header obfuscation using the PrivacyKey
//!
//! The obfuscated fields (CTL/TTL, SEQ, SRC) are XORed with the first six
//! bytes of `PECB = AES_PrivacyKey(0x0000000000 ‖ IVIndex ‖ PrivacyRandom)`,
//! where `PrivacyRandom` is the first seven bytes of the encrypted part of
//! the PDU. Obfuscation is an involution: applying it twice restores the
//! header.

use aes::{
    Aes128,
    cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray},
};

use super::derivation::KEY_SIZE;

/// Offset of the first obfuscated byte (CTL/TTL)
const OBFUSCATED_START: usize = 1;

/// Number of obfuscated bytes (CTL/TTL, SEQ, SRC)
const OBFUSCATED_LEN: usize = 6;

/// Offset of the privacy random (start of the encrypted DST)
const PRIVACY_RANDOM_START: usize = OBFUSCATED_START + OBFUSCATED_LEN;

/// Number of privacy random bytes fed into PECB
const PRIVACY_RANDOM_LEN: usize = 7;

/// Minimum PDU length for obfuscation to be defined.
pub(super) const MIN_OBFUSCATION_LEN: usize = PRIVACY_RANDOM_START + PRIVACY_RANDOM_LEN;

/// Compute the 16-byte PECB block.
fn privacy_ecb(privacy_key: &[u8; KEY_SIZE], iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(privacy_random);

    let cipher = Aes128::new(GenericArray::from_slice(privacy_key));
    let mut ga = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut ga);

    let mut out = [0u8; 16];
    out.copy_from_slice(&ga);
    out
}

/// Obfuscate (or deobfuscate) bytes `1..7` of a network PDU in place.
///
/// Caller guarantees `pdu.len() >= MIN_OBFUSCATION_LEN`.
pub(super) fn obfuscate_header(pdu: &mut [u8], privacy_key: &[u8; KEY_SIZE], iv_index: u32) {
    debug_assert!(pdu.len() >= MIN_OBFUSCATION_LEN);

    let pecb = privacy_ecb(
        privacy_key,
        iv_index,
        &pdu[PRIVACY_RANDOM_START..PRIVACY_RANDOM_START + PRIVACY_RANDOM_LEN],
    );

    for (byte, mask) in
        pdu[OBFUSCATED_START..OBFUSCATED_START + OBFUSCATED_LEN].iter_mut().zip(pecb.iter())
    {
        *byte ^= mask;
    }
}
