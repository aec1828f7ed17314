//! Secure network beacon wire format.
//!
//! ```text
//! ┌──────┬───────┬────────────┬──────────┬──────────┐
//! │ Type │ Flags │ Network ID │ IV Index │ Auth     │
//! │ 0x01 │ 1     │ 8          │ 4 (BE)   │ 8        │
//! └──────┴───────┴────────────┴──────────┴──────────┘
//! ```

use meshnet_crypto::{BEACON_AUTH_SIZE, NETWORK_ID_SIZE};

use crate::{
    error::NetError,
    subnet::{BEACON_FLAG_IV_UPDATE, BEACON_FLAG_KEY_REFRESH},
};

/// Beacon type octet of a secure network beacon
pub const SECURE_BEACON_TYPE: u8 = 0x01;

/// Encoded size of a secure network beacon
pub const SECURE_BEACON_SIZE: usize = 2 + NETWORK_ID_SIZE + 4 + BEACON_AUTH_SIZE;

/// A parsed secure network beacon. Authentication is checked separately
/// against the subnet table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureBeacon {
    /// Key Refresh and IV Update flags
    pub flags: u8,
    /// Network ID of the key that authenticated the beacon
    pub network_id: [u8; NETWORK_ID_SIZE],
    /// Current IV Index of the sender
    pub iv_index: u32,
    /// Authentication value
    pub auth: [u8; BEACON_AUTH_SIZE],
}

impl SecureBeacon {
    /// Key Refresh flag.
    pub fn key_refresh(&self) -> bool {
        self.flags & BEACON_FLAG_KEY_REFRESH != 0
    }

    /// IV Update flag.
    pub fn iv_update(&self) -> bool {
        self.flags & BEACON_FLAG_IV_UPDATE != 0
    }

    /// Parse a beacon from its wire bytes.
    ///
    /// # Errors
    ///
    /// - `Malformed` for a wrong length or beacon type
    pub fn parse(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() != SECURE_BEACON_SIZE {
            return Err(NetError::Malformed(format!(
                "secure beacon is {} bytes, expected {SECURE_BEACON_SIZE}",
                bytes.len()
            )));
        }
        if bytes[0] != SECURE_BEACON_TYPE {
            return Err(NetError::Malformed(format!("beacon type {:#04x}", bytes[0])));
        }

        let mut network_id = [0u8; NETWORK_ID_SIZE];
        network_id.copy_from_slice(&bytes[2..2 + NETWORK_ID_SIZE]);
        let iv_start = 2 + NETWORK_ID_SIZE;
        let mut iv_bytes = [0u8; 4];
        iv_bytes.copy_from_slice(&bytes[iv_start..iv_start + 4]);
        let mut auth = [0u8; BEACON_AUTH_SIZE];
        auth.copy_from_slice(&bytes[iv_start + 4..]);

        Ok(Self { flags: bytes[1], network_id, iv_index: u32::from_be_bytes(iv_bytes), auth })
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> [u8; SECURE_BEACON_SIZE] {
        let mut out = [0u8; SECURE_BEACON_SIZE];
        out[0] = SECURE_BEACON_TYPE;
        out[1] = self.flags;
        out[2..2 + NETWORK_ID_SIZE].copy_from_slice(&self.network_id);
        let iv_start = 2 + NETWORK_ID_SIZE;
        out[iv_start..iv_start + 4].copy_from_slice(&self.iv_index.to_be_bytes());
        out[iv_start + 4..].copy_from_slice(&self.auth);
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        let beacon = SecureBeacon {
            flags: BEACON_FLAG_IV_UPDATE,
            network_id: [0xAA; NETWORK_ID_SIZE],
            iv_index: 0x1234_5678,
            auth: [0xBB; BEACON_AUTH_SIZE],
        };
        let bytes = beacon.to_bytes();

        assert_eq!(bytes.len(), 22);
        assert_eq!(bytes[0], SECURE_BEACON_TYPE);
        assert_eq!(&bytes[10..14], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(SecureBeacon::parse(&bytes).unwrap(), beacon);
        assert!(beacon.iv_update());
        assert!(!beacon.key_refresh());
    }

    #[test]
    fn rejects_wrong_type_and_length() {
        let mut bytes = [0u8; SECURE_BEACON_SIZE];
        assert!(SecureBeacon::parse(&bytes).is_err());

        bytes[0] = SECURE_BEACON_TYPE;
        assert!(SecureBeacon::parse(&bytes[..21]).is_err());
        assert!(SecureBeacon::parse(&bytes).is_ok());
    }
}
