//! Mesh Network-Layer Cryptographic Primitives
//!
//! Cryptographic building blocks for the mesh network layer. Pure functions
//! with deterministic outputs: no clocks, no randomness, no shared state.
//!
//! # Key Lifecycle
//!
//! Every subnet is rooted in a 128-bit NetKey. All traffic keys are derived
//! from it with the AES-CMAC based functions `s1`, `k1`, `k2` and `k3`. A
//! friendship derives a second set of traffic keys from the same NetKey,
//! bound to both peer addresses and both friendship counters.
//!
//! ```text
//! NetKey (128 bits)
//!    │
//!    ├── k2(NetKey, 0x00) ──────────► NID, EncryptionKey, PrivacyKey
//!    ├── k3(NetKey) ────────────────► Network ID (64 bits)
//!    ├── k1(NetKey, s1("nkbk")) ────► BeaconKey
//!    ├── k1(NetKey, s1("nkik")) ────► IdentityKey (proxy feature)
//!    │
//!    └── k2(NetKey, 0x01 ‖ LPN ‖ Friend ‖ LPNCounter ‖ FriendCounter)
//!                                    ► friendship NID, EncryptionKey, PrivacyKey
//! ```
//!
//! # Network PDU Protection
//!
//! ```text
//! DST ‖ TransportPDU ──AES-CCM(EncryptionKey, nonce)──► EncData ‖ NetMIC
//! CTL|TTL ‖ SEQ ‖ SRC ──XOR PECB(PrivacyKey, IVIndex, EncData[0..7])──► obfuscated
//! ```
//!
//! The nonce binds every PDU to (CTL, TTL, SEQ, SRC, IV Index), so a
//! sequence number must never be reused under the same IV Index and key.
//!
//! # Security
//!
//! - Key material is zeroized on drop
//! - Beacon authentication values are compared in constant time
//! - A failed NetMIC is reported as a single opaque error

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod network;

pub use network::{
    BEACON_AUTH_SIZE, CryptoError, KEY_SIZE, MAX_NETWORK_PDU_SIZE, MIN_NETWORK_PDU_SIZE,
    NETWORK_HEADER_SIZE, NETWORK_ID_SIZE, NetKeys, NetworkHeader, NonceKind, TrafficKeys,
    beacon_auth, decrypt_network_pdu, derive_friend_keys, derive_net_keys, encrypt_network_pdu,
    k1, k2, k3, k4, max_transport_pdu_size, mic_size, s1, verify_beacon_auth,
};
