//! Network-layer cryptography: key derivation, PDU protection and beacon
//! authentication.

mod beacon;
mod derivation;
mod encryption;
mod error;
mod obfuscation;

pub use beacon::{BEACON_AUTH_SIZE, beacon_auth, verify_beacon_auth};
pub use derivation::{
    KEY_SIZE, NETWORK_ID_SIZE, NetKeys, TrafficKeys, derive_friend_keys, derive_net_keys, k1, k2,
    k3, k4, s1,
};
pub use encryption::{
    MAX_NETWORK_PDU_SIZE, MIN_NETWORK_PDU_SIZE, NETWORK_HEADER_SIZE, NetworkHeader, NonceKind,
    decrypt_network_pdu, encrypt_network_pdu, max_transport_pdu_size, mic_size,
};
pub use error::CryptoError;
