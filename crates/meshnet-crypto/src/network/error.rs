//! Error types for network-layer cryptography.

use thiserror::Error;

/// Errors produced by the network-layer primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Network PDU is shorter than the smallest valid PDU
    #[error("network PDU too short: {len} bytes (minimum {min})")]
    PduTooShort {
        /// Length of the PDU
        len: usize,
        /// Minimum length for this PDU type
        min: usize,
    },

    /// Network PDU or transport payload does not fit in a single PDU
    #[error("network PDU too long: {len} bytes (maximum {max})")]
    PduTooLong {
        /// Offending length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// NetMIC did not validate (wrong key, wrong IV Index, or tampering)
    #[error("authentication failed")]
    AuthenticationFailed,
}
