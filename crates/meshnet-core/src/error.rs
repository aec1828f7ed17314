//! Error types for the network-layer core.
//!
//! Every failure belongs to one of three classes:
//!
//! - transient per-PDU failures: the PDU is dropped, the node carries on
//! - resource exhaustion: surfaced to the operator, no automatic recovery
//! - protocol-invariant violations: rejected before any state is touched

use meshnet_crypto::CryptoError;
use thiserror::Error;

use crate::key_refresh::KeyRefreshPhase;

/// Classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Drop this PDU and continue
    Transient,
    /// A table or counter is full; operator action required
    Exhausted,
    /// Request would break a protocol invariant; nothing was changed
    Violation,
}

/// Errors that can occur in the network-layer core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// No candidate key produced a valid NetMIC
    #[error("authentication failed")]
    AuthenticationFailed,

    /// PDU does not advance the replay ledger for its source
    #[error("replay detected: src {src:#06x} seq {seq:#08x}")]
    ReplayDetected {
        /// Source address
        src: u16,
        /// Sequence number carried by the PDU
        seq: u32,
    },

    /// PDU was protected with an IV Index this node no longer accepts
    #[error("stale IV index {iv_index} (current {current})")]
    StaleIvIndex {
        /// IV Index resolved from the IVI bit
        iv_index: u32,
        /// Current IV Index
        current: u32,
    },

    /// PDU is malformed (length or address fields)
    #[error("malformed PDU: {0}")]
    Malformed(String),

    /// The subnet selected for transmission no longer exists
    #[error("no key for subnet {net_idx:#05x}")]
    NoMatchingKey {
        /// NetKey index
        net_idx: u16,
    },

    /// Transport PDU does not fit into one network PDU
    #[error("payload too large: {len} bytes (maximum {max})")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Maximum for this PDU type
        max: usize,
    },

    /// The 24-bit sequence number space is used up
    #[error("sequence number space exhausted; device must be re-provisioned")]
    SequenceExhausted,

    /// The 32-bit IV Index cannot advance any further
    #[error("IV index exhausted")]
    IvIndexExhausted,

    /// A fixed-capacity table is full
    #[error("{table} table full (capacity {capacity})")]
    CapacityExceeded {
        /// Table name
        table: &'static str,
        /// Table capacity
        capacity: usize,
    },

    /// Subnet is not known
    #[error("unknown subnet {net_idx:#05x}")]
    UnknownSubnet {
        /// NetKey index
        net_idx: u16,
    },

    /// Application key is not known
    #[error("unknown app key {app_idx:#05x} on subnet {net_idx:#05x}")]
    UnknownAppKey {
        /// NetKey index
        net_idx: u16,
        /// AppKey index
        app_idx: u16,
    },

    /// Entry already exists with different key material
    #[error("{what} already exists")]
    AlreadyExists {
        /// Description of the existing entry
        what: String,
    },

    /// Attempt to move a Key Refresh procedure backwards
    #[error("key refresh phase regression: {from:?} -> {to:?}")]
    PhaseRegression {
        /// Current phase
        from: KeyRefreshPhase,
        /// Requested phase
        to: KeyRefreshPhase,
    },

    /// Phase change not allowed from the current phase
    #[error("invalid key refresh transition: {from:?} -> {to:?}")]
    InvalidPhaseTransition {
        /// Current phase
        from: KeyRefreshPhase,
        /// Requested phase
        to: KeyRefreshPhase,
    },

    /// Active key slot cannot be overwritten while a refresh is running
    #[error("active key of subnet {net_idx:#05x} is locked during key refresh")]
    SlotLocked {
        /// NetKey index
        net_idx: u16,
    },

    /// Candidate slot written while no refresh is running
    #[error("no key refresh in progress on subnet {net_idx:#05x}")]
    NoRefreshInProgress {
        /// NetKey index
        net_idx: u16,
    },

    /// IV Update requested before the minimum interval elapsed
    #[error("IV update too soon: {remaining_secs}s remaining")]
    IvUpdateTooSoon {
        /// Seconds until an update is allowed
        remaining_secs: u64,
    },

    /// Observed IV Index cannot be reconciled with ours
    #[error("IV index mismatch: local {local}, observed {observed}")]
    IvIndexMismatch {
        /// Local IV Index
        local: u32,
        /// IV Index seen on the network
        observed: u32,
    },

    /// Low Power Node state change not allowed
    #[error("invalid LPN transition: {from} -> {to}")]
    InvalidLpnTransition {
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },

    /// Persistent storage failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl NetError {
    /// Which failure class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationFailed
            | Self::ReplayDetected { .. }
            | Self::StaleIvIndex { .. }
            | Self::Malformed(_)
            | Self::NoMatchingKey { .. }
            | Self::PayloadTooLarge { .. }
            | Self::Storage(_) => ErrorKind::Transient,
            Self::SequenceExhausted | Self::IvIndexExhausted | Self::CapacityExceeded { .. } => {
                ErrorKind::Exhausted
            },
            Self::UnknownSubnet { .. }
            | Self::UnknownAppKey { .. }
            | Self::AlreadyExists { .. }
            | Self::PhaseRegression { .. }
            | Self::InvalidPhaseTransition { .. }
            | Self::SlotLocked { .. }
            | Self::NoRefreshInProgress { .. }
            | Self::IvUpdateTooSoon { .. }
            | Self::IvIndexMismatch { .. }
            | Self::InvalidLpnTransition { .. } => ErrorKind::Violation,
        }
    }

    /// Returns true if this error only affects the current PDU.
    ///
    /// Transient errors are dropped silently by the receive path. Exhaustion
    /// and invariant violations are never transient.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<CryptoError> for NetError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed,
            CryptoError::PduTooLong { len, max } => Self::PayloadTooLarge { len, max },
            CryptoError::PduTooShort { .. } | CryptoError::InvalidKeyLength { .. } => {
                Self::Malformed(err.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_pdu_failures_are_transient() {
        assert!(NetError::AuthenticationFailed.is_transient());
        assert!(NetError::ReplayDetected { src: 1, seq: 2 }.is_transient());
        assert!(NetError::StaleIvIndex { iv_index: 1, current: 3 }.is_transient());
        assert!(NetError::Malformed("short".to_string()).is_transient());
    }

    #[test]
    fn exhaustion_is_not_transient() {
        assert_eq!(NetError::SequenceExhausted.kind(), ErrorKind::Exhausted);
        assert_eq!(
            NetError::CapacityExceeded { table: "subnet", capacity: 4 }.kind(),
            ErrorKind::Exhausted
        );
        assert!(!NetError::SequenceExhausted.is_transient());
    }

    #[test]
    fn invariant_violations_are_not_transient() {
        let err = NetError::PhaseRegression {
            from: KeyRefreshPhase::Phase1,
            to: KeyRefreshPhase::Normal,
        };
        assert_eq!(err.kind(), ErrorKind::Violation);
        assert!(!NetError::SlotLocked { net_idx: 0 }.is_transient());
    }

    #[test]
    fn crypto_errors_map_onto_pdu_errors() {
        assert_eq!(NetError::from(CryptoError::AuthenticationFailed), NetError::AuthenticationFailed);
        assert_eq!(
            NetError::from(CryptoError::PduTooLong { len: 20, max: 16 }),
            NetError::PayloadTooLarge { len: 20, max: 16 }
        );
        assert!(matches!(
            NetError::from(CryptoError::PduTooShort { len: 3, min: 14 }),
            NetError::Malformed(_)
        ));
    }
}
