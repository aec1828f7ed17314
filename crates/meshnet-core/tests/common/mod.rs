//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::{
    ops::{Add, Sub},
    time::Duration,
};

use meshnet_core::{MeshNet, NetAction, NetConfig, NetInterface, TxContext};

/// One hour of virtual time
pub const HOUR: Duration = Duration::from_secs(3600);

/// Virtual monotonic instant: time elapsed since the test started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Start of the test.
    pub const ZERO: Self = Self(Duration::ZERO);

    /// `hours` of virtual time after the start.
    pub fn hours(hours: u64) -> Self {
        Self(HOUR * hours as u32)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Network layer on the virtual clock.
pub type SimNet = MeshNet<SimInstant>;

/// NetKey K used by the scenarios
pub const NET_KEY: [u8; 16] = [
    0x7D, 0xD7, 0x36, 0x4C, 0xD8, 0x42, 0xAD, 0x18, 0xC1, 0x7C, 0x2B, 0x82, 0x0C, 0x84, 0xC3, 0xD6,
];

/// Replacement NetKey K2
pub const NEW_NET_KEY: [u8; 16] = [0xF7; 16];

/// A node at `addr` on subnet 0 with [`NET_KEY`], created at virtual time
/// zero.
pub fn node(addr: u16, iv_index: u32) -> SimNet {
    let net = MeshNet::new(NetConfig::new(addr), iv_index, SimInstant::ZERO);
    net.create_subnet(0, &NET_KEY).unwrap();
    net
}

/// Access message on subnet 0.
pub fn access(src: u16, dst: u16) -> TxContext {
    TxContext::new(0, Some(0), src, dst)
}

/// Wire bytes of the single `Transmit` action.
pub fn transmitted(actions: &[NetAction]) -> Vec<u8> {
    let pdus: Vec<&Vec<u8>> = actions
        .iter()
        .filter_map(|action| match action {
            NetAction::Transmit { pdu, .. } => Some(pdu),
            _ => None,
        })
        .collect();
    assert_eq!(pdus.len(), 1, "expected exactly one transmission in {actions:?}");
    pdus[0].clone()
}

/// Send `payload` from `from` and return the wire bytes.
pub fn send(from: &SimNet, tx: &TxContext, payload: &[u8], now: SimInstant) -> Vec<u8> {
    transmitted(&from.send(tx, payload, now).unwrap())
}

/// Deliver wire bytes over the advertising bearer.
pub fn deliver(
    to: &SimNet,
    pdu: &[u8],
    now: SimInstant,
) -> Result<Vec<u8>, meshnet_core::NetError> {
    to.decode(pdu, NetInterface::Adv, -50, now).map(|(_, payload)| payload)
}
