//! Property-based tests for the network PDU path
//!
//! These tests verify invariants that must hold for all inputs:
//! - Decode inverts encode for any key, sequence number and payload
//! - A source's sequence numbers are accepted only while they increase
//! - A PDU never decodes under a key it was not protected with

mod common;

use common::{SimInstant, SimNet, access, deliver, node, send};
use meshnet_core::{MeshNet, NetConfig, NetError, NetInterface, TxContext, config::SEQ_MAX};
use proptest::prelude::*;

fn node_with(addr: u16, net_key: &[u8; 16], iv_index: u32, seq: u32) -> SimNet {
    let net = MeshNet::new(NetConfig::new(addr), iv_index, SimInstant::ZERO);
    net.create_subnet(0, net_key).unwrap();

    let mut snapshot = net.snapshot();
    snapshot.seq = seq;
    MeshNet::restore(NetConfig::new(addr), &snapshot, SimInstant::ZERO).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: decode(encode(tx, payload)) recovers every header field and
    /// the payload
    #[test]
    fn prop_encode_decode_roundtrip(
        net_key in any::<[u8; 16]>(),
        iv_index in 0u32..1_000_000,
        seq in 0u32..=SEQ_MAX,
        src in 0x0001u16..0x7FFF,
        dst in 0x8000u16..=0xFFFF,
        ttl in 0u8..=0x7F,
        control in any::<bool>(),
        payload in prop::collection::vec(any::<u8>(), 1..=12),
    ) {
        let sender = node_with(src, &net_key, iv_index, seq);
        let receiver = node_with(if src == 1 { 2 } else { 1 }, &net_key, iv_index, 0);

        let mut tx = TxContext::new(0, (!control).then_some(0), src, dst);
        tx.ctx.ttl = Some(ttl);
        let pdu = send(&sender, &tx, &payload, SimInstant::ZERO);

        let (rx, decoded) = receiver.decode(&pdu, NetInterface::Adv, -70, SimInstant::ZERO)?;
        prop_assert_eq!(decoded, payload);
        prop_assert_eq!((rx.net_idx, rx.src, rx.dst, rx.seq), (0, src, dst, seq));
        prop_assert_eq!((rx.ttl, rx.ctl), (ttl, control));
        prop_assert!(!rx.old_iv);
        prop_assert!(!rx.new_key);
        prop_assert!(!rx.friend_cred);
    }

    /// Property: once sequence S is accepted from a source, nothing at or
    /// below S is accepted again
    #[test]
    fn prop_replay_ledger_is_monotonic(
        order in prop::collection::vec(0usize..8, 1..32),
        via_local in any::<bool>(),
    ) {
        let sender = node(0x0010, 100);
        let receiver = node(0x0020, 100);
        let pdus: Vec<Vec<u8>> = (0..8)
            .map(|_| send(&sender, &access(0x0010, 0x0020), b"seq", SimInstant::ZERO))
            .collect();
        let net_if = if via_local { NetInterface::Local } else { NetInterface::Adv };

        let mut highest: Option<usize> = None;
        for index in order {
            let result = receiver.decode(&pdus[index], net_if, 0, SimInstant::ZERO);
            if highest.is_none_or(|h| index > h) {
                prop_assert!(result.is_ok());
                highest = Some(index);
            } else {
                let is_replay = matches!(result, Err(NetError::ReplayDetected { src: 0x0010, .. }));
                prop_assert!(is_replay);
            }
        }
        prop_assert_eq!(
            receiver.replay_entry(0x0010).map(|entry| entry.seq),
            highest.map(|h| h as u32)
        );
    }

    /// Property: a PDU protected with one NetKey never decodes with another
    #[test]
    fn prop_foreign_key_never_authenticates(
        key_a in any::<[u8; 16]>(),
        key_b in any::<[u8; 16]>(),
        payload in prop::collection::vec(any::<u8>(), 1..=16),
    ) {
        prop_assume!(key_a != key_b);
        let sender = node_with(0x0001, &key_a, 0, 0);
        let receiver = node_with(0x0002, &key_b, 0, 0);

        let pdu = send(&sender, &access(0x0001, 0x0002), &payload, SimInstant::ZERO);
        prop_assert_eq!(
            receiver.decode(&pdu, NetInterface::Adv, 0, SimInstant::ZERO),
            Err(NetError::AuthenticationFailed)
        );
    }

    /// Property: flipping any bit of a PDU makes it undecodable
    #[test]
    fn prop_tampering_is_detected(bit in 0usize..(18 * 8)) {
        let sender = node(0x0001, 0);
        let receiver = node(0x0002, 0);
        let mut pdu = send(&sender, &access(0x0001, 0x0002), b"tamper", SimInstant::ZERO);
        pdu[bit / 8] ^= 1 << (bit % 8);

        prop_assert!(deliver(&receiver, &pdu, SimInstant::ZERO).is_err());
    }
}

#[test]
fn ping_then_replay() {
    let sender = node(0x0001, 100);
    let receiver = node(0x0002, 100);

    let pdu = send(&sender, &access(0x0001, 0x0002), b"PING", SimInstant::ZERO);
    let (rx, payload) = receiver.decode(&pdu, NetInterface::Adv, -40, SimInstant::ZERO).unwrap();
    assert_eq!(payload, b"PING");
    assert_eq!(rx.net_idx, 0);
    assert!(!rx.old_iv);

    assert!(matches!(
        deliver(&receiver, &pdu, SimInstant::ZERO),
        Err(NetError::ReplayDetected { src: 0x0001, seq: 0 })
    ));
    // Past the relay cache the replay ledger still rejects it
    assert!(matches!(
        receiver.decode(&pdu, NetInterface::Local, 0, SimInstant::ZERO),
        Err(NetError::ReplayDetected { src: 0x0001, seq: 0 })
    ));
}

#[test]
fn nid_collisions_try_every_subnet() {
    let sender = node(0x0001, 0);
    let receiver = node(0x0002, 0);
    // Same NetKey under a second index yields the same NID
    sender.create_subnet(1, &common::NET_KEY).unwrap();
    receiver.create_subnet(1, &common::NET_KEY).unwrap();
    receiver.create_subnet(2, &[0x55; 16]).unwrap();

    let pdu = send(&sender, &TxContext::new(1, Some(0), 0x0001, 0x0002), b"x", SimInstant::ZERO);
    let (rx, _) = receiver.decode(&pdu, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert!(rx.net_idx == 0 || rx.net_idx == 1);
}
