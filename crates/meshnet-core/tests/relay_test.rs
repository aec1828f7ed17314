//! Relay feature across three nodes
//!
//! A source, a relay and a destination share subnet 0. The relay forwards
//! traffic addressed to others with a decremented TTL, and every node drops
//! copies of a message it has already seen.

mod common;

use common::{NET_KEY, SimInstant, SimNet, access, send};
use meshnet_core::{MeshNet, NetAction, NetConfig, NetError, NetInterface, TxContext};

fn relay_node(addr: u16) -> SimNet {
    let config = NetConfig { relay: true, ..NetConfig::new(addr) };
    let net = MeshNet::new(config, 0, SimInstant::ZERO);
    net.create_subnet(0, &NET_KEY).unwrap();
    net
}

fn with_ttl(src: u16, dst: u16, ttl: u8) -> TxContext {
    let mut tx = access(src, dst);
    tx.ctx.ttl = Some(ttl);
    tx
}

fn relayed(action: Option<NetAction>) -> Vec<u8> {
    match action {
        Some(NetAction::Transmit { net_if: NetInterface::Adv, pdu, .. }) => pdu,
        other => panic!("expected an advertising transmission, got {other:?}"),
    }
}

#[test]
fn relayed_copy_reaches_destination_with_lower_ttl() {
    let source = common::node(0x0001, 0);
    let relay = relay_node(0x0002);
    let destination = common::node(0x0003, 0);

    let pdu = send(&source, &with_ttl(0x0001, 0x0003, 5), b"hop", SimInstant::ZERO);
    let received = relay.receive(&pdu, NetInterface::Adv, -70, SimInstant::ZERO).unwrap();
    assert_eq!(received.transport, b"hop");
    let copy = relayed(received.relay);
    assert_ne!(copy, pdu);

    let (rx, payload) =
        destination.decode(&copy, NetInterface::Adv, -70, SimInstant::ZERO).unwrap();
    assert_eq!((rx.src, rx.dst, rx.ttl), (0x0001, 0x0003, 4));
    assert_eq!(rx.seq, received.rx.seq);
    assert_eq!(payload, b"hop");
}

#[test]
fn relayed_copy_of_a_seen_message_is_dropped() {
    let source = common::node(0x0001, 0);
    let relay = relay_node(0x0002);
    let destination = common::node(0x0003, 0);

    let pdu = send(&source, &with_ttl(0x0001, 0x0003, 5), b"twice", SimInstant::ZERO);
    destination.decode(&pdu, NetInterface::Adv, -40, SimInstant::ZERO).unwrap();

    let received = relay.receive(&pdu, NetInterface::Adv, -70, SimInstant::ZERO).unwrap();
    let copy = relayed(received.relay);
    assert!(matches!(
        destination.decode(&copy, NetInterface::Adv, -70, SimInstant::ZERO),
        Err(NetError::ReplayDetected { src: 0x0001, .. })
    ));

    // The relay itself does not forward the copy it sent back to it
    assert!(matches!(
        relay.receive(&copy, NetInterface::Adv, -70, SimInstant::ZERO),
        Err(NetError::ReplayDetected { src: 0x0001, .. })
    ));
}

#[test]
fn last_hop_and_local_traffic_are_not_relayed() {
    let source = common::node(0x0001, 0);
    let relay = relay_node(0x0002);

    let last_hop = send(&source, &with_ttl(0x0001, 0x0003, 1), b"ttl1", SimInstant::ZERO);
    let received = relay.receive(&last_hop, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert_eq!(received.relay, None);

    let local = send(&source, &with_ttl(0x0001, 0x0002, 5), b"mine", SimInstant::ZERO);
    let received = relay.receive(&local, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert_eq!(received.relay, None);

    let group = send(&source, &with_ttl(0x0001, 0xC000, 5), b"group", SimInstant::ZERO);
    let received = relay.receive(&group, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    let copy = relayed(received.relay);
    assert!(!copy.is_empty());
}

#[test]
fn relay_is_off_by_default() {
    let source = common::node(0x0001, 0);
    let bystander = common::node(0x0002, 0);

    let pdu = send(&source, &with_ttl(0x0001, 0x0003, 5), b"pass", SimInstant::ZERO);
    let received = bystander.receive(&pdu, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert_eq!(received.relay, None);
    assert_eq!(received.transport, b"pass");
}

#[test]
fn relay_uses_the_index_the_message_was_sent_under() {
    let now = SimInstant::hours(100);
    let source = common::node(0x0001, 0);
    let relay = relay_node(0x0002);
    let destination = common::node(0x0003, 0);
    relay.start_iv_update(now).unwrap();
    destination.start_iv_update(now).unwrap();

    let pdu = send(&source, &with_ttl(0x0001, 0x0003, 3), b"old", now);
    let received = relay.receive(&pdu, NetInterface::Adv, 0, now).unwrap();
    assert!(received.rx.old_iv);

    let copy = relayed(received.relay);
    let (rx, _) = destination.decode(&copy, NetInterface::Adv, 0, now).unwrap();
    assert!(rx.old_iv);
    assert_eq!(rx.ttl, 2);
}
