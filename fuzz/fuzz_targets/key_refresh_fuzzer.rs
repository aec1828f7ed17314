//! Fuzz target for Key Refresh transitions
//!
//! Drives a node and a peer through arbitrary Key Refresh requests, beacons
//! and traffic.
//!
//! # Invariants
//!
//! - A candidate key exists exactly in Phase 1 and Phase 2
//! - The phase only moves forward, except commit returning to Normal
//! - A failed request leaves phase and keys untouched
//! - After commit the former candidate is the active key
//! - Traffic always decodes at a peer holding the same keys

#![no_main]

use std::time::Instant;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshnet_core::{KeyRefreshPhase, MeshNet, NetAction, NetConfig, NetInterface, TxContext};

const KEYS: [[u8; 16]; 3] = [[0x11; 16], [0x22; 16], [0x33; 16]];

#[derive(Debug, Arbitrary)]
enum Op {
    Start { key: u8 },
    SetPhase { phase: u8 },
    Commit,
    PeerBeacon,
    Send { payload: Vec<u8> },
}

fn keys(net: &MeshNet) -> ([u8; 16], Option<[u8; 16]>) {
    net.with_keyring(|keyring| {
        let Ok(subnet) = keyring.subnet(0) else { unreachable!("subnet 0 is never removed") };
        (*subnet.active().net_key(), subnet.candidate().map(|c| *c.net_key()))
    })
}

fn phase(net: &MeshNet) -> KeyRefreshPhase {
    let Ok(phase) = net.key_refresh_phase(0) else { unreachable!("subnet 0 is never removed") };
    phase
}

fn check_candidate(net: &MeshNet) {
    let (_, candidate) = keys(net);
    assert_eq!(candidate.is_some(), phase(net).holds_candidate());
}

fuzz_target!(|ops: Vec<Op>| {
    let now = Instant::now();
    let node: MeshNet = MeshNet::new(NetConfig::new(0x0001), 0, now);
    let peer: MeshNet = MeshNet::new(NetConfig::new(0x0002), 0, now);
    for net in [&node, &peer] {
        if net.create_subnet(0, &KEYS[0]).is_err() {
            return;
        }
    }

    for op in ops {
        let phase_before = phase(&node);
        let keys_before = keys(&node);

        let result = match op {
            Op::Start { key } => {
                let key = &KEYS[usize::from(key) % KEYS.len()];
                node.start_key_refresh(0, key).map(|()| Vec::new())
            },
            Op::SetPhase { phase } => match KeyRefreshPhase::from_u8(phase % 4) {
                Some(target) => node.set_key_refresh_phase(0, target),
                None => continue,
            },
            Op::Commit => node.commit_key_refresh(0),
            Op::PeerBeacon => {
                // Keep the peer in step with the node's keys first
                if let (_, Some(candidate)) = keys_before {
                    let _ = peer.start_key_refresh(0, &candidate);
                }
                match peer.secure_beacon(0, now) {
                    Ok(beacon) => node.on_secure_beacon(&beacon, now),
                    Err(_) => continue,
                }
            },
            Op::Send { payload } => {
                let tx = TxContext::new(0, Some(0), 0x0001, 0x0002);
                let Ok(actions) = node.send(&tx, &payload, now) else { continue };
                for action in actions {
                    if let NetAction::Transmit { pdu, .. } = action {
                        // The peer is a fresh copy of the node's keys
                        let fresh: MeshNet = MeshNet::new(NetConfig::new(0x0003), 0, now);
                        let (active, candidate) = keys(&node);
                        let _ = fresh.create_subnet(0, &active);
                        if let Some(candidate) = candidate {
                            let _ = fresh.start_key_refresh(0, &candidate);
                        }
                        assert!(fresh.decode(&pdu, NetInterface::Adv, 0, now).is_ok());
                    }
                }
                continue;
            },
        };

        let phase_after = phase(&node);
        check_candidate(&node);
        match result {
            Err(_) => {
                assert_eq!(phase_after, phase_before);
                assert_eq!(keys(&node), keys_before);
            },
            Ok(_) if phase_after < phase_before => {
                // Only a commit goes back to Normal, promoting the candidate
                assert_eq!(phase_after, KeyRefreshPhase::Normal);
                assert_eq!(Some(keys(&node).0), keys_before.1);
            },
            Ok(_) => {},
        }
    }
});
