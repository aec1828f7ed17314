//! Restart tests: a node persisted mid-operation comes back with the same
//! security state.

mod common;

use std::time::Duration;

use common::{NEW_NET_KEY, SimInstant, SimNet, access, deliver, node, send};
use meshnet_core::{
    FriendRole, Friendship, KeyRefreshPhase, KeySlot, MemoryStorage, MeshNet, NetConfig, NetError,
    NetInterface, Storage,
};

fn restart(net: &SimNet, storage: &MemoryStorage, now: SimInstant) -> SimNet {
    net.persist(storage).unwrap();
    let addr = net.config().primary_address;
    MeshNet::load(NetConfig::new(addr), storage, now).unwrap().unwrap()
}

#[test]
fn empty_storage_loads_nothing() {
    let storage = MemoryStorage::new();
    let loaded: Option<SimNet> =
        MeshNet::load(NetConfig::new(0x0001), &storage, SimInstant::ZERO).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn replay_protection_survives_restart() {
    let sender = node(0x0001, 100);
    let receiver = node(0x0002, 100);
    let storage = MemoryStorage::new();

    let pdus: Vec<Vec<u8>> =
        (0..4).map(|_| send(&sender, &access(0x0001, 0x0002), b"data", SimInstant::ZERO)).collect();
    for pdu in &pdus {
        deliver(&receiver, pdu, SimInstant::ZERO).unwrap();
    }

    let receiver = restart(&receiver, &storage, SimInstant::hours(1));
    assert_eq!(receiver.replay_entry(0x0001).unwrap().seq, 3);
    for pdu in &pdus {
        assert!(matches!(
            deliver(&receiver, pdu, SimInstant::hours(1)),
            Err(NetError::ReplayDetected { src: 0x0001, .. })
        ));
    }

    let fresh = send(&sender, &access(0x0001, 0x0002), b"data", SimInstant::hours(1));
    assert!(deliver(&receiver, &fresh, SimInstant::hours(1)).is_ok());
}

#[test]
fn sequence_numbers_continue_after_restart() {
    let sender = node(0x0001, 100);
    let storage = MemoryStorage::new();
    for _ in 0..5 {
        send(&sender, &access(0x0001, 0x0002), b"data", SimInstant::ZERO);
    }

    let sender = restart(&sender, &storage, SimInstant::ZERO);
    assert_eq!(sender.seq(), 5);

    let receiver = node(0x0002, 100);
    let pdu = send(&sender, &access(0x0001, 0x0002), b"data", SimInstant::ZERO);
    let (rx, _) = receiver.decode(&pdu, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert_eq!(rx.seq, 5);
}

#[test]
fn key_refresh_state_survives_restart() {
    let net = node(0x0001, 100);
    let peer = node(0x0002, 100);
    let storage = MemoryStorage::new();

    net.install_app_key(0, 3, &[0x31; 16], KeySlot::Active).unwrap();
    for each in [&net, &peer] {
        each.start_key_refresh(0, &NEW_NET_KEY).unwrap();
    }
    net.update_app_key(0, 3, &[0x32; 16]).unwrap();
    net.set_key_refresh_phase(0, KeyRefreshPhase::Phase2).unwrap();
    let beacon_before = net.secure_beacon(0, SimInstant::ZERO).unwrap();

    let net = restart(&net, &storage, SimInstant::ZERO);
    assert_eq!(net.key_refresh_phase(0).unwrap(), KeyRefreshPhase::Phase2);
    assert_eq!(net.secure_beacon(0, SimInstant::ZERO).unwrap(), beacon_before);
    net.with_keyring(|keyring| {
        let app = keyring.app_keys().get(3).unwrap();
        assert_eq!(app.active().key(), &[0x31; 16]);
        assert_eq!(app.candidate().unwrap().key(), &[0x32; 16]);
    });

    // Still transmitting with the new key, which the peer holds as candidate
    let pdu = send(&net, &access(0x0001, 0x0002), b"phase2", SimInstant::ZERO);
    let (rx, _) = peer.decode(&pdu, NetInterface::Adv, 0, SimInstant::ZERO).unwrap();
    assert!(rx.new_key);

    net.commit_key_refresh(0).unwrap();
    net.with_keyring(|keyring| {
        assert_eq!(keyring.app_keys().get(3).unwrap().active().key(), &[0x32; 16]);
    });
}

#[test]
fn iv_update_in_progress_survives_restart() {
    let net = node(0x0001, 100);
    let storage = MemoryStorage::new();
    net.start_iv_update(SimInstant::hours(100)).unwrap();

    // The restarted node re-arms its forced completion from the restart time
    let net = restart(&net, &storage, SimInstant::hours(120));
    assert_eq!(net.iv_index(), (101, true));
    assert_eq!(net.tx_iv_index(), 100);
    assert_eq!(net.next_deadline(), Some(SimInstant::hours(264)));

    // Restarting counts as a transition for the minimum interval
    let beacon_at = SimInstant::hours(130);
    let peer = node(0x0002, 101);
    let completion = peer.secure_beacon(0, beacon_at).unwrap();
    assert!(net.on_secure_beacon(&completion, beacon_at).unwrap().is_empty());
    assert_eq!(net.iv_index(), (101, true));
}

#[test]
fn friendships_are_rederived_on_restart() {
    let net = node(0x0001, 100);
    let storage = MemoryStorage::new();
    let friendship = Friendship {
        net_idx: 0,
        peer: 0x0100,
        own_addr: 0x0001,
        role: FriendRole::LowPower,
        lpn_counter: 1,
        friend_counter: 2,
    };
    net.add_friend_cred(friendship, SimInstant::ZERO).unwrap();
    let friend_nid = net.with_keyring(|keyring| {
        keyring.friends().get(0, 0x0100).unwrap().active().nid()
    });

    let now = SimInstant::hours(2);
    let net = restart(&net, &storage, now);
    net.with_keyring(|keyring| {
        let cred = keyring.friends().get(0, 0x0100).unwrap();
        assert_eq!(cred.friendship(), &friendship);
        assert_eq!(cred.active().nid(), friend_nid);
    });
    assert_eq!(net.next_deadline(), Some(now + Duration::from_secs(10)));
}

#[test]
fn corrupted_snapshot_is_refused() {
    let net = node(0x0001, 100);
    let storage = MemoryStorage::new();
    net.persist(&storage).unwrap();

    let mut snapshot = storage.load_snapshot().unwrap().unwrap();
    snapshot.subnets[0].phase = KeyRefreshPhase::Phase2;
    storage.save_snapshot(&snapshot).unwrap();

    let result: Result<Option<SimNet>, _> =
        MeshNet::load(NetConfig::new(0x0001), &storage, SimInstant::ZERO);
    assert!(matches!(result, Err(NetError::Storage(_))));
}
