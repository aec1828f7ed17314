//! Fuzz target for snapshot decoding and restore
//!
//! Storage is outside the node's trust boundary once a disk can be swapped
//! or corrupted. Looks for:
//! - Panics in CBOR decoding of hostile input
//! - Panics while rebuilding a node from an inconsistent snapshot
//! - Restored nodes that lose their IV state or sequence number
//!
//! The fuzzer should NEVER panic. Invalid snapshots must return an error.

#![no_main]

use std::time::Instant;

use libfuzzer_sys::fuzz_target;
use meshnet_core::{
    storage::{decode_snapshot, encode_snapshot},
    MeshNet, NetConfig,
};

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = decode_snapshot(data) else {
        return;
    };
    let Ok(bytes) = encode_snapshot(&snapshot) else {
        panic!("decoded snapshot failed to encode");
    };
    assert_eq!(decode_snapshot(&bytes).ok().as_ref(), Some(&snapshot));

    let restored: Result<MeshNet, _> =
        MeshNet::restore(NetConfig::new(0x0001), &snapshot, Instant::now());
    if let Ok(net) = restored {
        let again = net.snapshot();
        assert_eq!(again.iv_index, snapshot.iv_index);
        assert_eq!(again.iv_update, snapshot.iv_update);
        assert_eq!(again.seq, snapshot.seq);
    }
});
