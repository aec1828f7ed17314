//! Fuzz target for the network PDU receive path
//!
//! Feeds arbitrary bytes to `MeshNet::decode` on every interface and to the
//! secure beacon parser. Looks for:
//! - Panics on short, long or malformed PDUs
//! - Out-of-bounds slicing in header deobfuscation
//! - Decoded payloads longer than the PDU that carried them
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use std::time::Instant;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshnet_core::{MeshNet, NetConfig, NetInterface, SecureBeacon};

#[derive(Debug, Arbitrary)]
struct Input {
    iv_index: u32,
    in_progress: bool,
    interface: u8,
    pdu: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let now = Instant::now();
    let net: MeshNet = MeshNet::new(NetConfig::new(0x0001), input.iv_index, now);
    if net.create_subnet(0, &[0x7D; 16]).is_err() {
        return;
    }
    if input.in_progress {
        let _ = net.start_iv_update(now);
    }

    let net_if = match input.interface % 4 {
        0 => NetInterface::Adv,
        1 => NetInterface::Local,
        2 => NetInterface::Proxy,
        _ => NetInterface::ProxyCfg,
    };

    // Only subnet 0 exists
    if let Ok((rx, payload)) = net.decode(&input.pdu, net_if, 0, now) {
        assert!(payload.len() + 9 <= input.pdu.len());
        assert_eq!(rx.net_idx, 0);
    }

    if let Ok(beacon) = SecureBeacon::parse(&input.pdu) {
        assert_eq!(beacon.to_bytes().as_slice(), input.pdu.as_slice());
        let _ = net.on_secure_beacon(&beacon, now);
    }
});
