//! Fuzz target for the replay ledger
//!
//! # Invariants
//!
//! - A PDU is accepted only if `(new IV, seq)` is strictly greater than the
//!   stored value for its source
//! - A rejected PDU leaves the ledger unchanged
//! - The ledger never holds more entries than its capacity
//! - IV Update reset drops old entries and marks the rest old

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use meshnet_core::ReplayLedger;

const CAPACITY: usize = 8;

#[derive(Debug, Arbitrary)]
enum Op {
    Receive { src: u8, seq: u32, old_iv: bool },
    IvUpdate,
    Clear,
}

fuzz_target!(|ops: Vec<Op>| {
    let mut ledger = ReplayLedger::new(CAPACITY);
    // Model of entries that cannot have been evicted: only checked while
    // the table never filled up
    let mut model: HashMap<u16, (bool, u32)> = HashMap::new();
    let mut evictions_possible = false;

    for op in ops {
        match op {
            Op::Receive { src, seq, old_iv } => {
                let src = u16::from(src % 16) + 1;
                let seq = seq & 0x00FF_FFFF;
                let before = ledger.get(src).copied();
                let accepted = ledger.check_and_record(src, seq, old_iv).is_ok();

                if let Some(entry) = before {
                    let advances = (!old_iv, seq) > (!entry.old_iv, entry.seq);
                    assert_eq!(accepted, advances);
                    if !accepted {
                        assert_eq!(ledger.get(src).copied(), Some(entry));
                    }
                } else if !evictions_possible {
                    assert!(accepted);
                    assert!(!model.contains_key(&src));
                }

                if accepted {
                    model.insert(src, (old_iv, seq));
                }
                if ledger.len() == CAPACITY {
                    evictions_possible = true;
                }
            },
            Op::IvUpdate => {
                ledger.reset_for_iv_update();
                model.retain(|_, (old_iv, _)| !*old_iv);
                for (old_iv, _) in model.values_mut() {
                    *old_iv = true;
                }
                for entry in ledger.entries() {
                    assert!(entry.old_iv);
                }
            },
            Op::Clear => {
                ledger.clear();
                model.clear();
                evictions_possible = false;
            },
        }

        assert!(ledger.len() <= CAPACITY);
        if !evictions_possible {
            for (src, (old_iv, seq)) in &model {
                let entry = ledger.get(*src).copied();
                assert_eq!(entry.map(|e| (e.old_iv, e.seq)), Some((*old_iv, *seq)));
            }
        }
    }
});
