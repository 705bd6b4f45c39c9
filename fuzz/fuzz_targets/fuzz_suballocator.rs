//! Fuzz target for the ring suballocator.
//!
//! Drives acquire and out-of-order release sequences and checks that live
//! spans stay inside the extent and never overlap.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pathring_core::suballocator::{Span, Suballocator};

#[derive(Debug, Arbitrary)]
enum AllocOp {
    /// Acquire a span of `words` words.
    Acquire { words: u16 },
    /// Release the live span at `index % live.len()`.
    Release { index: u8 },
    /// Release a span id that may not be live.
    ReleaseRaw { id: u32 },
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    /// Ring size, 1 << (blocks_log2 % 8).
    blocks_log2: u8,
    /// Words per block, at least 1.
    block_words: u8,
    ops: Vec<AllocOp>,
}

fn overlaps(a: &Span, b: &Span) -> bool {
    a.offset < b.offset + b.size && b.offset < a.offset + a.size
}

fuzz_target!(|input: FuzzInput| {
    if input.ops.len() > 1000 {
        return;
    }
    let blocks = 1u32 << (input.blocks_log2 % 8);
    let block_words = u32::from(input.block_words).max(1);
    let Ok(mut alloc) = Suballocator::new(blocks, block_words) else {
        return;
    };
    let capacity = alloc.capacity_words();
    let mut live: Vec<Span> = Vec::new();

    for op in &input.ops {
        match op {
            AllocOp::Acquire { words } => match alloc.try_acquire(usize::from(*words)) {
                Ok(Some(span)) => {
                    assert!(span.offset + span.size <= capacity, "span {span:?} leaves the extent");
                    assert!(span.size >= usize::from(*words));
                    for other in &live {
                        assert!(!overlaps(&span, other), "{span:?} overlaps {other:?}");
                    }
                    live.push(span);
                }
                Ok(None) => {}
                Err(_) => assert!(usize::from(*words) > capacity),
            },
            AllocOp::Release { index } => {
                if live.is_empty() {
                    continue;
                }
                let span = live.swap_remove(usize::from(*index) % live.len());
                alloc.release(span.id).expect("live span must release");
            }
            AllocOp::ReleaseRaw { id } => {
                let is_live = live.iter().any(|s| s.id == *id);
                let result = alloc.release(*id);
                assert_eq!(result.is_ok(), is_live);
                if is_live {
                    live.retain(|s| s.id != *id);
                }
            }
        }
    }

    for span in live.drain(..) {
        alloc.release(span.id).expect("live span must release");
    }
    assert!(alloc.is_idle(), "all spans released but ring not idle");
});
