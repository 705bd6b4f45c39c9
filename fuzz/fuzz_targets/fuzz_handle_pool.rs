//! Fuzz target for the handle pool.
//!
//! Mixes host and device reference operations with reclamation and checks
//! that every handle is either live, pending reclamation or available.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pathring_core::config::HandlePoolConfig;
use pathring_core::handle::{Handle, HandleType, Path, Raster, TypedHandle};
use pathring_core::handle_pool::HandlePool;

#[derive(Debug, Arbitrary)]
enum PoolOp {
    Acquire { raster: bool },
    Retain { index: u8 },
    Release { index: u8 },
    DeviceRetain { index: u8 },
    DeviceRelease { index: u8 },
    /// Forged raw value, possibly with the wrong type guard.
    ReleaseRaw { raw: u32, raster: bool },
    FlushPartial,
    CompleteReclaims,
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    ops: Vec<PoolOp>,
}

fn typed(h: Handle, ty: HandleType) -> u32 {
    match ty {
        HandleType::Path => Path::from_handle(h).raw(),
        HandleType::Raster => Raster::from_handle(h).raw(),
    }
}

fuzz_target!(|input: FuzzInput| {
    if input.ops.len() > 2000 {
        return;
    }
    let config = HandlePoolConfig {
        handles: 32,
        block_width: 4,
        reclaim_records: 2,
    };
    let Ok(mut pool) = HandlePool::new(&config) else {
        return;
    };
    // handles acquired and not yet reclaimed, with their type
    let mut issued: Vec<(Handle, HandleType)> = Vec::new();
    let mut in_flight = Vec::new();

    let pick = |issued: &[(Handle, HandleType)], index: u8| {
        (!issued.is_empty()).then(|| issued[usize::from(index) % issued.len()])
    };

    for op in &input.ops {
        match op {
            PoolOp::Acquire { raster } => {
                if let Some(h) = pool.try_acquire() {
                    assert!(issued.iter().all(|&(i, _)| i != h), "handle {h} issued twice");
                    let ty = if *raster { HandleType::Raster } else { HandleType::Path };
                    issued.push((h, ty));
                }
            }
            PoolOp::Retain { index } => {
                if let Some((h, ty)) = pick(&issued, *index) {
                    let _ = pool.retain(&[typed(h, ty)], ty);
                }
            }
            PoolOp::Release { index } => {
                if let Some((h, ty)) = pick(&issued, *index) {
                    let _ = pool.release(&[typed(h, ty)], ty);
                }
            }
            PoolOp::DeviceRetain { index } => {
                if let Some((h, ty)) = pick(&issued, *index) {
                    let _ = pool.device_retain(&[typed(h, ty)], ty);
                }
            }
            PoolOp::DeviceRelease { index } => {
                if let Some((h, ty)) = pick(&issued, *index) {
                    let device = pool.refcount(h).map(|rc| rc.device()).unwrap_or(0);
                    if device > 0 {
                        let _ = pool.device_release(&[h], ty);
                    }
                }
            }
            PoolOp::ReleaseRaw { raw, raster } => {
                let ty = if *raster { HandleType::Raster } else { HandleType::Path };
                let before: Vec<_> = issued.iter().map(|&(h, _)| pool.refcount(h)).collect();
                if pool.release(&[*raw], ty).is_err() {
                    let after: Vec<_> = issued.iter().map(|&(h, _)| pool.refcount(h)).collect();
                    assert_eq!(before, after, "failed release mutated counts");
                }
            }
            PoolOp::FlushPartial => pool.flush_partial(),
            PoolOp::CompleteReclaims => {
                in_flight.extend(pool.take_ready());
                for batch in in_flight.drain(..) {
                    for h in &batch.handles {
                        let rc = pool.refcount(*h).expect("reclaimed handle in range");
                        assert!(rc.is_zero(), "reclaiming live handle {h}");
                        issued.retain(|&(i, _)| i != *h);
                    }
                    pool.reclaim_complete(batch.record).expect("known record");
                }
            }
        }
        assert!(pool.available() + issued.len() <= config.handles as usize);
    }
});
