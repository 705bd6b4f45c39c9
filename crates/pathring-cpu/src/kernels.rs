//! Kernel bodies run by the device worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use pathring_core::block::{CopyCommand, CopyTag, PathHeader, TaggedBlockRef, HEAD_WORDS};
use pathring_core::device::{BufferId, Kernel, PathsCopy, RasterCmd};
use tracing::{debug, trace};

use crate::block_pool::BlockPool;
use crate::inspect::{self, Layout};

/// What a raster build recorded for one raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterInfo {
    /// Paths the raster read.
    pub paths: u32,
    /// Sum of the paths' lane batch counts.
    pub prims: u32,
    /// Union of the paths' bounds.
    pub bounds: [f32; 4],
}

/// Storage of a device buffer.
#[derive(Debug)]
pub(crate) enum BufferSlot {
    Resident(Vec<u32>),
    /// Storage is on the host.
    Mapped,
}

/// Everything the kernels read and write.
#[derive(Debug)]
pub(crate) struct DeviceMemory {
    pub layout: Layout,
    pub buffers: HashMap<BufferId, BufferSlot>,
    pub pool: BlockPool,
    /// Untyped path handle to head block.
    pub handle_map: HashMap<u32, u32>,
    pub rasters: HashMap<u32, RasterInfo>,
    /// Scratch slots filled by an alloc and not yet consumed by a copy.
    pub allocated: HashSet<(BufferId, u32)>,
}

/// Device counters, updated by the worker.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub kernels: AtomicU64,
    pub failures: AtomicU64,
    pub blocks_copied: AtomicU64,
    pub paths_published: AtomicU64,
    pub paths_reclaimed: AtomicU64,
    pub rasters_built: AtomicU64,
}

fn resident(buffers: &HashMap<BufferId, BufferSlot>, id: BufferId) -> Result<&Vec<u32>, String> {
    match buffers.get(&id) {
        Some(BufferSlot::Resident(words)) => Ok(words),
        Some(BufferSlot::Mapped) => Err(format!("buffer {} is mapped", id.0)),
        None => Err(format!("unknown buffer {}", id.0)),
    }
}

fn resident_mut(
    buffers: &mut HashMap<BufferId, BufferSlot>,
    id: BufferId,
) -> Result<&mut Vec<u32>, String> {
    match buffers.get_mut(&id) {
        Some(BufferSlot::Resident(words)) => Ok(words),
        Some(BufferSlot::Mapped) => Err(format!("buffer {} is mapped", id.0)),
        None => Err(format!("unknown buffer {}", id.0)),
    }
}

/// Runs one kernel against device memory.
pub(crate) fn execute(mem: &mut DeviceMemory, kernel: &Kernel, counters: &Counters) -> Result<(), String> {
    counters.kernels.fetch_add(1, Ordering::Relaxed);
    match kernel {
        Kernel::PathsAlloc {
            reads,
            slot,
            blocks,
        } => paths_alloc(mem, *reads, *slot, *blocks),
        Kernel::PathsCopy(copy) => paths_copy(mem, copy, counters),
        Kernel::PathsReclaim { handles } => paths_reclaim(mem, handles, counters),
        Kernel::RastersReclaim { handles } => {
            for handle in handles {
                mem.rasters
                    .remove(handle)
                    .ok_or_else(|| format!("reclaim of unknown raster {handle}"))?;
            }
            Ok(())
        }
        Kernel::RastersBuild { paths, rasters } => rasters_build(mem, paths, rasters, counters),
    }
}

fn paths_alloc(mem: &mut DeviceMemory, reads: BufferId, slot: u32, blocks: u32) -> Result<(), String> {
    let ids = mem
        .pool
        .alloc(blocks)
        .ok_or_else(|| format!("block pool exhausted: {blocks} requested, {} free", mem.pool.available()))?;
    let words = resident_mut(&mut mem.buffers, reads)?;
    let slot = slot as usize;
    words
        .get_mut(slot..slot + ids.len())
        .ok_or_else(|| "alloc slot outside the scratch buffer".to_string())?
        .copy_from_slice(&ids);
    mem.allocated.insert((reads, slot as u32));
    Ok(())
}

fn paths_copy(mem: &mut DeviceMemory, copy: &PathsCopy, counters: &Counters) -> Result<(), String> {
    let bw = mem.layout.block_words;
    let spb = mem.layout.subblocks_per_block();
    let bps = copy.ring.blocks_per_subbuf;
    let ring_blocks = copy.ring.blocks.len() as u32 * bps;
    let count = copy.blocks();

    if !mem.allocated.remove(&(copy.reads, copy.slot)) {
        return Err(format!("copy from slot {} without a completed alloc", copy.slot));
    }
    let slot = copy.slot as usize;
    let ids = resident(&mem.buffers, copy.reads)?
        .get(slot..slot + count as usize)
        .ok_or_else(|| "copy slot outside the scratch buffer".to_string())?
        .to_vec();

    // rolling id -> pool block id
    let translate = |rolling: u32| -> Result<u32, String> {
        let offset = (rolling + ring_blocks - copy.rolling_base) % ring_blocks;
        ids.get(offset as usize)
            .copied()
            .ok_or_else(|| format!("rolling id {rolling} outside launch at {}", copy.rolling_base))
    };

    for span in [copy.prev, copy.curr] {
        for i in 0..span.count {
            let pos = (span.from + i) % ring_blocks;
            let (s, b) = ((pos / bps) as usize, (pos % bps) as usize);
            let cmd = CopyCommand::from_raw(resident(&mem.buffers, copy.ring.cmds[s])?[b]);
            let tag = cmd
                .tag()
                .ok_or_else(|| format!("bad copy command {:#x} at {pos}", cmd.raw()))?;
            let dst = translate(cmd.rolling())?;

            let src = resident(&mem.buffers, copy.ring.blocks[s])?;
            let block = mem.pool.block_mut(dst);
            block.copy_from_slice(&src[b * bw..(b + 1) * bw]);

            let first = match tag {
                CopyTag::Segs => continue,
                CopyTag::Node => 0,
                CopyTag::Head => HEAD_WORDS,
            };
            for word in &mut block[first..] {
                let id = TaggedBlockRef::from_raw(*word);
                if id.is_invalid() {
                    continue;
                }
                let pool_block = translate(id.index() / spb)?;
                *word = id.with_index(pool_block * spb + id.index() % spb).raw();
            }
            if tag == CopyTag::Head {
                let header = PathHeader::read(block);
                mem.handle_map.insert(header.handle, dst);
                counters.paths_published.fetch_add(1, Ordering::Relaxed);
                trace!(handle = header.handle, head = dst, "path published");
            }
        }
    }
    counters
        .blocks_copied
        .fetch_add(u64::from(count), Ordering::Relaxed);
    debug!(blocks = count, "paths copied");
    Ok(())
}

fn paths_reclaim(mem: &mut DeviceMemory, handles: &[u32], counters: &Counters) -> Result<(), String> {
    for &handle in handles {
        let head = mem
            .handle_map
            .remove(&handle)
            .ok_or_else(|| format!("reclaim of unpublished path {handle}"))?;
        let walk = inspect::walk(&mem.pool, mem.layout, head)?;
        if walk.blocks.len() != walk.header.blocks as usize {
            return Err(format!(
                "path {handle} spans {} blocks, header says {}",
                walk.blocks.len(),
                walk.header.blocks
            ));
        }
        let blocks: Vec<u32> = walk.blocks.into_iter().collect();
        mem.pool.free(&blocks);
        counters.paths_reclaimed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

fn rasters_build(
    mem: &mut DeviceMemory,
    paths: &[u32],
    rasters: &[RasterCmd],
    counters: &Counters,
) -> Result<(), String> {
    for cmd in rasters {
        let first = cmd.first as usize;
        let list = paths
            .get(first..first + cmd.count as usize)
            .ok_or_else(|| format!("raster {} path list out of range", cmd.raster))?;
        let mut info = RasterInfo {
            paths: cmd.count,
            prims: 0,
            bounds: PathHeader::EMPTY_BOUNDS,
        };
        for &path in list {
            let head = mem
                .handle_map
                .get(&path)
                .ok_or_else(|| format!("raster {} reads unpublished path {path}", cmd.raster))?;
            let header = PathHeader::read(mem.pool.block(*head));
            info.prims += header.prims;
            info.bounds[0] = info.bounds[0].min(header.bounds[0]);
            info.bounds[1] = info.bounds[1].min(header.bounds[1]);
            info.bounds[2] = info.bounds[2].max(header.bounds[2]);
            info.bounds[3] = info.bounds[3].max(header.bounds[3]);
        }
        mem.rasters.insert(cmd.raster, info);
        counters.rasters_built.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}
