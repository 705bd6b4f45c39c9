//! Streaming path encoder.
//!
//! Paths are encoded straight into a ring of host-mapped blocks split into
//! subbuffers. Three windows over the ring are tracked:
//!
//! - `prev`: blocks of the path that was in progress at the last launch.
//!   They are already unmapped and are copied by the next launch.
//! - `curr`: blocks of paths completed since the last launch.
//! - `wip`: the write position, ahead of `curr`.
//!
//! Each path ends with its head block. Ending a path maps its handle onto the
//! grid of the release record for the subbuffer holding `curr.from`; once the
//! write position has left that subbuffer the grid is started, so the device
//! consumes finished subbuffers while the host keeps encoding. The grid's
//! waiting callback unmaps the written subbuffers, launches the alloc and copy
//! kernels and remaps every subbuffer that no longer holds pending data.
//!
//! Blocks carry *rolling* ids assigned in reservation order. References
//! written by the host use rolling ids; the copy kernel rewrites them into
//! device pool block ids.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::block::{
    coord_word, BlockTag, CopyCommand, CopyTag, PathHeader, SegmentKind, TaggedBlockRef,
    HEAD_WORDS, LANE_PAD,
};
use crate::device::{BufferId, CompletionToken, Kernel, PathsCopy, RingBuffers, RingSpan};
use crate::error::{PathRingError, Result};
use crate::grid::{GridId, GridOwner, OwnerId};
use crate::handle::{Handle, HandleType, Path, TypedHandle};
use crate::ringdex::{Cursor, RingGeometry};
use crate::runtime::{CompletionAction, Runtime, SharedRuntime};

/// Capabilities of a path builder backend.
pub trait PathBuilderImpl: GridOwner {
    /// Starts a path.
    fn begin(&mut self, rt: &mut Runtime) -> Result<()>;

    /// Reserves a fresh lane batch for `kind`, padding the current one.
    fn new_segment(&mut self, rt: &mut Runtime, kind: SegmentKind) -> Result<()>;

    /// Stores one segment of `kind`. `coords` holds `kind.components()`
    /// values.
    fn segment(&mut self, rt: &mut Runtime, kind: SegmentKind, coords: &[f32]) -> Result<()>;

    /// Finishes the path and returns its handle.
    fn end(&mut self, rt: &mut Runtime) -> Result<Path>;

    /// Flushes finished paths, waits for their launches to complete and
    /// frees the builder's device buffers.
    fn release(&mut self, rt: &mut Runtime) -> Result<()>;

    /// Statistics snapshot.
    fn stats(&self) -> PathBuilderStats;
}

/// Path builder statistics.
#[derive(Debug, Clone, Default)]
pub struct PathBuilderStats {
    /// Paths ended.
    pub paths: u64,
    /// Lane batches reserved.
    pub prims: u64,
    /// Ring blocks written.
    pub blocks: u64,
    /// Copy launches.
    pub launches: u64,
}

#[derive(Debug)]
enum SubbufState {
    /// Mapped; the host owns the storage.
    Host { blocks: Vec<u32>, cmds: Vec<u32> },
    /// Unmapped and holding data not yet copied.
    Device,
    /// Map enqueued.
    Pending {
        blocks: CompletionToken,
        cmds: CompletionToken,
    },
}

#[derive(Debug)]
struct Subbuf {
    blocks: BufferId,
    cmds: BufferId,
    state: SubbufState,
}

/// Handles of the paths whose blocks start in one subbuffer, as a wrapping
/// span of `release_paths`.
#[derive(Debug, Clone, Copy)]
struct ReleaseRecord {
    from: u32,
    to: u32,
    grid: Option<GridId>,
}

impl ReleaseRecord {
    fn is_busy(&self) -> bool {
        self.from != self.to
    }
}

/// Location of a coordinate subblock in the ring.
#[derive(Debug, Clone, Copy)]
struct WordRef {
    subbuf: u32,
    word: usize,
}

/// A reserved lane batch: one subblock per coordinate component.
#[derive(Debug, Clone, Default)]
struct Lane {
    coords: Vec<WordRef>,
    /// Lanes not yet written.
    rem: usize,
}

/// Current segments block.
#[derive(Debug, Clone, Copy, Default)]
struct SegsCursor {
    subbuf: u32,
    block: u32,
    rolling: u32,
    next: u32,
    rem: u32,
}

/// Next free reference slot of the current node.
#[derive(Debug, Clone, Copy, Default)]
struct IdCursor {
    next: usize,
    rem: usize,
}

fn host_mut(subbufs: &mut [Subbuf], subbuf: u32) -> Result<(&mut Vec<u32>, &mut Vec<u32>)> {
    match subbufs.get_mut(subbuf as usize).map(|s| &mut s.state) {
        Some(SubbufState::Host { blocks, cmds }) => Ok((blocks, cmds)),
        _ => Err(PathRingError::device(format!(
            "ring subbuffer {subbuf} is not host mapped"
        ))),
    }
}

/// Path builder over a host-mapped block ring.
pub struct RingPathBuilder {
    id: OwnerId,
    geo: RingGeometry,
    block_words: usize,
    subblock_words: usize,
    subblocks_per_block: u32,

    subbufs: Vec<Subbuf>,
    ring: RingBuffers,
    /// Scratch buffer for allocated pool block ids, one slot per record.
    reads: BufferId,
    release: Vec<ReleaseRecord>,
    release_paths: Vec<Handle>,

    prev: Cursor,
    curr: Cursor,
    /// Write position.
    wip: u32,
    /// Rolling id of the first block of the next launch.
    launch_rolling: u32,
    /// Rolling id one past the last completed path.
    curr_rolling_to: u32,
    rolling_next: u32,

    in_path: bool,
    head: Vec<u32>,
    node: Vec<u32>,
    ids: IdCursor,
    nodes: u32,
    node_rolling: u32,
    blocks: u32,
    header: PathHeader,
    segs: SegsCursor,
    lanes: [Lane; 3],

    /// Set while a reservation or path end is in progress.
    busy: bool,
    poisoned: Option<PathRingError>,
    released: bool,
    stats: PathBuilderStats,
}

impl std::fmt::Debug for RingPathBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPathBuilder")
            .field("id", &self.id)
            .field("prev", &self.prev)
            .field("curr", &self.curr)
            .field("wip", &self.wip)
            .field("in_path", &self.in_path)
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl RingPathBuilder {
    /// Creates the ring buffers and maps every subbuffer.
    pub fn new(rt: &mut Runtime, id: OwnerId) -> Result<Self> {
        let config = *rt.config();
        let geo = RingGeometry::from_config(&config.ring);
        let block_words = config.block.block_words as usize;
        let subblock_words = config.block.subblock_words as usize;
        let bps = geo.blocks_per_subbuf as usize;

        let device = rt.device().clone();
        let queue = rt.acquire_queue()?;
        let mut subbufs = Vec::with_capacity(geo.subbufs as usize);
        for _ in 0..geo.subbufs {
            let blocks = device.create_buffer(bps * block_words)?;
            let cmds = device.create_buffer(bps)?;
            let state = SubbufState::Pending {
                blocks: device.map_buffer(queue, blocks)?,
                cmds: device.map_buffer(queue, cmds)?,
            };
            subbufs.push(Subbuf {
                blocks,
                cmds,
                state,
            });
        }
        device.flush(queue)?;
        rt.release_queue(queue);

        let reads = device.create_buffer(geo.subbufs as usize * geo.blocks() as usize)?;
        let ring = RingBuffers {
            blocks: subbufs.iter().map(|s| s.blocks).collect(),
            cmds: subbufs.iter().map(|s| s.cmds).collect(),
            blocks_per_subbuf: geo.blocks_per_subbuf,
        };
        let release = (0..geo.subbufs)
            .map(|i| ReleaseRecord {
                from: i * geo.blocks_per_subbuf,
                to: i * geo.blocks_per_subbuf,
                grid: None,
            })
            .collect();

        debug!(
            owner = id.0,
            subbufs = geo.subbufs,
            blocks_per_subbuf = geo.blocks_per_subbuf,
            "ring path builder created"
        );

        Ok(Self {
            id,
            geo,
            block_words,
            subblock_words,
            subblocks_per_block: config.block.subblocks_per_block(),
            subbufs,
            ring,
            reads,
            release,
            release_paths: vec![0; geo.blocks() as usize],
            prev: Cursor::default(),
            curr: Cursor::default(),
            wip: 0,
            launch_rolling: 0,
            curr_rolling_to: 0,
            rolling_next: 0,
            in_path: false,
            head: vec![TaggedBlockRef::INVALID.raw(); block_words],
            node: vec![TaggedBlockRef::INVALID.raw(); block_words],
            ids: IdCursor::default(),
            nodes: 0,
            node_rolling: 0,
            blocks: 0,
            header: PathHeader::new(),
            segs: SegsCursor::default(),
            lanes: Default::default(),
            busy: false,
            poisoned: None,
            released: false,
            stats: PathBuilderStats::default(),
        })
    }

    fn check(&self) -> Result<()> {
        if self.released {
            return Err(PathRingError::ReleasedBuilder);
        }
        match &self.poisoned {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: PathRingError) -> PathRingError {
        if err.is_fatal() && self.poisoned.is_none() {
            warn!(owner = self.id.0, error = %err, "path builder poisoned");
            self.poisoned = Some(err.clone());
        }
        err
    }

    fn origin(&self) -> u32 {
        if self.prev.is_empty() {
            self.curr.from
        } else {
            self.prev.from
        }
    }

    fn reserve_rolling(&mut self) -> u32 {
        let rolling = self.rolling_next;
        self.rolling_next = self.geo.inc(rolling);
        self.blocks += 1;
        rolling
    }

    fn current_grid(&self) -> Option<GridId> {
        self.release[self.geo.subbuf(self.curr.from) as usize].grid
    }

    // ring

    /// Claims the block at the write position, waiting for its subbuffer to
    /// be released and remapped when the position enters a new subbuffer.
    fn acquire_block(&mut self, rt: &mut Runtime) -> Result<(u32, u32)> {
        loop {
            let next = self.wip;
            let rd = self.geo.expand(next);
            let origin = self.origin();
            let used = self.geo.span(origin, next);
            let overrun = used + 1 >= self.geo.blocks()
                || (rd.block == 0 && used > 0 && rd.subbuf == self.geo.subbuf(origin));
            if overrun {
                return Err(PathRingError::RingOverrun {
                    ring_blocks: self.geo.blocks(),
                });
            }

            if rd.block == 0 {
                if self.release[rd.subbuf as usize].is_busy() {
                    rt.yield_now(Some(self))?;
                    continue;
                }
                let sb = &mut self.subbufs[rd.subbuf as usize];
                match std::mem::replace(&mut sb.state, SubbufState::Device) {
                    SubbufState::Pending { blocks, cmds } => {
                        let device = rt.device();
                        device.wait(blocks)?;
                        device.wait(cmds)?;
                        sb.state = SubbufState::Host {
                            blocks: device.take_mapping(sb.blocks)?,
                            cmds: device.take_mapping(sb.cmds)?,
                        };
                        trace!(subbuf = rd.subbuf, "subbuffer mapped");
                    }
                    SubbufState::Device => {
                        return Err(PathRingError::RingOverrun {
                            ring_blocks: self.geo.blocks(),
                        });
                    }
                    host => sb.state = host,
                }
            }

            self.wip = self.geo.inc(next);
            let bw = self.block_words;
            let (blocks, _) = host_mut(&mut self.subbufs, rd.subbuf)?;
            let base = rd.block as usize * bw;
            blocks[base..base + bw].fill(0);
            self.stats.blocks += 1;
            trace!(pos = next, subbuf = rd.subbuf, block = rd.block, "ring block");
            return Ok((rd.subbuf, rd.block));
        }
    }

    fn write_cmd(&mut self, subbuf: u32, block: u32, cmd: CopyCommand) -> Result<()> {
        let (_, cmds) = host_mut(&mut self.subbufs, subbuf)?;
        cmds[block as usize] = cmd.raw();
        Ok(())
    }

    fn write_id(&mut self, id: TaggedBlockRef) {
        debug_assert!(self.ids.rem > 0);
        let node = if self.nodes == 0 {
            &mut self.head
        } else {
            &mut self.node
        };
        node[self.ids.next] = id.raw();
        self.ids.next += 1;
        self.ids.rem -= 1;
    }

    /// Copies a finished node or head into the ring.
    fn flush_node_words(&mut self, rt: &mut Runtime, tag: CopyTag, rolling: u32) -> Result<()> {
        let (subbuf, block) = self.acquire_block(rt)?;
        let bw = self.block_words;
        let words = if tag == CopyTag::Head {
            &self.head
        } else {
            &self.node
        };
        let base = block as usize * bw;
        match &mut self.subbufs[subbuf as usize].state {
            SubbufState::Host { blocks, .. } => blocks[base..base + bw].copy_from_slice(words),
            _ => return Err(PathRingError::device("ring subbuffer is not host mapped")),
        }
        self.write_cmd(subbuf, block, CopyCommand::new(tag, rolling))
    }

    fn new_node_block(&mut self, rt: &mut Runtime) -> Result<()> {
        let rolling = self.reserve_rolling();
        self.write_id(TaggedBlockRef::new(
            BlockTag::Next,
            rolling * self.subblocks_per_block,
        ));
        if self.nodes > 0 {
            self.flush_node_words(rt, CopyTag::Node, self.node_rolling)?;
        }
        self.node.fill(TaggedBlockRef::INVALID.raw());
        self.nodes += 1;
        self.node_rolling = rolling;
        self.ids = IdCursor {
            next: 0,
            rem: self.block_words,
        };
        Ok(())
    }

    fn new_segs_block(&mut self, rt: &mut Runtime) -> Result<()> {
        let (subbuf, block) = self.acquire_block(rt)?;
        let rolling = self.reserve_rolling();
        self.write_cmd(subbuf, block, CopyCommand::new(CopyTag::Segs, rolling))?;
        self.segs = SegsCursor {
            subbuf,
            block,
            rolling,
            next: 0,
            rem: self.subblocks_per_block,
        };
        Ok(())
    }

    /// Reserves one subblock per component of `kind`, recording a reference
    /// to each run of subblocks in the current node.
    fn acquire_subblocks(&mut self, rt: &mut Runtime, kind: SegmentKind) -> Result<Vec<WordRef>> {
        let n = kind.components();
        let mut coords = Vec::with_capacity(n);
        let mut tag = kind.tag();
        while coords.len() < n {
            if self.ids.rem == 1 {
                self.new_node_block(rt)?;
            }
            if self.segs.rem == 0 {
                self.new_segs_block(rt)?;
            }
            let take = (n - coords.len()).min(self.segs.rem as usize) as u32;
            let index = self.segs.rolling * self.subblocks_per_block + self.segs.next;
            self.write_id(TaggedBlockRef::new(tag, index));
            for i in 0..take {
                coords.push(WordRef {
                    subbuf: self.segs.subbuf,
                    word: self.segs.block as usize * self.block_words
                        + (self.segs.next + i) as usize * self.subblock_words,
                });
            }
            self.segs.next += take;
            self.segs.rem -= take;
            tag = BlockTag::Next;
        }
        Ok(coords)
    }

    fn reserve_lanes(&mut self, rt: &mut Runtime, kind: SegmentKind, lane: usize) -> Result<()> {
        self.pad_lane(lane)?;
        self.busy = true;
        let coords = self.acquire_subblocks(rt, kind);
        self.busy = false;
        self.lanes[lane] = Lane {
            coords: coords?,
            rem: self.subblock_words,
        };
        self.header.prims += 1;
        self.stats.prims += 1;
        Ok(())
    }

    /// Pads the unwritten lanes of a batch.
    fn pad_lane(&mut self, lane: usize) -> Result<()> {
        let rem = self.lanes[lane].rem;
        if rem == 0 {
            return Ok(());
        }
        let start = self.subblock_words - rem;
        for c in 0..self.lanes[lane].coords.len() {
            let at = self.lanes[lane].coords[c];
            let (blocks, _) = host_mut(&mut self.subbufs, at.subbuf)?;
            blocks[at.word + start..at.word + self.subblock_words].fill(LANE_PAD);
        }
        self.lanes[lane].rem = 0;
        Ok(())
    }

    fn pad_lanes(&mut self) -> Result<()> {
        (0..self.lanes.len()).try_for_each(|lane| self.pad_lane(lane))
    }

    fn reset_path(&mut self) {
        self.head.fill(TaggedBlockRef::INVALID.raw());
        self.ids = IdCursor {
            next: HEAD_WORDS,
            rem: self.block_words - HEAD_WORDS,
        };
        self.nodes = 0;
        self.node_rolling = 0;
        self.blocks = 0;
        self.header = PathHeader::new();
        self.segs.rem = 0;
        for lane in &mut self.lanes {
            lane.rem = 0;
        }
    }

    fn acquire_path_handle(&mut self, rt: &mut Runtime) -> Result<Handle> {
        // handles held by our own unlaunched record cannot come back otherwise
        if rt.handles().available() == 0 {
            if let Some(grid) = self.current_grid() {
                rt.grids_mut().start(grid);
            }
        }
        rt.acquire_handle(Some(self))
    }

    fn finish_path(&mut self, rt: &mut Runtime, handle: Handle) -> Result<Path> {
        self.pad_lanes()?;

        let invalid = TaggedBlockRef::INVALID.raw();
        if self.nodes == 0 {
            self.head[self.ids.next..].fill(invalid);
        } else {
            self.node[self.ids.next..].fill(invalid);
            self.flush_node_words(rt, CopyTag::Node, self.node_rolling)?;
        }

        let rolling = self.reserve_rolling();
        self.header.handle = handle;
        self.header.blocks = self.blocks;
        self.header.nodes = self.nodes;
        self.header.write(&mut self.head);
        self.flush_node_words(rt, CopyTag::Head, rolling)?;

        self.curr.to = self.wip;
        self.curr_rolling_to = self.rolling_next;

        let record = self.geo.subbuf(self.curr.from) as usize;
        let grid = match self.release[record].grid {
            Some(grid) => grid,
            None => {
                let grid = rt.attach(self.id, record, Some(self))?;
                self.release[record].grid = Some(grid);
                grid
            }
        };
        rt.grids_mut().map(grid, handle)?;
        let slot = self.release[record].to;
        self.release_paths[slot as usize] = handle;
        self.release[record].to = self.geo.inc(slot);

        debug!(
            handle,
            blocks = self.header.blocks,
            nodes = self.header.nodes,
            prims = self.header.prims,
            record,
            "path end"
        );

        if self.geo.subbuf(self.curr.from) != self.geo.subbuf(self.curr.to) {
            trace!(grid = grid.index(), "subbuffer crossed, starting grid");
            rt.grids_mut().start(grid);
        }

        self.stats.paths += 1;
        self.in_path = false;
        self.reset_path();
        Ok(Path::from_handle(handle))
    }

    /// Unmaps the written subbuffers, launches alloc and copy over
    /// `prev` and `curr`, remaps what is free and advances the windows.
    fn launch(&mut self, rt: &mut Runtime, grid: GridId, record: usize) -> Result<()> {
        self.pad_lanes()?;
        self.segs.rem = 0;

        let device = rt.device().clone();
        let queue = rt.acquire_queue()?;

        for s in self.geo.subbufs_in(self.origin(), self.wip) {
            let sb = &mut self.subbufs[s as usize];
            match std::mem::replace(&mut sb.state, SubbufState::Device) {
                SubbufState::Host { blocks, cmds } => {
                    let token = device.unmap_buffer(queue, sb.blocks, blocks)?;
                    rt.notify(token, "unmap_buffer", CompletionAction::Checked)?;
                    let token = device.unmap_buffer(queue, sb.cmds, cmds)?;
                    rt.notify(token, "unmap_buffer", CompletionAction::Checked)?;
                }
                other => sb.state = other,
            }
        }

        let prev = RingSpan {
            from: self.prev.from,
            count: self.geo.span(self.prev.from, self.prev.to),
        };
        let curr = RingSpan {
            from: self.curr.from,
            count: self.geo.span(self.curr.from, self.curr.to),
        };
        let blocks = prev.count + curr.count;
        debug_assert_eq!(
            blocks,
            self.geo.span(self.launch_rolling, self.curr_rolling_to),
            "rolling ids of a launch must be contiguous"
        );
        let slot = record as u32 * self.geo.blocks();

        rt.launch(
            queue,
            Kernel::PathsAlloc {
                reads: self.reads,
                slot,
                blocks,
            },
            CompletionAction::Checked,
        )?;
        rt.launch(
            queue,
            Kernel::PathsCopy(PathsCopy {
                ring: self.ring.clone(),
                reads: self.reads,
                slot,
                rolling_base: self.launch_rolling,
                prev,
                curr,
            }),
            CompletionAction::GridComplete(grid),
        )?;

        // blocks of the path in progress stay on the device until copied
        let next_prev = Cursor {
            from: self.curr.to,
            to: self.wip,
        };
        let keep = self.geo.subbufs_in(next_prev.from, next_prev.to);
        for (s, sb) in self.subbufs.iter_mut().enumerate() {
            if matches!(sb.state, SubbufState::Device) && !keep.contains(&(s as u32)) {
                sb.state = SubbufState::Pending {
                    blocks: device.map_buffer(queue, sb.blocks)?,
                    cmds: device.map_buffer(queue, sb.cmds)?,
                };
            }
        }
        device.flush(queue)?;
        rt.release_queue(queue);

        debug!(
            grid = grid.index(),
            record,
            prev = prev.count,
            curr = curr.count,
            rolling_base = self.launch_rolling,
            "paths copy launched"
        );

        self.launch_rolling = self.curr_rolling_to;
        self.wip = self.geo.round_up(self.wip);
        self.prev = if next_prev.is_empty() {
            Cursor::empty_at(self.wip)
        } else {
            next_prev
        };
        self.curr = Cursor::empty_at(self.wip);
        self.stats.launches += 1;
        Ok(())
    }

    /// Host contents of a ring position, if its subbuffer is mapped.
    #[cfg(test)]
    fn host_block(&self, pos: u32) -> Option<(&[u32], u32)> {
        let rd = self.geo.expand(pos);
        match &self.subbufs[rd.subbuf as usize].state {
            SubbufState::Host { blocks, cmds } => {
                let base = rd.block as usize * self.block_words;
                Some((&blocks[base..base + self.block_words], cmds[rd.block as usize]))
            }
            _ => None,
        }
    }
}

impl GridOwner for RingPathBuilder {
    fn owner_id(&self) -> OwnerId {
        self.id
    }

    fn on_waiting(&mut self, rt: &mut Runtime, grid: GridId, data: usize) -> Result<()> {
        if self.release[data].grid == Some(grid) {
            self.release[data].grid = None;
        }
        self.launch(rt, grid, data).map_err(|e| self.poison(e))
    }

    fn on_dispose(&mut self, rt: &mut Runtime, grid: GridId, data: usize) -> Result<()> {
        let record = self.release[data];
        let mut handles = Vec::with_capacity(self.geo.span(record.from, record.to) as usize);
        let mut i = record.from;
        while i != record.to {
            handles.push(self.release_paths[i as usize]);
            i = self.geo.inc(i);
        }
        let base = data as u32 * self.geo.blocks_per_subbuf;
        self.release[data] = ReleaseRecord {
            from: base,
            to: base,
            grid: record.grid.filter(|&g| g != grid),
        };
        trace!(record = data, paths = handles.len(), "release record drained");
        rt.device_release(&handles, HandleType::Path)
    }

    fn can_dispatch(&self) -> bool {
        !self.busy
    }
}

impl PathBuilderImpl for RingPathBuilder {
    fn begin(&mut self, _rt: &mut Runtime) -> Result<()> {
        self.check()?;
        self.reset_path();
        self.in_path = true;
        Ok(())
    }

    fn new_segment(&mut self, rt: &mut Runtime, kind: SegmentKind) -> Result<()> {
        self.check()?;
        let lane = kind
            .lane_index()
            .ok_or_else(|| PathRingError::not_implemented(format!("{kind:?} segments")))?;
        if !self.in_path {
            self.begin(rt)?;
        }
        self.reserve_lanes(rt, kind, lane)
            .map_err(|e| self.poison(e))
    }

    fn segment(&mut self, rt: &mut Runtime, kind: SegmentKind, coords: &[f32]) -> Result<()> {
        self.check()?;
        let lane = kind
            .lane_index()
            .ok_or_else(|| PathRingError::not_implemented(format!("{kind:?} segments")))?;
        debug_assert_eq!(coords.len(), kind.components());
        if !self.in_path {
            self.begin(rt)?;
        }
        if self.lanes[lane].rem == 0 {
            self.reserve_lanes(rt, kind, lane)
                .map_err(|e| self.poison(e))?;
        }

        let offset = self.subblock_words - self.lanes[lane].rem;
        for (c, &value) in coords.iter().enumerate() {
            let at = self.lanes[lane].coords[c];
            let (blocks, _) = host_mut(&mut self.subbufs, at.subbuf)?;
            blocks[at.word + offset] = coord_word(value);
        }
        self.lanes[lane].rem -= 1;
        for point in coords.chunks_exact(2) {
            self.header.include(point[0], point[1]);
        }
        Ok(())
    }

    fn end(&mut self, rt: &mut Runtime) -> Result<Path> {
        self.check()?;
        if !self.in_path {
            self.begin(rt)?;
        }
        let handle = self
            .acquire_path_handle(rt)
            .map_err(|e| self.poison(e))?;
        self.busy = true;
        let path = self.finish_path(rt, handle);
        self.busy = false;
        path.map_err(|e| self.poison(e))
    }

    fn release(&mut self, rt: &mut Runtime) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.poisoned.is_none() {
            if let Some(grid) = self.current_grid() {
                rt.grids_mut().start(grid);
            }
            while self.release.iter().any(ReleaseRecord::is_busy) {
                rt.yield_now(Some(self))?;
            }
        }

        let device = rt.device().clone();
        for sb in self.subbufs.drain(..) {
            if let SubbufState::Pending { blocks, cmds } = sb.state {
                device.wait(blocks)?;
                device.wait(cmds)?;
            }
            device.release_buffer(sb.blocks)?;
            device.release_buffer(sb.cmds)?;
        }
        device.release_buffer(self.reads)?;
        rt.unregister_owner(self.id);
        self.released = true;
        debug!(owner = self.id.0, paths = self.stats.paths, "path builder released");
        Ok(())
    }

    fn stats(&self) -> PathBuilderStats {
        self.stats.clone()
    }
}

/// Handle-producing path builder.
///
/// ```ignore
/// let mut pb = PathBuilder::new(&rt)?;
/// pb.begin()?;
/// pb.line([0.0, 0.0, 10.0, 0.0])?;
/// pb.cubic([10.0, 0.0, 12.0, 4.0, 8.0, 8.0, 0.0, 10.0])?;
/// let path = pb.end()?;
/// ```
pub struct PathBuilder {
    rt: SharedRuntime,
    imp: Rc<RefCell<dyn PathBuilderImpl>>,
    released: bool,
}

impl PathBuilder {
    /// Creates a ring path builder on the runtime.
    pub fn new(rt: &SharedRuntime) -> Result<Self> {
        let mut runtime = rt.borrow_mut();
        runtime.check()?;
        let id = runtime.reserve_owner();
        let imp = Rc::new(RefCell::new(RingPathBuilder::new(&mut runtime, id)?));
        let owner = Rc::downgrade(&imp) as Weak<RefCell<dyn GridOwner>>;
        runtime.register_owner(id, owner);
        drop(runtime);

        Ok(Self {
            rt: Rc::clone(rt),
            imp,
            released: false,
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut dyn PathBuilderImpl, &mut Runtime) -> Result<T>) -> Result<T> {
        if self.released {
            return Err(PathRingError::ReleasedBuilder);
        }
        let mut rt = self.rt.borrow_mut();
        let mut imp = self.imp.borrow_mut();
        f(&mut *imp, &mut rt)
    }

    /// Starts a path.
    pub fn begin(&mut self) -> Result<()> {
        self.with(|imp, rt| imp.begin(rt))
    }

    /// Starts a fresh batch of line lanes.
    pub fn new_line(&mut self) -> Result<()> {
        self.with(|imp, rt| imp.new_segment(rt, SegmentKind::Line))
    }

    /// Starts a fresh batch of quad lanes.
    pub fn new_quad(&mut self) -> Result<()> {
        self.with(|imp, rt| imp.new_segment(rt, SegmentKind::Quad))
    }

    /// Starts a fresh batch of cubic lanes.
    pub fn new_cubic(&mut self) -> Result<()> {
        self.with(|imp, rt| imp.new_segment(rt, SegmentKind::Cubic))
    }

    /// `[x0, y0, x1, y1]`
    pub fn line(&mut self, coords: [f32; 4]) -> Result<()> {
        self.with(|imp, rt| imp.segment(rt, SegmentKind::Line, &coords))
    }

    /// `[x0, y0, x1, y1, x2, y2]`
    pub fn quad(&mut self, coords: [f32; 6]) -> Result<()> {
        self.with(|imp, rt| imp.segment(rt, SegmentKind::Quad, &coords))
    }

    /// `[x0, y0, x1, y1, x2, y2, x3, y3]`
    pub fn cubic(&mut self, coords: [f32; 8]) -> Result<()> {
        self.with(|imp, rt| imp.segment(rt, SegmentKind::Cubic, &coords))
    }

    /// Rational quadratic: `[x0, y0, x1, y1, w1, x2, y2]`. Not implemented.
    pub fn rational_quad(&mut self, coords: [f32; 7]) -> Result<()> {
        self.with(|imp, rt| imp.segment(rt, SegmentKind::RationalQuad, &coords))
    }

    /// Rational cubic. Not implemented.
    pub fn rational_cubic(&mut self, coords: [f32; 10]) -> Result<()> {
        self.with(|imp, rt| imp.segment(rt, SegmentKind::RationalCubic, &coords))
    }

    /// Finishes the path and dispatches any launch it triggered.
    pub fn end(&mut self) -> Result<Path> {
        let path = self.with(|imp, rt| imp.end(rt))?;
        self.rt.borrow_mut().dispatch(None)?;
        Ok(path)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PathBuilderStats {
        self.imp.borrow().stats()
    }

    /// Flushes finished paths and frees the builder.
    pub fn release(mut self) -> Result<()> {
        let result = self.with(|imp, rt| imp.release(rt));
        self.released = true;
        result
    }
}

impl std::fmt::Debug for PathBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathBuilder")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for PathBuilder {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let (Ok(mut rt), Ok(mut imp)) = (self.rt.try_borrow_mut(), self.imp.try_borrow_mut())
        else {
            return;
        };
        if let Err(err) = imp.release(&mut rt) {
            warn!(error = %err, "path builder release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockTag, CopyTag};
    use crate::config::RuntimeConfig;
    use crate::testing::ImmediateDevice;
    use std::sync::Arc;

    struct Harness {
        device: Arc<ImmediateDevice>,
        rt: SharedRuntime,
        pb: Rc<RefCell<RingPathBuilder>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(RuntimeConfig::minimal())
        }

        fn with_config(config: RuntimeConfig) -> Self {
            let device = Arc::new(ImmediateDevice::new());
            let rt = Runtime::new(config, device.clone())
                .unwrap()
                .into_shared();
            let pb = {
                let mut r = rt.borrow_mut();
                let id = r.reserve_owner();
                let pb = Rc::new(RefCell::new(RingPathBuilder::new(&mut r, id).unwrap()));
                let owner = Rc::downgrade(&pb) as Weak<RefCell<dyn GridOwner>>;
                r.register_owner(id, owner);
                pb
            };
            Self { device, rt, pb }
        }

        fn lines(&self, n: usize) -> Result<Path> {
            {
                let mut rt = self.rt.borrow_mut();
                let mut pb = self.pb.borrow_mut();
                pb.begin(&mut rt)?;
                for i in 0..n {
                    let x = i as f32 + 1.0;
                    pb.segment(&mut rt, SegmentKind::Line, &[x, 0.0, x, 2.0])?;
                }
            }
            let path = {
                let mut rt = self.rt.borrow_mut();
                let mut pb = self.pb.borrow_mut();
                pb.end(&mut rt)?
            };
            self.rt.borrow_mut().dispatch(None)?;
            Ok(path)
        }

        fn launches(&self) -> usize {
            self.device
                .launched()
                .iter()
                .filter(|k| **k == "paths_copy")
                .count()
        }
    }

    #[test]
    fn test_single_line_layout() {
        let h = Harness::new();
        let path = h.lines(1).unwrap();
        let handle = path.handle().unwrap();

        let pb = h.pb.borrow();
        let (segs, cmd) = pb.host_block(0).unwrap();
        assert_eq!(CopyCommand::from_raw(cmd).tag(), Some(CopyTag::Segs));
        assert_eq!(CopyCommand::from_raw(cmd).rolling(), 0);
        // component c of lane 0 sits at the start of subblock c
        assert_eq!(f32::from_bits(segs[0]), 1.0);
        assert_eq!(f32::from_bits(segs[4]), 0.0);
        assert_eq!(f32::from_bits(segs[8]), 1.0);
        assert_eq!(f32::from_bits(segs[12]), 2.0);
        // unused lanes are padded
        assert_eq!(segs[1], LANE_PAD);
        assert_eq!(segs[5], LANE_PAD);

        let (head, cmd) = pb.host_block(1).unwrap();
        assert_eq!(CopyCommand::from_raw(cmd).tag(), Some(CopyTag::Head));
        assert_eq!(CopyCommand::from_raw(cmd).rolling(), 1);
        let header = PathHeader::read(head);
        assert_eq!(header.handle, handle);
        assert_eq!(header.blocks, 2);
        assert_eq!(header.nodes, 0);
        assert_eq!(header.prims, 1);
        assert_eq!(header.bounds, [1.0, 0.0, 1.0, 2.0]);

        let first = TaggedBlockRef::from_raw(head[HEAD_WORDS]);
        assert_eq!(first.tag(), Some(BlockTag::Line));
        assert_eq!(first.index(), 0);
        assert!(head[HEAD_WORDS + 1..]
            .iter()
            .all(|&w| TaggedBlockRef::from_raw(w).is_invalid()));
    }

    #[test]
    fn test_flush_on_subbuffer_boundary() {
        let h = Harness::new();
        h.lines(1).unwrap();
        assert_eq!(h.launches(), 0);
        h.lines(1).unwrap();
        // four blocks written: the write position left subbuffer 0
        assert_eq!(h.launches(), 1);
        h.lines(1).unwrap();
        assert_eq!(h.launches(), 1);

        let copy = h
            .device
            .kernels()
            .into_iter()
            .find_map(|k| match k {
                Kernel::PathsCopy(copy) => Some(copy),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy.curr, RingSpan { from: 0, count: 4 });
        assert_eq!(copy.prev.count, 0);
        assert_eq!(copy.rolling_base, 0);
        assert!(h.device.launched().contains(&"paths_alloc"));
    }

    #[test]
    fn test_long_path_overruns_ring() {
        let h = Harness::new();
        let err = h.lines(200).unwrap_err();
        assert_eq!(err, PathRingError::RingOverrun { ring_blocks: 8 });
        assert!(err.is_fatal());

        let mut rt = h.rt.borrow_mut();
        let mut pb = h.pb.borrow_mut();
        assert_eq!(pb.begin(&mut rt), Err(err));
    }

    #[test]
    fn test_multi_node_path() {
        let mut config = RuntimeConfig::minimal();
        config.ring.blocks_per_subbuf = 8;
        let h = Harness::with_config(config);
        let mut rt = h.rt.borrow_mut();
        let mut pb = h.pb.borrow_mut();

        // eight full batches: seven fill the head, the eighth needs a node
        pb.begin(&mut rt).unwrap();
        for i in 0..32 {
            pb.segment(&mut rt, SegmentKind::Line, &[0.0, i as f32, 1.0, 1.0])
                .unwrap();
        }
        pb.end(&mut rt).unwrap();

        let (node, cmd) = pb.host_block(8).unwrap();
        assert_eq!(CopyCommand::from_raw(cmd).tag(), Some(CopyTag::Node));
        assert_eq!(CopyCommand::from_raw(cmd).rolling(), 7);
        let first = TaggedBlockRef::from_raw(node[0]);
        assert_eq!(first.tag(), Some(BlockTag::Line));
        assert_eq!(first.index(), 8 * 4);
        assert!(TaggedBlockRef::from_raw(node[1]).is_invalid());

        let (head, cmd) = pb.host_block(9).unwrap();
        assert_eq!(CopyCommand::from_raw(cmd).rolling(), 9);
        let header = PathHeader::read(head);
        assert_eq!(header.blocks, 10);
        assert_eq!(header.nodes, 1);
        assert_eq!(header.prims, 8);
        assert_eq!(header.bounds, [0.0, 0.0, 1.0, 31.0]);
        for slot in 0..7 {
            let id = TaggedBlockRef::from_raw(head[HEAD_WORDS + slot]);
            assert_eq!(id.tag(), Some(BlockTag::Line));
            assert_eq!(id.index(), slot as u32 * 4);
        }
        let forward = TaggedBlockRef::from_raw(head[15]);
        assert_eq!(forward.tag(), Some(BlockTag::Next));
        assert_eq!(forward.index(), 7 * 4);
    }

    #[test]
    fn test_release_drains_records() {
        let h = Harness::new();
        let path = h.lines(2).unwrap();
        {
            let mut rt = h.rt.borrow_mut();
            let mut pb = h.pb.borrow_mut();
            pb.release(&mut rt).unwrap();
            assert!(pb.segment(&mut rt, SegmentKind::Line, &[0.0; 4]).is_err());
        }
        assert_eq!(h.launches(), 1);
        let mut rt = h.rt.borrow_mut();
        rt.wait_idle().unwrap();
        // the host reference keeps the one path live
        assert_eq!(rt.handles().available(), 63);
        let rc = rt.handles().refcount(path.handle().unwrap()).unwrap();
        assert_eq!((rc.host(), rc.device()), (1, 0));
    }

    #[test]
    fn test_rational_segments_not_implemented() {
        let h = Harness::new();
        let mut rt = h.rt.borrow_mut();
        let mut pb = h.pb.borrow_mut();
        let err = pb
            .segment(&mut rt, SegmentKind::RationalQuad, &[0.0; 7])
            .unwrap_err();
        assert!(matches!(err, PathRingError::NotImplemented(_)));
        assert!(!err.is_fatal());
    }
}
