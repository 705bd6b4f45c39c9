//! Handle pool with dual host/device reference counts and batched
//! reclamation.
//!
//! Handle ids live in blocks of `W` words. Acquisition drains the top
//! readable block into the in-hand list and pushes the emptied block id onto
//! the writable stack. Reclaimable handles are written into a writable block
//! (the "bucket in hand" for their type); a full bucket becomes a
//! [`ReclaimBatch`] that the runtime launches on the device. When the device
//! confirms the batch, the block returns to the readable stack with the
//! reclaimed ids in it.
//!
//! The pool never blocks. Work that cannot proceed for lack of a writable
//! block or a reclaim record is parked and resumed from
//! [`HandlePool::reclaim_complete`].

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::config::HandlePoolConfig;
use crate::error::{PathRingError, Result};
use crate::handle::{Handle, HandleType, RefCount, DEVICE_MAX, HOST_MAX};

/// A block of handles ready for the device reclamation kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimBatch {
    /// Reclaim record to hand back on completion.
    pub record: u32,
    /// Type of every handle in the batch.
    pub ty: HandleType,
    /// Staging block holding the ids.
    pub block: u32,
    /// The handles.
    pub handles: Vec<Handle>,
}

/// Statistics for a handle pool.
#[derive(Debug, Clone, Default)]
pub struct HandlePoolStats {
    /// Handles handed out.
    pub acquired: u64,
    /// Handles returned to the readable stack.
    pub reclaimed: u64,
    /// Batches handed to the runtime.
    pub batches: u64,
    /// Batches closed before they were full.
    pub partial_batches: u64,
    /// Handles currently waiting in buckets or batches.
    pub pending_reclaim: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    block: u32,
    count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReclaimRecord {
    block: u32,
    count: u32,
}

/// Batch waiting for a free record.
#[derive(Debug)]
struct ClosedBucket {
    ty: HandleType,
    block: u32,
    count: u32,
}

/// Reference-counted handle allocator.
#[derive(Debug)]
pub struct HandlePool {
    width: u32,
    count: u32,
    refcnts: Vec<RefCount>,
    /// Handle id storage, `width` words per block.
    blocks: Vec<Handle>,
    /// `(block, handles in block)`
    readable: Vec<(u32, u32)>,
    writable: Vec<u32>,
    in_hand: Vec<Handle>,
    buckets: [Option<Bucket>; 2],
    records: Vec<ReclaimRecord>,
    free_records: Vec<u32>,
    /// Reclaimable handles with no writable block yet.
    deferred: VecDeque<(Handle, HandleType)>,
    /// Full buckets with no free record yet.
    closed: VecDeque<ClosedBucket>,
    ready: Vec<ReclaimBatch>,
    stats: HandlePoolStats,
}

impl HandlePool {
    /// Creates a pool with every handle on the readable stack.
    pub fn new(config: &HandlePoolConfig) -> Result<Self> {
        if config.block_width == 0
            || config.handles % config.block_width != 0
            || config.reclaim_records == 0
        {
            return Err(PathRingError::invalid_config("bad handle pool geometry"));
        }

        let width = config.block_width;
        let block_count = config.handles / width;
        let blocks: Vec<Handle> = (0..config.handles).collect();

        // block 0 on top
        let readable = (0..block_count).rev().map(|b| (b, width)).collect();
        let free_records = (0..config.reclaim_records).rev().collect();

        Ok(Self {
            width,
            count: config.handles,
            refcnts: vec![RefCount::ZERO; config.handles as usize],
            blocks,
            readable,
            writable: Vec::with_capacity(block_count as usize),
            in_hand: Vec::with_capacity(width as usize),
            buckets: [None, None],
            records: vec![ReclaimRecord::default(); config.reclaim_records as usize],
            free_records,
            deferred: VecDeque::new(),
            closed: VecDeque::new(),
            ready: Vec::new(),
            stats: HandlePoolStats::default(),
        })
    }

    /// Total handles.
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Current counts of a handle.
    pub fn refcount(&self, handle: Handle) -> Option<RefCount> {
        self.refcnts.get(handle as usize).copied()
    }

    /// Handles that can be acquired without waiting for a reclamation.
    pub fn available(&self) -> usize {
        self.in_hand.len() + self.readable.iter().map(|&(_, n)| n as usize).sum::<usize>()
    }

    /// Pops a handle with counts `{host: 1, device: 1}`, or `None` when every
    /// handle is live or awaiting reclamation.
    pub fn try_acquire(&mut self) -> Option<Handle> {
        if self.in_hand.is_empty() && !self.drain_readable() {
            return None;
        }
        let handle = self.in_hand.pop()?;
        debug_assert!(self.refcnts[handle as usize].is_zero());
        self.refcnts[handle as usize] = RefCount::new(1, 1);
        self.stats.acquired += 1;
        Some(handle)
    }

    /// Moves the top readable block into the in-hand list; the emptied block
    /// becomes writable.
    fn drain_readable(&mut self) -> bool {
        let Some((block, n)) = self.readable.pop() else {
            return false;
        };
        let base = (block * self.width) as usize;
        self.in_hand
            .extend(self.blocks[base..base + n as usize].iter().rev().copied());
        self.writable.push(block);
        true
    }

    fn untype(&self, raw: u32, ty: HandleType) -> Result<Handle> {
        ty.untype(raw)
            .filter(|&h| h < self.count)
            .ok_or(PathRingError::HandleInvalid { handle: raw })
    }

    /// Increments host counts. All-or-nothing: any invalid handle leaves
    /// every count untouched.
    pub fn retain(&mut self, raws: &[u32], ty: HandleType) -> Result<()> {
        let mut projected: HashMap<Handle, u32> = HashMap::new();
        let mut staged = Vec::with_capacity(raws.len());
        for &raw in raws {
            let h = self.untype(raw, ty)?;
            let host = projected
                .get(&h)
                .copied()
                .unwrap_or_else(|| self.refcnts[h as usize].host());
            if host == 0 {
                return Err(PathRingError::HandleInvalid { handle: raw });
            }
            if host >= HOST_MAX {
                return Err(PathRingError::HandleOverflow { handle: raw });
            }
            projected.insert(h, host + 1);
            staged.push(h);
        }

        for h in staged {
            let rc = self.refcnts[h as usize];
            self.refcnts[h as usize] = rc.with_host(rc.host() + 1);
        }
        Ok(())
    }

    /// Decrements host counts, queueing handles whose counts reach zero.
    /// All-or-nothing like [`retain`](Self::retain).
    pub fn release(&mut self, raws: &[u32], ty: HandleType) -> Result<()> {
        let mut projected: HashMap<Handle, u32> = HashMap::new();
        let mut staged = Vec::with_capacity(raws.len());
        for &raw in raws {
            let h = self.untype(raw, ty)?;
            let host = projected
                .get(&h)
                .copied()
                .unwrap_or_else(|| self.refcnts[h as usize].host());
            if host == 0 {
                return Err(PathRingError::HandleInvalid { handle: raw });
            }
            projected.insert(h, host - 1);
            staged.push(h);
        }

        for h in staged {
            let rc = self.refcnts[h as usize];
            let rc = rc.with_host(rc.host() - 1);
            self.refcnts[h as usize] = rc;
            if rc.is_zero() {
                self.enqueue_reclaim(h, ty);
            }
        }
        Ok(())
    }

    /// Checks that typed handles may take a device reference: in range, host
    /// count nonzero, device count not saturated.
    pub fn device_validate(&self, raws: &[u32], ty: HandleType) -> Result<Vec<Handle>> {
        let mut projected: HashMap<Handle, u32> = HashMap::new();
        let mut handles = Vec::with_capacity(raws.len());
        for &raw in raws {
            let h = self.untype(raw, ty)?;
            let rc = self.refcnts[h as usize];
            if rc.host() == 0 {
                return Err(PathRingError::HandleInvalid { handle: raw });
            }
            let device = projected.get(&h).copied().unwrap_or_else(|| rc.device());
            if device >= DEVICE_MAX {
                return Err(PathRingError::HandleOverflow { handle: raw });
            }
            projected.insert(h, device + 1);
            handles.push(h);
        }
        Ok(handles)
    }

    /// Validates typed handles and increments their device counts.
    pub fn device_retain(&mut self, raws: &[u32], ty: HandleType) -> Result<Vec<Handle>> {
        let handles = self.device_validate(raws, ty)?;
        for &h in &handles {
            let rc = self.refcnts[h as usize];
            self.refcnts[h as usize] = rc.with_device(rc.device() + 1);
        }
        Ok(handles)
    }

    /// Decrements device counts of untyped handles held by runtime
    /// components, queueing handles whose counts reach zero.
    pub fn device_release(&mut self, handles: &[Handle], ty: HandleType) -> Result<()> {
        let mut projected: HashMap<Handle, u32> = HashMap::new();
        for &h in handles {
            let Some(rc) = self.refcnts.get(h as usize) else {
                return Err(PathRingError::HandleInvalid {
                    handle: h | ty.guard(),
                });
            };
            let device = projected.get(&h).copied().unwrap_or_else(|| rc.device());
            if device == 0 {
                return Err(PathRingError::HandleInvalid {
                    handle: h | ty.guard(),
                });
            }
            projected.insert(h, device - 1);
        }

        for &h in handles {
            let rc = self.refcnts[h as usize];
            let rc = rc.with_device(rc.device() - 1);
            self.refcnts[h as usize] = rc;
            if rc.is_zero() {
                self.enqueue_reclaim(h, ty);
            }
        }
        Ok(())
    }

    fn enqueue_reclaim(&mut self, handle: Handle, ty: HandleType) {
        trace!(handle, ?ty, "handle reclaimable");
        self.stats.pending_reclaim += 1;
        if !self.deferred.is_empty() || !self.push_to_bucket(handle, ty) {
            self.deferred.push_back((handle, ty));
        }
    }

    fn push_to_bucket(&mut self, handle: Handle, ty: HandleType) -> bool {
        let slot = ty.index();
        let mut bucket = match self.buckets[slot] {
            Some(bucket) => bucket,
            None => {
                if self.writable.is_empty() && !self.drain_readable() {
                    return false;
                }
                let Some(block) = self.writable.pop() else {
                    return false;
                };
                Bucket { block, count: 0 }
            }
        };

        self.blocks[(bucket.block * self.width + bucket.count) as usize] = handle;
        bucket.count += 1;

        if bucket.count == self.width {
            self.buckets[slot] = None;
            self.close(ty, bucket);
        } else {
            self.buckets[slot] = Some(bucket);
        }
        true
    }

    fn close(&mut self, ty: HandleType, bucket: Bucket) {
        self.closed.push_back(ClosedBucket {
            ty,
            block: bucket.block,
            count: bucket.count,
        });
        self.assign_records();
    }

    fn assign_records(&mut self) {
        while !self.closed.is_empty() {
            let Some(record) = self.free_records.pop() else {
                debug!(waiting = self.closed.len(), "reclaim records exhausted");
                return;
            };
            let Some(closed) = self.closed.pop_front() else {
                self.free_records.push(record);
                return;
            };
            self.records[record as usize] = ReclaimRecord {
                block: closed.block,
                count: closed.count,
            };
            let base = (closed.block * self.width) as usize;
            let handles = self.blocks[base..base + closed.count as usize].to_vec();
            self.stats.batches += 1;
            self.ready.push(ReclaimBatch {
                record,
                ty: closed.ty,
                block: closed.block,
                handles,
            });
        }
    }

    /// Closes partially filled buckets so their handles are reclaimed without
    /// waiting for more releases.
    pub fn flush_partial(&mut self) {
        for ty in HandleType::ALL {
            if let Some(bucket) = self.buckets[ty.index()].take() {
                self.stats.partial_batches += 1;
                self.close(ty, bucket);
            }
        }
    }

    /// Batches ready to launch.
    pub fn take_ready(&mut self) -> Vec<ReclaimBatch> {
        std::mem::take(&mut self.ready)
    }

    /// True while handles are pending in buckets, parked, or in flight.
    pub fn has_pending_reclaim(&self) -> bool {
        self.stats.pending_reclaim > 0
    }

    /// True when a partially filled bucket exists.
    pub fn has_partial_bucket(&self) -> bool {
        self.buckets.iter().any(Option::is_some)
    }

    /// Device confirmed a batch: its block returns to the readable stack and
    /// the record to the free list.
    pub fn reclaim_complete(&mut self, record: u32) -> Result<()> {
        let rec = *self.records.get(record as usize).ok_or_else(|| {
            PathRingError::device(format!("unknown reclaim record {record}"))
        })?;
        if rec.count > 0 {
            self.readable.push((rec.block, rec.count));
        } else {
            self.writable.push(rec.block);
        }
        self.records[record as usize] = ReclaimRecord::default();
        self.free_records.push(record);

        self.stats.reclaimed += u64::from(rec.count);
        self.stats.pending_reclaim -= u64::from(rec.count);
        debug!(record, block = rec.block, handles = rec.count, "reclaim complete");

        self.assign_records();
        while let Some(&(handle, ty)) = self.deferred.front() {
            if !self.push_to_bucket(handle, ty) {
                break;
            }
            self.deferred.pop_front();
        }
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> HandlePoolStats {
        self.stats.clone()
    }
}
