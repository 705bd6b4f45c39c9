//! Ring suballocator.
//!
//! Hands out whole fixed-size blocks from a power-of-two ring using two
//! monotonic cursors. `head` advances on acquire; `tail` advances when the
//! oldest live span is released. Spans released out of order are held until
//! everything before them is released, so the free region is always one
//! contiguous arc of the ring and no coalescing is needed.
//!
//! A request that would straddle the end of the ring is preceded by a padding
//! span covering the remainder, so every span is contiguous.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::{PathRingError, Result};

/// Opaque id of an acquired span.
pub type SubbufId = u32;

/// An acquired range of the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Id to pass to [`Suballocator::release`].
    pub id: SubbufId,
    /// Offset into the extent, in words.
    pub offset: usize,
    /// Actual size in words, rounded up to whole blocks.
    pub size: usize,
}

/// Statistics for a suballocator.
#[derive(Debug, Clone, Default)]
pub struct SuballocatorStats {
    /// Successful acquisitions.
    pub acquired: u64,
    /// Releases.
    pub released: u64,
    /// Padding spans inserted at the ring end.
    pub padded: u64,
    /// Acquisitions that found no room.
    pub exhausted: u64,
    /// Blocks currently between tail and head.
    pub in_use_blocks: u64,
    /// Maximum blocks in use observed.
    pub max_in_use_blocks: u64,
}

#[derive(Debug)]
struct LiveSpan {
    /// `None` for padding.
    id: Option<SubbufId>,
    blocks: u64,
    released: bool,
}

/// Block-granular ring allocator over a fixed extent.
#[derive(Debug)]
pub struct Suballocator {
    block_words: usize,
    /// Capacity in blocks (power of 2).
    blocks: u64,
    /// Mask for index wrapping.
    mask: u64,
    head: u64,
    tail: u64,
    /// Spans in acquisition order.
    live: VecDeque<LiveSpan>,
    next_id: SubbufId,
    stats: SuballocatorStats,
}

impl Suballocator {
    /// Creates a suballocator of `blocks` blocks of `block_words` words.
    pub fn new(blocks: u32, block_words: u32) -> Result<Self> {
        if !blocks.is_power_of_two() || block_words == 0 {
            return Err(PathRingError::invalid_config(
                "suballocator needs a power-of-two block count and nonzero block size",
            ));
        }
        let blocks = u64::from(blocks);
        Ok(Self {
            block_words: block_words as usize,
            blocks,
            mask: blocks - 1,
            head: 0,
            tail: 0,
            live: VecDeque::new(),
            next_id: 0,
            stats: SuballocatorStats::default(),
        })
    }

    /// Size of the extent in words.
    pub fn capacity_words(&self) -> usize {
        self.blocks as usize * self.block_words
    }

    /// Words per block.
    pub fn block_words(&self) -> usize {
        self.block_words
    }

    /// Blocks not covered by a live span.
    pub fn free_blocks(&self) -> u64 {
        self.blocks - self.head.wrapping_sub(self.tail)
    }

    /// True when nothing is allocated.
    pub fn is_idle(&self) -> bool {
        self.live.is_empty()
    }

    /// Tries to acquire `words` words.
    ///
    /// Returns `Ok(None)` when the ring is currently too full; the caller is
    /// expected to yield to the dispatcher and retry. Requests larger than the
    /// whole extent fail immediately.
    pub fn try_acquire(&mut self, words: usize) -> Result<Option<Span>> {
        if words > self.capacity_words() {
            return Err(PathRingError::RequestTooLarge {
                requested: words,
                capacity: self.capacity_words(),
            });
        }

        let needed = words.div_ceil(self.block_words).max(1) as u64;
        let offset = self.head & self.mask;
        let pad = if offset + needed > self.blocks {
            self.blocks - offset
        } else {
            0
        };

        if pad + needed > self.free_blocks() {
            self.stats.exhausted += 1;
            return Ok(None);
        }

        if pad > 0 {
            self.live.push_back(LiveSpan {
                id: None,
                blocks: pad,
                released: true,
            });
            self.head += pad;
            self.stats.padded += 1;
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let start = self.head & self.mask;

        self.live.push_back(LiveSpan {
            id: Some(id),
            blocks: needed,
            released: false,
        });
        self.head += needed;

        self.stats.acquired += 1;
        let in_use = self.head - self.tail;
        self.stats.in_use_blocks = in_use;
        self.stats.max_in_use_blocks = self.stats.max_in_use_blocks.max(in_use);

        trace!(id, start, blocks = needed, "suballocator acquire");

        Ok(Some(Span {
            id,
            offset: start as usize * self.block_words,
            size: needed as usize * self.block_words,
        }))
    }

    /// Releases a span. The tail advances over every leading released span.
    pub fn release(&mut self, id: SubbufId) -> Result<()> {
        let span = self
            .live
            .iter_mut()
            .find(|s| s.id == Some(id) && !s.released)
            .ok_or(PathRingError::UnknownSubbuffer(id))?;
        span.released = true;
        self.stats.released += 1;

        while let Some(front) = self.live.front() {
            if !front.released {
                break;
            }
            self.tail += front.blocks;
            self.live.pop_front();
        }
        self.stats.in_use_blocks = self.head - self.tail;
        Ok(())
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SuballocatorStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(Suballocator::new(12, 16).is_err());
        assert!(Suballocator::new(16, 0).is_err());
    }

    #[test]
    fn test_whole_blocks() {
        let mut sa = Suballocator::new(8, 16).unwrap();

        let a = sa.try_acquire(1).unwrap().unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 16);

        let b = sa.try_acquire(17).unwrap().unwrap();
        assert_eq!(b.offset, 16);
        assert_eq!(b.size, 32);

        // zero-sized requests still take a block
        let c = sa.try_acquire(0).unwrap().unwrap();
        assert_eq!(c.size, 16);
        assert_eq!(sa.free_blocks(), 4);
    }

    #[test]
    fn test_exhaustion_then_release() {
        let mut sa = Suballocator::new(4, 8).unwrap();
        let a = sa.try_acquire(16).unwrap().unwrap();
        let _b = sa.try_acquire(16).unwrap().unwrap();

        assert_eq!(sa.try_acquire(8).unwrap(), None);
        assert_eq!(sa.stats().exhausted, 1);

        sa.release(a.id).unwrap();
        let c = sa.try_acquire(8).unwrap().unwrap();
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn test_out_of_order_release_holds_tail() {
        let mut sa = Suballocator::new(4, 8).unwrap();
        let a = sa.try_acquire(8).unwrap().unwrap();
        let b = sa.try_acquire(8).unwrap().unwrap();

        sa.release(b.id).unwrap();
        // b is free but a still pins the tail
        assert_eq!(sa.free_blocks(), 2);

        sa.release(a.id).unwrap();
        assert_eq!(sa.free_blocks(), 4);
        assert!(sa.is_idle());
    }

    #[test]
    fn test_wrap_inserts_padding() {
        let mut sa = Suballocator::new(4, 8).unwrap();
        let a = sa.try_acquire(24).unwrap().unwrap();
        sa.release(a.id).unwrap();

        // head sits at block 3; two blocks cannot straddle the end
        let b = sa.try_acquire(16).unwrap().unwrap();
        assert_eq!(b.offset, 0);
        assert_eq!(sa.stats().padded, 1);
        assert_eq!(sa.free_blocks(), 1);

        sa.release(b.id).unwrap();
        assert_eq!(sa.free_blocks(), 4);
    }

    #[test]
    fn test_too_large_and_unknown() {
        let mut sa = Suballocator::new(4, 8).unwrap();
        assert!(matches!(
            sa.try_acquire(33),
            Err(PathRingError::RequestTooLarge { requested: 33, capacity: 32 })
        ));
        assert!(matches!(
            sa.release(9),
            Err(PathRingError::UnknownSubbuffer(9))
        ));

        let a = sa.try_acquire(8).unwrap().unwrap();
        sa.release(a.id).unwrap();
        assert!(sa.release(a.id).is_err());
    }
}
