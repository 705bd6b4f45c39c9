//! Ring positions and cursor spans for the path builder's block ring.

use crate::config::RingConfig;

/// Fixed geometry of a block ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Number of subbuffers.
    pub subbufs: u32,
    /// Blocks per subbuffer.
    pub blocks_per_subbuf: u32,
}

impl RingGeometry {
    /// Geometry from configuration.
    pub fn from_config(config: &RingConfig) -> Self {
        Self {
            subbufs: config.subbufs,
            blocks_per_subbuf: config.blocks_per_subbuf,
        }
    }

    /// Total blocks.
    #[inline]
    pub fn blocks(&self) -> u32 {
        self.subbufs * self.blocks_per_subbuf
    }

    /// Decomposes a ring position.
    #[inline]
    pub fn expand(&self, idx: u32) -> Ringdex {
        Ringdex {
            subbuf: idx / self.blocks_per_subbuf,
            block: idx % self.blocks_per_subbuf,
        }
    }

    /// Subbuffer holding a ring position.
    #[inline]
    pub fn subbuf(&self, idx: u32) -> u32 {
        idx / self.blocks_per_subbuf
    }

    /// Next position, wrapping.
    #[inline]
    pub fn inc(&self, idx: u32) -> u32 {
        let next = idx + 1;
        if next == self.blocks() {
            0
        } else {
            next
        }
    }

    /// Rounds a position up to the next subbuffer boundary, wrapping. A
    /// position already on a boundary is unchanged.
    #[inline]
    pub fn round_up(&self, idx: u32) -> u32 {
        let rem = idx % self.blocks_per_subbuf;
        if rem == 0 {
            idx
        } else {
            let next = idx - rem + self.blocks_per_subbuf;
            if next == self.blocks() {
                0
            } else {
                next
            }
        }
    }

    /// Blocks in `[from, to)`, wrapping. Equal ends denote an empty span.
    #[inline]
    pub fn span(&self, from: u32, to: u32) -> u32 {
        if to >= from {
            to - from
        } else {
            self.blocks() - from + to
        }
    }

    /// Subbuffers touched by `[from, to)`, in ring order.
    pub fn subbufs_in(&self, from: u32, to: u32) -> Vec<u32> {
        let count = self.span(from, to);
        if count == 0 {
            return Vec::new();
        }
        let first = self.subbuf(from);
        let last = self.subbuf((from + count - 1) % self.blocks());
        let mut out = vec![first];
        let mut s = first;
        while s != last {
            s = (s + 1) % self.subbufs;
            out.push(s);
        }
        out
    }
}

/// A ring position decomposed into `(subbuffer, block within subbuffer)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ringdex {
    /// Subbuffer.
    pub subbuf: u32,
    /// Block within the subbuffer.
    pub block: u32,
}

/// A `[from, to)` window of ring positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// First position.
    pub from: u32,
    /// One past the last position.
    pub to: u32,
}

impl Cursor {
    /// An empty window at `at`.
    pub fn empty_at(at: u32) -> Self {
        Self { from: at, to: at }
    }

    /// True when the window holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> RingGeometry {
        RingGeometry {
            subbufs: 2,
            blocks_per_subbuf: 4,
        }
    }

    #[test]
    fn test_expand_and_inc() {
        let g = geo();
        assert_eq!(g.expand(5), Ringdex { subbuf: 1, block: 1 });
        assert_eq!(g.inc(6), 7);
        assert_eq!(g.inc(7), 0);
    }

    #[test]
    fn test_round_up() {
        let g = geo();
        assert_eq!(g.round_up(0), 0);
        assert_eq!(g.round_up(1), 4);
        assert_eq!(g.round_up(4), 4);
        assert_eq!(g.round_up(6), 0);
    }

    #[test]
    fn test_span_wraps() {
        let g = geo();
        assert_eq!(g.span(2, 2), 0);
        assert_eq!(g.span(2, 5), 3);
        assert_eq!(g.span(6, 1), 3);
    }

    #[test]
    fn test_subbufs_in() {
        let g = geo();
        assert!(g.subbufs_in(3, 3).is_empty());
        assert_eq!(g.subbufs_in(0, 4), vec![0]);
        assert_eq!(g.subbufs_in(3, 5), vec![0, 1]);
        assert_eq!(g.subbufs_in(6, 1), vec![1, 0]);
    }
}
