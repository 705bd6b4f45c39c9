//! Walking and decoding published paths in the block pool.

use std::collections::BTreeSet;

use pathring_core::block::{
    BlockTag, PathHeader, SegmentKind, TaggedBlockRef, HEAD_WORDS, LANE_PAD,
};

use crate::block_pool::BlockPool;

/// Block and subblock sizes of the encoded layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Words per block.
    pub block_words: usize,
    /// Words per subblock.
    pub subblock_words: usize,
}

impl Layout {
    /// Subblocks per block.
    pub fn subblocks_per_block(&self) -> u32 {
        (self.block_words / self.subblock_words) as u32
    }
}

/// One decoded segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Segment kind.
    pub kind: SegmentKind,
    /// `kind.components()` coordinates.
    pub coords: Vec<f32>,
}

/// A path read back from the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPath {
    /// Header of the head block.
    pub header: PathHeader,
    /// Segments in encoding order, zero-padded lanes skipped.
    pub segments: Vec<Segment>,
}

/// Reference list and block set of one path.
#[derive(Debug)]
pub(crate) struct PathWalk {
    pub header: PathHeader,
    pub refs: Vec<TaggedBlockRef>,
    pub blocks: BTreeSet<u32>,
}

/// Follows a path from its head block through its node blocks.
pub(crate) fn walk(pool: &BlockPool, layout: Layout, head: u32) -> Result<PathWalk, String> {
    let spb = layout.subblocks_per_block();
    let header = PathHeader::read(pool.block(head));
    let mut refs = Vec::new();
    let mut blocks = BTreeSet::from([head]);

    let mut block = head;
    let mut slot = HEAD_WORDS;
    let mut nodes = 0;
    loop {
        if slot == layout.block_words {
            break;
        }
        let id = TaggedBlockRef::from_raw(pool.block(block)[slot]);
        if id.is_invalid() {
            break;
        }
        let last = slot == layout.block_words - 1;
        if last && id.tag() == Some(BlockTag::Next) {
            block = id.index() / spb;
            if block >= pool.capacity() || !blocks.insert(block) {
                return Err(format!("bad node reference {:#x}", id.raw()));
            }
            nodes += 1;
            slot = 0;
            continue;
        }
        let target = id.index() / spb;
        if target >= pool.capacity() {
            return Err(format!("reference {:#x} outside the pool", id.raw()));
        }
        blocks.insert(target);
        refs.push(id);
        slot += 1;
    }

    if nodes != header.nodes {
        return Err(format!(
            "path {} has {} nodes, header says {}",
            header.handle, nodes, header.nodes
        ));
    }
    Ok(PathWalk {
        header,
        refs,
        blocks,
    })
}

/// Decodes the segments of a walked path.
pub(crate) fn decode(pool: &BlockPool, layout: Layout, walk: &PathWalk) -> Result<DecodedPath, String> {
    let spb = layout.subblocks_per_block();
    let sw = layout.subblock_words;
    let mut segments = Vec::new();
    let mut refs = walk.refs.iter().copied();

    while let Some(id) = refs.next() {
        let kind = id
            .tag()
            .and_then(BlockTag::segment_kind)
            .ok_or_else(|| format!("unexpected reference {:#x}", id.raw()))?;
        let n = kind.components();

        let mut subblocks = Vec::with_capacity(n);
        let mut current = id.index();
        while subblocks.len() < n {
            subblocks.push(current);
            if subblocks.len() == n {
                break;
            }
            if (current + 1) % spb == 0 {
                let next = refs
                    .next()
                    .filter(|r| r.tag() == Some(BlockTag::Next))
                    .ok_or_else(|| format!("missing continuation after {:#x}", id.raw()))?;
                current = next.index();
            } else {
                current += 1;
            }
        }

        let components: Vec<&[u32]> = subblocks
            .iter()
            .map(|&s| {
                let words = pool.block(s / spb);
                let base = (s % spb) as usize * sw;
                &words[base..base + sw]
            })
            .collect();
        // padding only follows the written lanes
        for lane in 0..sw {
            if components.iter().all(|c| c[lane] == LANE_PAD) {
                break;
            }
            segments.push(Segment {
                kind,
                coords: components.iter().map(|c| f32::from_bits(c[lane])).collect(),
            });
        }
    }

    Ok(DecodedPath {
        header: walk.header,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: Layout = Layout {
        block_words: 16,
        subblock_words: 4,
    };

    /// Head in block 0, one line batch in block 1.
    fn one_line(pool: &mut BlockPool) {
        let mut header = PathHeader::new();
        header.handle = 5;
        header.blocks = 2;
        header.prims = 1;
        let head = pool.block_mut(0);
        head.fill(TaggedBlockRef::INVALID.raw());
        header.write(head);
        head[HEAD_WORDS] = TaggedBlockRef::new(BlockTag::Line, 4).raw();

        let segs = pool.block_mut(1);
        segs.fill(LANE_PAD);
        for (c, v) in [1.0f32, 2.0, 3.0, 4.0].into_iter().enumerate() {
            segs[c * 4] = v.to_bits();
        }
    }

    #[test]
    fn test_walk_collects_blocks() {
        let mut pool = BlockPool::new(8, 16);
        one_line(&mut pool);
        let walk = walk(&pool, LAYOUT, 0).unwrap();
        assert_eq!(walk.refs.len(), 1);
        assert_eq!(walk.blocks, BTreeSet::from([0, 1]));
        assert_eq!(walk.header.handle, 5);
    }

    #[test]
    fn test_decode_skips_padding() {
        let mut pool = BlockPool::new(8, 16);
        one_line(&mut pool);
        let walk = walk(&pool, LAYOUT, 0).unwrap();
        let path = decode(&pool, LAYOUT, &walk).unwrap();
        assert_eq!(
            path.segments,
            vec![Segment {
                kind: SegmentKind::Line,
                coords: vec![1.0, 2.0, 3.0, 4.0],
            }]
        );
    }

    #[test]
    fn test_decode_keeps_degenerate_segments() {
        let mut pool = BlockPool::new(8, 16);
        one_line(&mut pool);
        // a second line of all zeros in lane 1
        let segs = pool.block_mut(1);
        for c in 0..4 {
            segs[c * 4 + 1] = 0.0f32.to_bits();
        }
        let walk = walk(&pool, LAYOUT, 0).unwrap();
        let path = decode(&pool, LAYOUT, &walk).unwrap();
        assert_eq!(path.segments.len(), 2);
        assert_eq!(path.segments[1].coords, vec![0.0; 4]);
    }

    #[test]
    fn test_walk_rejects_node_cycle() {
        let mut pool = BlockPool::new(8, 16);
        one_line(&mut pool);
        let head = pool.block_mut(0);
        for slot in HEAD_WORDS + 1..15 {
            head[slot] = TaggedBlockRef::new(BlockTag::Line, 4).raw();
        }
        head[15] = TaggedBlockRef::new(BlockTag::Next, 0).raw();
        assert!(walk(&pool, LAYOUT, 0).is_err());
    }
}
