//! Device block layout: tagged block references, copy commands and the path
//! header.
//!
//! A path lives on the device as a singly linked list of fixed-size blocks.
//! The head block starts with a [`PathHeader`] followed by tagged references;
//! node blocks hold only tagged references; segment blocks hold coordinate
//! subblocks. Every reference is a packed 32-bit [`TaggedBlockRef`] whose index
//! addresses a *subblock*: `block * subblocks_per_block + subblock`.

use std::fmt;

use bytemuck::{Pod, Zeroable};

/// Width of the tag field in a tagged reference.
pub const TAG_BITS: u32 = 5;
/// Width of the index field in a tagged reference.
pub const INDEX_BITS: u32 = 27;
/// Mask for the tag field.
pub const TAG_MASK: u32 = (1 << TAG_BITS) - 1;
/// Mask for the index field (after shifting).
pub const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

const _: () = assert!(TAG_BITS + INDEX_BITS == 32);

/// Width of the tag field in a copy command.
pub const COPY_TAG_BITS: u32 = 2;
/// Largest rolling id a copy command can carry.
pub const COPY_ROLLING_MASK: u32 = u32::MAX >> COPY_TAG_BITS;

/// Words occupied by the path header at the start of a head block.
pub const HEAD_WORDS: usize = 8;

/// Fill of the unwritten lanes of a segment batch. A NaN pattern that
/// [`coord_word`] never produces.
pub const LANE_PAD: u32 = u32::MAX;

/// Storage word of a segment coordinate. Every NaN is stored as the
/// canonical quiet NaN so no coordinate collides with [`LANE_PAD`].
pub fn coord_word(value: f32) -> u32 {
    if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Element kind carried in the low bits of a tagged reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockTag {
    /// Line segment subblocks.
    Line = 0,
    /// Quadratic segment subblocks.
    Quad = 1,
    /// Cubic segment subblocks.
    Cubic = 2,
    /// Rational quadratic segment subblocks.
    RationalQuad = 3,
    /// Rational cubic segment subblocks.
    RationalCubic = 4,
    /// Continuation of the previous element, or a forward pointer when in the
    /// last slot of a node.
    Next = 30,
    /// Unused slot.
    Invalid = 31,
}

impl BlockTag {
    /// Decodes a tag field.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits & TAG_MASK {
            0 => Some(Self::Line),
            1 => Some(Self::Quad),
            2 => Some(Self::Cubic),
            3 => Some(Self::RationalQuad),
            4 => Some(Self::RationalCubic),
            30 => Some(Self::Next),
            31 => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Returns the segment kind for element tags.
    pub fn segment_kind(self) -> Option<SegmentKind> {
        match self {
            Self::Line => Some(SegmentKind::Line),
            Self::Quad => Some(SegmentKind::Quad),
            Self::Cubic => Some(SegmentKind::Cubic),
            Self::RationalQuad => Some(SegmentKind::RationalQuad),
            Self::RationalCubic => Some(SegmentKind::RationalCubic),
            Self::Next | Self::Invalid => None,
        }
    }
}

/// Path element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// `x0 y0 x1 y1`
    Line,
    /// `x0 y0 x1 y1 x2 y2`
    Quad,
    /// `x0 y0 x1 y1 x2 y2 x3 y3`
    Cubic,
    /// Quadratic with a weight on the control point.
    RationalQuad,
    /// Cubic with weights on both control points.
    RationalCubic,
}

impl SegmentKind {
    /// The tag written for the first reference of this element.
    pub fn tag(self) -> BlockTag {
        match self {
            Self::Line => BlockTag::Line,
            Self::Quad => BlockTag::Quad,
            Self::Cubic => BlockTag::Cubic,
            Self::RationalQuad => BlockTag::RationalQuad,
            Self::RationalCubic => BlockTag::RationalCubic,
        }
    }

    /// Number of coordinate components, one subblock each.
    pub fn components(self) -> usize {
        match self {
            Self::Line => 4,
            Self::Quad => 6,
            Self::Cubic => 8,
            Self::RationalQuad => 7,
            Self::RationalCubic => 10,
        }
    }

    /// Dense index for per-kind tables of the encodable kinds.
    pub(crate) fn lane_index(self) -> Option<usize> {
        match self {
            Self::Line => Some(0),
            Self::Quad => Some(1),
            Self::Cubic => Some(2),
            Self::RationalQuad | Self::RationalCubic => None,
        }
    }
}

/// A packed `(tag, index)` reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct TaggedBlockRef(u32);

impl TaggedBlockRef {
    /// The padding value: every bit set.
    pub const INVALID: Self = Self(u32::MAX);

    /// Packs a tag and a subblock index.
    #[inline]
    pub fn new(tag: BlockTag, index: u32) -> Self {
        debug_assert!(index <= INDEX_MASK, "subblock index out of range");
        Self(((index & INDEX_MASK) << TAG_BITS) | tag as u32)
    }

    /// Reinterprets a raw word.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The tag, if it is a known one.
    #[inline]
    pub fn tag(self) -> Option<BlockTag> {
        BlockTag::from_bits(self.0)
    }

    /// The subblock index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0 >> TAG_BITS
    }

    /// True for padding slots.
    #[inline]
    pub fn is_invalid(self) -> bool {
        self.tag() == Some(BlockTag::Invalid)
    }

    /// Splits the index into `(block, subblock)`.
    #[inline]
    pub fn split(self, subblocks_per_block: u32) -> (u32, u32) {
        let index = self.index();
        (index / subblocks_per_block, index % subblocks_per_block)
    }

    /// Same tag, different index.
    #[inline]
    pub fn with_index(self, index: u32) -> Self {
        Self(((index & INDEX_MASK) << TAG_BITS) | (self.0 & TAG_MASK))
    }
}

impl fmt::Debug for TaggedBlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return f.write_str("Invalid");
        }
        match self.tag() {
            Some(tag) => write!(f, "{:?}@{}", tag, self.index()),
            None => write!(f, "Unknown({:#010x})", self.0),
        }
    }
}

/// Kind of block recorded in the companion copy-command word of a ring block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyTag {
    /// Coordinate subblocks, copied verbatim.
    Segs = 0,
    /// Reference node, references translated.
    Node = 1,
    /// Path head, references translated and handle published.
    Head = 2,
}

/// One copy command: `(rolling << 2) | tag`.
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct CopyCommand(u32);

impl CopyCommand {
    /// Packs a copy tag with the rolling id of the block.
    #[inline]
    pub fn new(tag: CopyTag, rolling: u32) -> Self {
        Self(((rolling & COPY_ROLLING_MASK) << COPY_TAG_BITS) | tag as u32)
    }

    /// Reinterprets a raw word.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw word.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Decoded tag.
    pub fn tag(self) -> Option<CopyTag> {
        match self.0 & ((1 << COPY_TAG_BITS) - 1) {
            0 => Some(CopyTag::Segs),
            1 => Some(CopyTag::Node),
            2 => Some(CopyTag::Head),
            _ => None,
        }
    }

    /// Rolling id of the block.
    #[inline]
    pub const fn rolling(self) -> u32 {
        self.0 >> COPY_TAG_BITS
    }
}

impl fmt::Debug for CopyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.tag(), self.rolling())
    }
}

/// The first [`HEAD_WORDS`] words of a path's head block.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct PathHeader {
    /// Untyped handle of the path.
    pub handle: u32,
    /// Total blocks: segments, nodes and the head.
    pub blocks: u32,
    /// Node blocks, excluding the head.
    pub nodes: u32,
    /// Lane batches reserved by the path.
    pub prims: u32,
    /// `[x0, y0, x1, y1]`
    pub bounds: [f32; 4],
}

const _: () = assert!(std::mem::size_of::<PathHeader>() == HEAD_WORDS * 4);

impl PathHeader {
    /// Bounds of a path with no points.
    pub const EMPTY_BOUNDS: [f32; 4] = [
        f32::INFINITY,
        f32::INFINITY,
        f32::NEG_INFINITY,
        f32::NEG_INFINITY,
    ];

    /// A header with zero counts and empty bounds.
    pub fn new() -> Self {
        Self {
            handle: 0,
            blocks: 0,
            nodes: 0,
            prims: 0,
            bounds: Self::EMPTY_BOUNDS,
        }
    }

    /// Reads a header from the front of a head block.
    pub fn read(words: &[u32]) -> Self {
        let mut raw = [0u32; HEAD_WORDS];
        raw.copy_from_slice(&words[..HEAD_WORDS]);
        bytemuck::cast(raw)
    }

    /// Writes the header to the front of a head block.
    pub fn write(&self, words: &mut [u32]) {
        let raw: [u32; HEAD_WORDS] = bytemuck::cast(*self);
        words[..HEAD_WORDS].copy_from_slice(&raw);
    }

    /// Grows the bounds to include a point.
    pub fn include(&mut self, x: f32, y: f32) {
        self.bounds[0] = self.bounds[0].min(x);
        self.bounds[1] = self.bounds[1].min(y);
        self.bounds[2] = self.bounds[2].max(x);
        self.bounds[3] = self.bounds[3].max(y);
    }
}

impl Default for PathHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_ref_packing() {
        let r = TaggedBlockRef::new(BlockTag::Cubic, 1234);
        assert_eq!(r.tag(), Some(BlockTag::Cubic));
        assert_eq!(r.index(), 1234);
        assert_eq!(r.raw(), (1234 << 5) | 2);
        assert!(!r.is_invalid());

        assert_eq!(r.split(4), (308, 2));
        assert_eq!(r.with_index(8).tag(), Some(BlockTag::Cubic));
        assert_eq!(r.with_index(8).index(), 8);
    }

    #[test]
    fn test_invalid_is_all_ones() {
        assert_eq!(TaggedBlockRef::INVALID.raw(), u32::MAX);
        assert!(TaggedBlockRef::INVALID.is_invalid());
        assert_eq!(TaggedBlockRef::INVALID.tag(), Some(BlockTag::Invalid));
        assert_eq!(format!("{:?}", TaggedBlockRef::INVALID), "Invalid");
    }

    #[test]
    fn test_max_index() {
        let r = TaggedBlockRef::new(BlockTag::Next, INDEX_MASK);
        assert_eq!(r.index(), INDEX_MASK);
        assert_eq!(r.tag(), Some(BlockTag::Next));
    }

    #[test]
    fn test_unknown_tag() {
        let r = TaggedBlockRef::from_raw((7 << TAG_BITS) | 9);
        assert_eq!(r.tag(), None);
        assert!(format!("{:?}", r).starts_with("Unknown"));
    }

    #[test]
    fn test_copy_command() {
        let cmd = CopyCommand::new(CopyTag::Head, 77);
        assert_eq!(cmd.tag(), Some(CopyTag::Head));
        assert_eq!(cmd.rolling(), 77);
        assert_eq!(CopyCommand::from_raw(cmd.raw()), cmd);
    }

    #[test]
    fn test_header_roundtrip_through_words() {
        let mut header = PathHeader::new();
        header.handle = 5;
        header.blocks = 3;
        header.nodes = 1;
        header.prims = 2;
        header.include(1.0, -2.0);
        header.include(-4.0, 8.0);

        let mut words = vec![0u32; 16];
        header.write(&mut words);
        assert_eq!(words[0], 5);
        assert_eq!(words[1], 3);
        assert_eq!(f32::from_bits(words[4]), -4.0);

        let read = PathHeader::read(&words);
        assert_eq!(read, header);
        assert_eq!(read.bounds, [-4.0, -2.0, 1.0, 8.0]);
    }

    #[test]
    fn test_segment_components() {
        assert_eq!(SegmentKind::Line.components(), 4);
        assert_eq!(SegmentKind::Quad.components(), 6);
        assert_eq!(SegmentKind::Cubic.components(), 8);
        assert_eq!(BlockTag::Quad.segment_kind(), Some(SegmentKind::Quad));
        assert_eq!(BlockTag::Next.segment_kind(), None);
        assert_eq!(SegmentKind::RationalCubic.lane_index(), None);
    }
}
