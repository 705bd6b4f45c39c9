//! Compute device abstraction.
//!
//! The runtime drives a device through kernel launches and buffer
//! map/unmap operations, all ordered against a command queue. Mapping moves a
//! buffer's storage to the host as an owned `Vec<u32>`; unmapping hands it
//! back. Completion callbacks run on the device's own thread and must only
//! forward a message to the runtime's inbox.

use std::fmt;

use crate::error::Result;

/// Command queue id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

/// Device buffer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Token identifying one enqueued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(pub u64);

/// Outcome delivered to a completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The command finished.
    Complete,
    /// The command failed.
    Failed(String),
}

/// Callback invoked once when a command finishes.
pub type CompletionCallback = Box<dyn FnOnce(CompletionStatus) + Send + 'static>;

/// A contiguous run of ring positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingSpan {
    /// First ring block.
    pub from: u32,
    /// Number of blocks.
    pub count: u32,
}

/// Buffers backing one path builder's block ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBuffers {
    /// Block storage per subbuffer.
    pub blocks: Vec<BufferId>,
    /// Copy-command words per subbuffer.
    pub cmds: Vec<BufferId>,
    /// Blocks per subbuffer.
    pub blocks_per_subbuf: u32,
}

/// Arguments of the path copy kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsCopy {
    /// The builder's ring.
    pub ring: RingBuffers,
    /// Scratch buffer written by the matching alloc kernel.
    pub reads: BufferId,
    /// Slot of `reads` holding the allocation.
    pub slot: u32,
    /// Rolling id of the first block of the launch.
    pub rolling_base: u32,
    /// Partial path carried over from the previous launch.
    pub prev: RingSpan,
    /// Blocks filled since the previous launch.
    pub curr: RingSpan,
}

impl PathsCopy {
    /// Blocks copied by this launch.
    pub fn blocks(&self) -> u32 {
        self.prev.count + self.curr.count
    }
}

/// One raster in a raster build launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterCmd {
    /// Untyped raster handle.
    pub raster: u32,
    /// Offset of the raster's first path in the staged path list.
    pub first: u32,
    /// Number of paths.
    pub count: u32,
}

/// Kernels the runtime launches.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// Pop `blocks` block ids from the device block pool into `reads[slot]`.
    PathsAlloc {
        /// Scratch buffer.
        reads: BufferId,
        /// Slot within the scratch buffer.
        slot: u32,
        /// Number of blocks.
        blocks: u32,
    },
    /// Copy ring blocks into pool blocks and publish path heads.
    PathsCopy(PathsCopy),
    /// Return every block of the given paths to the pool.
    PathsReclaim {
        /// Untyped path handles.
        handles: Vec<u32>,
    },
    /// Drop the given rasters.
    RastersReclaim {
        /// Untyped raster handles.
        handles: Vec<u32>,
    },
    /// Build a cohort of rasters from published paths.
    RastersBuild {
        /// Untyped path handles, staged from host temporary memory.
        paths: Vec<u32>,
        /// Rasters over `paths`.
        rasters: Vec<RasterCmd>,
    },
}

impl Kernel {
    /// Kernel name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PathsAlloc { .. } => "paths_alloc",
            Self::PathsCopy(_) => "paths_copy",
            Self::PathsReclaim { .. } => "paths_reclaim",
            Self::RastersReclaim { .. } => "rasters_reclaim",
            Self::RastersBuild { .. } => "rasters_build",
        }
    }
}

/// A compute device.
pub trait Device: Send + Sync {
    /// Device name.
    fn name(&self) -> &str;

    /// Creates an in-order command queue.
    fn create_queue(&self) -> Result<QueueId>;

    /// Creates a zeroed device buffer of `words` words.
    fn create_buffer(&self, words: usize) -> Result<BufferId>;

    /// Destroys a buffer.
    fn release_buffer(&self, buffer: BufferId) -> Result<()>;

    /// Enqueues a kernel.
    fn enqueue_kernel(&self, queue: QueueId, kernel: Kernel) -> Result<CompletionToken>;

    /// Registers a callback for a token. Runs immediately if the token has
    /// already completed.
    fn set_completion_callback(
        &self,
        token: CompletionToken,
        callback: CompletionCallback,
    ) -> Result<()>;

    /// Enqueues a map: once complete, [`take_mapping`](Self::take_mapping)
    /// yields the buffer's storage.
    fn map_buffer(&self, queue: QueueId, buffer: BufferId) -> Result<CompletionToken>;

    /// Enqueues an unmap returning `data` to the device.
    fn unmap_buffer(
        &self,
        queue: QueueId,
        buffer: BufferId,
        data: Vec<u32>,
    ) -> Result<CompletionToken>;

    /// Takes the storage of a completed map.
    fn take_mapping(&self, buffer: BufferId) -> Result<Vec<u32>>;

    /// Blocks until a command completes.
    fn wait(&self, token: CompletionToken) -> Result<()>;

    /// True once a command has completed.
    fn is_complete(&self, token: CompletionToken) -> bool;

    /// Submits any batched commands on a queue.
    fn flush(&self, queue: QueueId) -> Result<()>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name()).finish()
    }
}
