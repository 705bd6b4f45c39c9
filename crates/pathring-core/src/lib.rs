//! # PathRing Core
//!
//! Scheduling and resource-lifecycle core of a GPU vector-graphics runtime.
//!
//! Paths are streamed into a host-mapped ring of fixed-size blocks and copied
//! to a device block pool in batches. Every resource is identified by a
//! small handle carrying separate host and device reference counts; handles
//! are reclaimed in batches by device kernels. Device work is ordered by
//! grids: small dependency-tracked units with three callbacks.
//!
//! ## Core Abstractions
//!
//! - [`Suballocator`] - Block ring allocator for host temporary memory
//! - [`HandlePool`] - Dual-refcount handles with batched reclamation
//! - [`GridScheduler`] - Dependency scheduler over resource handles
//! - [`PathBuilder`] - Streaming path encoder
//! - [`Runtime`] - Cooperative dispatcher tying the above to a [`Device`]
//!
//! ## Example
//!
//! ```ignore
//! use pathring_core::prelude::*;
//!
//! let rt = Runtime::new(RuntimeConfig::default(), device)?.into_shared();
//! let mut pb = PathBuilder::new(&rt)?;
//! pb.begin()?;
//! pb.line([0.0, 0.0, 1.0, 1.0])?;
//! let path = pb.end()?;
//! rt.borrow_mut().wait_idle()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod config;
pub mod device;
pub mod error;
pub mod grid;
pub mod handle;
pub mod handle_pool;
pub mod path_builder;
pub mod queue_pool;
pub mod raster_builder;
pub mod ringdex;
pub mod runtime;
pub mod suballocator;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::block::{
        BlockTag, CopyCommand, CopyTag, PathHeader, SegmentKind, TaggedBlockRef, HEAD_WORDS,
    };
    pub use crate::config::{
        BlockConfig, DeviceConfig, HandlePoolConfig, RasterConfig, RingConfig, RuntimeConfig,
        RuntimeConfigBuilder, SchedulerConfig, TempConfig,
    };
    pub use crate::device::*;
    pub use crate::error::*;
    pub use crate::grid::{EventKind, GridEvent, GridId, GridOwner, GridScheduler, GridState, OwnerId};
    pub use crate::handle::{Handle, HandleType, Path, Raster, RefCount, TypedHandle};
    pub use crate::handle_pool::{HandlePool, HandlePoolStats, ReclaimBatch};
    pub use crate::path_builder::{PathBuilder, PathBuilderImpl, PathBuilderStats, RingPathBuilder};
    pub use crate::queue_pool::{QueuePool, QueuePoolStats};
    pub use crate::raster_builder::{RasterBuilder, RasterBuilderStats};
    pub use crate::ringdex::{Cursor, RingGeometry, Ringdex};
    pub use crate::runtime::{
        Completion, CompletionAction, Runtime, RuntimeStats, SharedRuntime,
    };
    pub use crate::suballocator::{Span, Suballocator, SuballocatorStats, SubbufId};
}

// Re-exports for convenience
pub use config::RuntimeConfig;
pub use device::{Device, Kernel};
pub use error::{PathRingError, Result};
pub use grid::{GridId, GridScheduler};
pub use handle::{Handle, HandleType, Path, Raster, TypedHandle};
pub use handle_pool::HandlePool;
pub use path_builder::PathBuilder;
pub use raster_builder::RasterBuilder;
pub use runtime::{Runtime, SharedRuntime};
pub use suballocator::Suballocator;
