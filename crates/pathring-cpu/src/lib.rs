//! # PathRing CPU Backend
//!
//! A compute device simulated on a worker thread. It owns the device block
//! pool and the handle map, executes the path copy, reclamation and raster
//! build kernels, and can decode published paths for inspection.
//!
//! This backend is the reference the runtime is tested against and the
//! fallback when no GPU backend is available.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block_pool;
mod device;
mod inspect;
mod kernels;

pub use block_pool::BlockPool;
pub use device::{CpuDevice, CpuDeviceStats};
pub use inspect::{DecodedPath, Layout, Segment};
pub use kernels::RasterInfo;
