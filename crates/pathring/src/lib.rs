//! # PathRing
//!
//! Streaming path encoding and resource lifecycle runtime for GPU vector
//! graphics.
//!
//! ## Features
//!
//! - **Streaming path encoder** writing straight into a host-mapped block ring
//! - **Dual reference counts** per handle, host and device, with batched
//!   device-side reclamation
//! - **Grid scheduler** ordering device work by resource dependencies
//! - **Simulated CPU device** for tests and as a fallback
//!
//! ## Quick Start
//!
//! ```ignore
//! use pathring::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let ring = PathRing::builder().backend(Backend::Auto).build()?;
//!
//!     let mut pb = ring.path_builder()?;
//!     pb.begin()?;
//!     pb.line([0.0, 0.0, 8.0, 0.0])?;
//!     pb.quad([8.0, 0.0, 12.0, 4.0, 8.0, 8.0])?;
//!     let path = pb.end()?;
//!
//!     let mut rb = ring.raster_builder()?;
//!     rb.add(&[path])?;
//!     let raster = rb.end()?;
//!
//!     ring.raster_flush(&[raster])?;
//!     ring.path_release(&[path])?;
//!     ring.wait_idle()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Host                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │ PathBuilder │──│   Runtime   │──│  RasterBuilder  │  │
//! │  │ (ring)      │  │ grids/pool  │  │  (cohorts)      │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────┘  │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ map / unmap, kernels
//! ┌──────────────────────────┴──────────────────────────────┐
//! │                   Device                                │
//! │  ┌───────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ Block     │  │ Handle map    │  │ Raster        │    │
//! │  │ pool      │  │ (path heads)  │  │ records       │    │
//! │  └───────────┘  └───────────────┘  └───────────────┘    │
//! └─────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

// Re-export core types
pub use pathring_core::*;

// Re-export CPU backend
#[cfg(feature = "cpu")]
pub use pathring_cpu::{CpuDevice, CpuDeviceStats, DecodedPath, RasterInfo, Segment};

use std::sync::Arc;

use pathring_core::device::Device;
use pathring_core::error::Result;
use pathring_core::handle::{HandleType, Path, Raster, TypedHandle};
use pathring_core::path_builder::PathBuilder;
use pathring_core::raster_builder::RasterBuilder;
use pathring_core::runtime::{Runtime, RuntimeStats, SharedRuntime};
use pathring_core::RuntimeConfig;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Backend, PathRing, PathRingBuilder};
    pub use pathring_core::prelude::*;

    #[cfg(feature = "cpu")]
    pub use pathring_cpu::{CpuDevice, DecodedPath, RasterInfo, Segment};
}

/// Device backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Best available backend.
    #[default]
    Auto,
    /// Simulated device on a worker thread.
    Cpu,
}

/// The runtime context.
///
/// Owns the shared runtime; path and raster builders hold back references to
/// it. Not `Send`: a context and its builders live on one thread.
pub struct PathRing {
    rt: SharedRuntime,
    backend: Backend,
    #[cfg(feature = "cpu")]
    cpu: Option<Arc<CpuDevice>>,
}

impl PathRing {
    /// Create a new context builder.
    pub fn builder() -> PathRingBuilder {
        PathRingBuilder::new()
    }

    /// Create a context with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a context over a caller-supplied device.
    pub fn with_device(config: RuntimeConfig, device: Arc<dyn Device>) -> Result<Self> {
        let rt = Runtime::new(config, device)?.into_shared();
        Ok(Self {
            rt,
            backend: Backend::Auto,
            #[cfg(feature = "cpu")]
            cpu: None,
        })
    }

    /// The backend in use.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The runtime configuration.
    pub fn config(&self) -> RuntimeConfig {
        *self.rt.borrow().config()
    }

    /// The shared runtime.
    pub fn runtime(&self) -> &SharedRuntime {
        &self.rt
    }

    /// The CPU device, when that backend is in use.
    #[cfg(feature = "cpu")]
    pub fn cpu_device(&self) -> Option<&Arc<CpuDevice>> {
        self.cpu.as_ref()
    }

    /// Creates a path builder.
    pub fn path_builder(&self) -> Result<PathBuilder> {
        PathBuilder::new(&self.rt)
    }

    /// Creates a raster builder.
    pub fn raster_builder(&self) -> Result<RasterBuilder> {
        RasterBuilder::new(&self.rt)
    }

    /// Host retain of paths.
    pub fn path_retain(&self, paths: &[Path]) -> Result<()> {
        self.retain(&raws(paths), HandleType::Path)
    }

    /// Host release of paths.
    pub fn path_release(&self, paths: &[Path]) -> Result<()> {
        self.release(&raws(paths), HandleType::Path)
    }

    /// Starts the device work producing these paths.
    pub fn path_flush(&self, paths: &[Path]) -> Result<()> {
        self.rt
            .borrow_mut()
            .flush_handles(&raws(paths), HandleType::Path)
    }

    /// Host retain of rasters.
    pub fn raster_retain(&self, rasters: &[Raster]) -> Result<()> {
        self.retain(&raws(rasters), HandleType::Raster)
    }

    /// Host release of rasters.
    pub fn raster_release(&self, rasters: &[Raster]) -> Result<()> {
        self.release(&raws(rasters), HandleType::Raster)
    }

    /// Starts the device work producing these rasters.
    pub fn raster_flush(&self, rasters: &[Raster]) -> Result<()> {
        self.rt
            .borrow_mut()
            .flush_handles(&raws(rasters), HandleType::Raster)
    }

    fn retain(&self, raws: &[u32], ty: HandleType) -> Result<()> {
        self.rt.borrow_mut().retain(raws, ty)
    }

    fn release(&self, raws: &[u32], ty: HandleType) -> Result<()> {
        let mut rt = self.rt.borrow_mut();
        rt.release(raws, ty)?;
        rt.dispatch(None).map(|_| ())
    }

    /// Forces all pending work and waits until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.rt.borrow_mut().wait_idle()
    }

    /// Runtime statistics.
    pub fn stats(&self) -> RuntimeStats {
        self.rt.borrow().stats()
    }
}

impl std::fmt::Debug for PathRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRing")
            .field("backend", &self.backend)
            .field("runtime", &self.rt)
            .finish()
    }
}

fn raws<H: TypedHandle>(handles: &[H]) -> Vec<u32> {
    handles.iter().map(|h| h.raw()).collect()
}

/// Builder for a [`PathRing`] context.
#[derive(Debug, Clone, Default)]
pub struct PathRingBuilder {
    backend: Backend,
    config: RuntimeConfig,
}

impl PathRingBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend.
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the runtime configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the context.
    pub fn build(self) -> Result<PathRing> {
        self.config.validate()?;
        match self.backend {
            Backend::Auto | Backend::Cpu => self.build_cpu(),
        }
    }

    #[cfg(feature = "cpu")]
    fn build_cpu(self) -> Result<PathRing> {
        let device = Arc::new(CpuDevice::new(&self.config)?);
        let rt = Runtime::new(self.config, device.clone())?.into_shared();
        tracing::info!(backend = ?Backend::Cpu, "path ring ready");
        Ok(PathRing {
            rt,
            backend: Backend::Cpu,
            cpu: Some(device),
        })
    }

    #[cfg(not(feature = "cpu"))]
    fn build_cpu(self) -> Result<PathRing> {
        Err(pathring_core::PathRingError::BackendUnavailable(
            "CPU feature not enabled".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = PathRingBuilder::new();
        assert_eq!(builder.backend, Backend::Auto);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RuntimeConfig::minimal();
        config.ring.subbufs = 1;
        let err = PathRing::builder().config(config).build().unwrap_err();
        assert!(matches!(err, PathRingError::InvalidConfig(_)));
    }

    #[cfg(feature = "cpu")]
    #[test]
    fn test_auto_selects_cpu() {
        let ring = PathRing::builder()
            .config(RuntimeConfig::minimal())
            .build()
            .unwrap();
        assert_eq!(ring.backend(), Backend::Cpu);
        assert!(ring.cpu_device().is_some());
    }
}
