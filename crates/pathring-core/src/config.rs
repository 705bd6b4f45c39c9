//! Runtime configuration.
//!
//! All sizes are fixed when the runtime is created. The ring, handle pool and
//! grid pool are preallocated from these values and never grow.

use crate::block::{HEAD_WORDS, INDEX_BITS};
use crate::error::{PathRingError, Result};

/// Geometry of device blocks and coordinate subblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    /// Words per block (power of two).
    pub block_words: u32,
    /// Words per coordinate subblock (power of two, at most `block_words`).
    pub subblock_words: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            block_words: 32,
            subblock_words: 8,
        }
    }
}

impl BlockConfig {
    /// Number of subblocks in one block.
    pub fn subblocks_per_block(&self) -> u32 {
        self.block_words / self.subblock_words
    }
}

/// Geometry of the host-mapped block ring used by path builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of independently mappable subbuffers.
    pub subbufs: u32,
    /// Blocks in each subbuffer.
    pub blocks_per_subbuf: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            subbufs: 8,
            blocks_per_subbuf: 64,
        }
    }
}

impl RingConfig {
    /// Total blocks in the ring.
    pub fn ring_blocks(&self) -> u32 {
        self.subbufs * self.blocks_per_subbuf
    }
}

/// Handle pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlePoolConfig {
    /// Total number of handles (multiple of `block_width`).
    pub handles: u32,
    /// Handles per acquisition/reclamation block.
    pub block_width: u32,
    /// Reclaim records available for in-flight reclamation batches.
    pub reclaim_records: u32,
}

impl Default for HandlePoolConfig {
    fn default() -> Self {
        Self {
            handles: 4096,
            block_width: 64,
            reclaim_records: 32,
        }
    }
}

/// Grid scheduler sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Capacity of the grid pool.
    pub grids: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { grids: 1024 }
    }
}

/// Host temporary allocator sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempConfig {
    /// Blocks in the temporary ring (power of two).
    pub blocks: u32,
    /// Words per temporary block.
    pub block_words: u32,
}

impl Default for TempConfig {
    fn default() -> Self {
        Self {
            blocks: 256,
            block_words: 64,
        }
    }
}

impl TempConfig {
    /// Total words in the temporary extent.
    pub fn extent_words(&self) -> usize {
        self.blocks as usize * self.block_words as usize
    }
}

/// Device-side sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Blocks in the device block pool.
    pub pool_blocks: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { pool_blocks: 1 << 16 }
    }
}

/// Raster builder batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterConfig {
    /// Rasters per cohort before the cohort grid is started eagerly.
    pub cohort_rasters: u32,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self { cohort_rasters: 32 }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    /// Block geometry.
    pub block: BlockConfig,
    /// Path ring geometry.
    pub ring: RingConfig,
    /// Handle pool sizing.
    pub handles: HandlePoolConfig,
    /// Grid scheduler sizing.
    pub scheduler: SchedulerConfig,
    /// Host temporary allocator sizing.
    pub temp: TempConfig,
    /// Device sizing.
    pub device: DeviceConfig,
    /// Raster builder batching.
    pub raster: RasterConfig,
}

impl RuntimeConfig {
    /// Creates a tiny configuration for tests: 16-word blocks, 4-word
    /// subblocks, two subbuffers of four blocks.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            block: BlockConfig {
                block_words: 16,
                subblock_words: 4,
            },
            ring: RingConfig {
                subbufs: 2,
                blocks_per_subbuf: 4,
            },
            handles: HandlePoolConfig {
                handles: 64,
                block_width: 8,
                reclaim_records: 4,
            },
            scheduler: SchedulerConfig { grids: 16 },
            temp: TempConfig {
                blocks: 16,
                block_words: 16,
            },
            device: DeviceConfig { pool_blocks: 256 },
            raster: RasterConfig { cohort_rasters: 4 },
        }
    }

    /// Creates a configuration for large scenes: a deep ring and a large
    /// handle space.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self {
            block: BlockConfig {
                block_words: 64,
                subblock_words: 8,
            },
            ring: RingConfig {
                subbufs: 16,
                blocks_per_subbuf: 256,
            },
            handles: HandlePoolConfig {
                handles: 1 << 16,
                block_width: 128,
                reclaim_records: 64,
            },
            scheduler: SchedulerConfig { grids: 4096 },
            temp: TempConfig {
                blocks: 1024,
                block_words: 256,
            },
            device: DeviceConfig { pool_blocks: 1 << 20 },
            raster: RasterConfig { cohort_rasters: 128 },
        }
    }

    /// Checks every size constraint the runtime relies on.
    pub fn validate(&self) -> Result<()> {
        let b = &self.block;
        if !b.block_words.is_power_of_two() || !b.subblock_words.is_power_of_two() {
            return Err(PathRingError::invalid_config(
                "block and subblock words must be powers of two",
            ));
        }
        if b.subblock_words > b.block_words {
            return Err(PathRingError::invalid_config(
                "subblock cannot be larger than a block",
            ));
        }
        // the head needs its header plus room for a reference and a forward slot
        if b.block_words < HEAD_WORDS as u32 * 2 {
            return Err(PathRingError::invalid_config(format!(
                "block_words must be at least {}",
                HEAD_WORDS * 2
            )));
        }

        let r = &self.ring;
        if r.subbufs < 2 || r.blocks_per_subbuf < 2 {
            return Err(PathRingError::invalid_config(
                "ring needs at least two subbuffers of two blocks",
            ));
        }

        let index_limit = 1u64 << INDEX_BITS;
        let spb = u64::from(b.subblocks_per_block());
        if u64::from(r.ring_blocks()) * spb >= index_limit
            || u64::from(self.device.pool_blocks) * spb >= index_limit
        {
            return Err(PathRingError::invalid_config(
                "subblock ids overflow the reference index",
            ));
        }
        if self.device.pool_blocks < r.ring_blocks() {
            return Err(PathRingError::invalid_config(
                "device pool must hold at least one full ring",
            ));
        }

        let h = &self.handles;
        if h.block_width == 0 || h.handles < h.block_width || h.handles % h.block_width != 0 {
            return Err(PathRingError::invalid_config(
                "handle count must be a nonzero multiple of the block width",
            ));
        }
        if h.handles > crate::handle::MAX_HANDLES {
            return Err(PathRingError::invalid_config(
                "handle count collides with the type guard bits",
            ));
        }
        if h.reclaim_records == 0 {
            return Err(PathRingError::invalid_config("reclaim_records must be nonzero"));
        }

        if self.scheduler.grids == 0 {
            return Err(PathRingError::invalid_config("grid pool cannot be empty"));
        }

        if !self.temp.blocks.is_power_of_two() || self.temp.block_words == 0 {
            return Err(PathRingError::invalid_config(
                "temp blocks must be a power of two with nonzero block size",
            ));
        }

        if self.raster.cohort_rasters == 0 {
            return Err(PathRingError::invalid_config("cohort_rasters must be nonzero"));
        }

        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the minimal test configuration.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: RuntimeConfig::minimal(),
        }
    }

    /// Sets block and subblock sizes in words.
    #[must_use]
    pub fn with_block_words(mut self, block_words: u32, subblock_words: u32) -> Self {
        self.config.block = BlockConfig {
            block_words,
            subblock_words,
        };
        self
    }

    /// Sets the ring geometry.
    #[must_use]
    pub fn with_ring(mut self, subbufs: u32, blocks_per_subbuf: u32) -> Self {
        self.config.ring = RingConfig {
            subbufs,
            blocks_per_subbuf,
        };
        self
    }

    /// Sets the handle count and block width.
    #[must_use]
    pub fn with_handles(mut self, handles: u32, block_width: u32) -> Self {
        self.config.handles.handles = handles;
        self.config.handles.block_width = block_width;
        self
    }

    /// Sets the number of reclaim records.
    #[must_use]
    pub fn with_reclaim_records(mut self, records: u32) -> Self {
        self.config.handles.reclaim_records = records;
        self
    }

    /// Sets the grid pool capacity.
    #[must_use]
    pub fn with_grids(mut self, grids: u32) -> Self {
        self.config.scheduler.grids = grids;
        self
    }

    /// Sets the temporary allocator geometry.
    #[must_use]
    pub fn with_temp(mut self, blocks: u32, block_words: u32) -> Self {
        self.config.temp = TempConfig {
            blocks,
            block_words,
        };
        self
    }

    /// Sets the device block pool size.
    #[must_use]
    pub fn with_pool_blocks(mut self, pool_blocks: u32) -> Self {
        self.config.device.pool_blocks = pool_blocks;
        self
    }

    /// Sets the raster cohort size.
    #[must_use]
    pub fn with_cohort_rasters(mut self, rasters: u32) -> Self {
        self.config.raster.cohort_rasters = rasters;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        RuntimeConfig::default().validate().unwrap();
        RuntimeConfig::minimal().validate().unwrap();
        RuntimeConfig::high_throughput().validate().unwrap();
    }

    #[test]
    fn test_minimal_geometry() {
        let config = RuntimeConfig::minimal();
        assert_eq!(config.block.subblocks_per_block(), 4);
        assert_eq!(config.ring.ring_blocks(), 8);
        assert_eq!(config.temp.extent_words(), 256);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfigBuilder::minimal()
            .with_ring(4, 8)
            .with_handles(128, 16)
            .with_grids(32)
            .build()
            .unwrap();

        assert_eq!(config.ring.ring_blocks(), 32);
        assert_eq!(config.handles.handles, 128);
        assert_eq!(config.scheduler.grids, 32);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let err = RuntimeConfigBuilder::new()
            .with_block_words(24, 8)
            .build()
            .unwrap_err();
        assert!(matches!(err, PathRingError::InvalidConfig(_)));

        assert!(RuntimeConfigBuilder::minimal().with_ring(1, 8).build().is_err());
        assert!(RuntimeConfigBuilder::minimal().with_handles(60, 8).build().is_err());
        assert!(RuntimeConfigBuilder::minimal().with_block_words(8, 4).build().is_err());
        assert!(RuntimeConfigBuilder::minimal().with_temp(12, 16).build().is_err());
    }
}
