//! Error types for the path ring runtime.

use thiserror::Error;

/// Result type for path ring operations.
pub type Result<T> = std::result::Result<T, PathRingError>;

/// Errors raised by the handle pool, scheduler, encoder and device layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathRingError {
    /// Wrong type guard, out-of-range index, or a zero reference count on
    /// the validated side.
    #[error("Invalid handle: {handle:#010x}")]
    HandleInvalid {
        /// The raw (typed) handle value that failed validation.
        handle: u32,
    },

    /// A reference count is saturated.
    #[error("Handle reference count overflow: {handle:#010x}")]
    HandleOverflow {
        /// The raw (typed) handle value whose count is saturated.
        handle: u32,
    },

    /// A grid operation that its current state does not allow.
    #[error("Invalid grid operation: {0}")]
    InvalidGrid(String),

    /// Stubbed API surface.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A single path needs more blocks than the ring holds.
    #[error("Path ring overrun: a path cannot exceed {ring_blocks} blocks")]
    RingOverrun {
        /// Total number of blocks in the ring.
        ring_blocks: u32,
    },

    /// An allocation request larger than the allocator's extent.
    #[error("Request of {requested} words exceeds capacity of {capacity} words")]
    RequestTooLarge {
        /// Requested size in words.
        requested: usize,
        /// Total extent in words.
        capacity: usize,
    },

    /// Release of a span that is not live.
    #[error("Unknown suballocator span: {0}")]
    UnknownSubbuffer(u32),

    /// Rejected configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device layer error.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// The device stopped delivering completions.
    #[error("Device lost")]
    DeviceLost,

    /// A kernel reported failure through its completion.
    #[error("Kernel {kernel} failed: {reason}")]
    KernelFailed {
        /// Kernel name.
        kernel: String,
        /// Failure reason reported by the device.
        reason: String,
    },

    /// The dispatcher cannot make progress: nothing is in flight and no
    /// queued event can be delivered.
    #[error("Dispatcher stalled: {0}")]
    Stalled(String),

    /// Backend not available.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// The builder has been released.
    #[error("Builder has been released")]
    ReleasedBuilder,
}

impl PathRingError {
    /// Create a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError(msg.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a stall error.
    pub fn stalled(msg: impl Into<String>) -> Self {
        Self::Stalled(msg.into())
    }

    /// Create a not-implemented error.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Returns true for synchronous handle validation failures. These never
    /// mutate any state.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::HandleInvalid { .. } | Self::HandleOverflow { .. }
        )
    }

    /// Returns true for conditions that indicate a misconfigured deployment
    /// or a broken device. A builder that observes one is poisoned.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RingOverrun { .. }
                | Self::DeviceError(_)
                | Self::DeviceLost
                | Self::KernelFailed { .. }
                | Self::Stalled(_)
        )
    }
}
