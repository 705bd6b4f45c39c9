//! Resource handles, type guards and packed reference counts.

use std::fmt;

/// Untyped handle: an index into the handle pool's side tables.
pub type Handle = u32;

/// Guard bit carried by typed path handles.
pub const PATH_GUARD: u32 = 1 << 30;
/// Guard bit carried by typed raster handles.
pub const RASTER_GUARD: u32 = 1 << 31;
/// Both guard bits.
pub const GUARD_MASK: u32 = PATH_GUARD | RASTER_GUARD;
/// Exclusive upper bound on the number of handles.
pub const MAX_HANDLES: u32 = PATH_GUARD;

/// Resource type a handle denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    /// A path.
    Path,
    /// A raster.
    Raster,
}

impl HandleType {
    /// The guard bit for this type.
    pub const fn guard(self) -> u32 {
        match self {
            Self::Path => PATH_GUARD,
            Self::Raster => RASTER_GUARD,
        }
    }

    /// Strips the guard if it matches this type exactly.
    pub fn untype(self, raw: u32) -> Option<Handle> {
        if raw & GUARD_MASK == self.guard() {
            Some(raw & !GUARD_MASK)
        } else {
            None
        }
    }

    /// Dense index for per-type tables.
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Path => 0,
            Self::Raster => 1,
        }
    }

    /// Both types, in table order.
    pub const ALL: [HandleType; 2] = [HandleType::Path, HandleType::Raster];
}

/// A handle carrying its type guard.
pub trait TypedHandle: Copy + fmt::Debug {
    /// The type this handle denotes.
    const TYPE: HandleType;

    /// Wraps a raw typed value without checking it.
    fn from_raw(raw: u32) -> Self;

    /// The raw typed value.
    fn raw(self) -> u32;

    /// Adds the type guard to an untyped handle.
    fn from_handle(handle: Handle) -> Self {
        Self::from_raw(handle | Self::TYPE.guard())
    }

    /// The untyped handle, if the guard is intact.
    fn handle(self) -> Option<Handle> {
        Self::TYPE.untype(self.raw())
    }
}

macro_rules! typed_handle {
    ($name:ident, $ty:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl TypedHandle for $name {
            const TYPE: HandleType = $ty;

            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.handle() {
                    Some(h) => write!(f, "{}({})", stringify!($name), h),
                    None => write!(f, "{}(bad {:#010x})", stringify!($name), self.0),
                }
            }
        }
    };
}

typed_handle!(Path, HandleType::Path, "Typed path handle.");
typed_handle!(Raster, HandleType::Raster, "Typed raster handle.");

/// Width of the host reference count.
pub const HOST_BITS: u32 = 16;
/// Width of the device reference count.
pub const DEVICE_BITS: u32 = 16;
/// Saturation value of the host count.
pub const HOST_MAX: u32 = (1 << HOST_BITS) - 1;
/// Saturation value of the device count.
pub const DEVICE_MAX: u32 = (1 << DEVICE_BITS) - 1;

const _: () = assert!(HOST_BITS + DEVICE_BITS <= 32);

/// Host and device reference counts packed into one word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RefCount(u32);

impl RefCount {
    /// Both counts zero.
    pub const ZERO: Self = Self(0);

    /// Packs both counts.
    #[inline]
    pub fn new(host: u32, device: u32) -> Self {
        debug_assert!(host <= HOST_MAX && device <= DEVICE_MAX);
        Self((host & HOST_MAX) | ((device & DEVICE_MAX) << HOST_BITS))
    }

    /// Host count.
    #[inline]
    pub const fn host(self) -> u32 {
        self.0 & HOST_MAX
    }

    /// Device count.
    #[inline]
    pub const fn device(self) -> u32 {
        (self.0 >> HOST_BITS) & DEVICE_MAX
    }

    /// Reclaimable when both counts are zero.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Replaces the host count.
    #[inline]
    pub fn with_host(self, host: u32) -> Self {
        Self::new(host, self.device())
    }

    /// Replaces the device count.
    #[inline]
    pub fn with_device(self, device: u32) -> Self {
        Self::new(self.host(), device)
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{host: {}, device: {}}}", self.host(), self.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let p = Path::from_handle(17);
        assert_eq!(p.raw(), 17 | PATH_GUARD);
        assert_eq!(p.handle(), Some(17));

        let r = Raster::from_handle(17);
        assert_eq!(r.handle(), Some(17));
        assert_ne!(p.raw(), r.raw());
    }

    #[test]
    fn test_guard_mismatch() {
        let p = Path::from_handle(3);
        assert_eq!(HandleType::Raster.untype(p.raw()), None);
        assert_eq!(HandleType::Path.untype(3), None);
        assert_eq!(HandleType::Path.untype(3 | GUARD_MASK), None);
        assert_eq!(format!("{:?}", Path::from_raw(3)), "Path(bad 0x00000003)");
    }

    #[test]
    fn test_refcount_packing() {
        let rc = RefCount::new(1, 1);
        assert_eq!(rc.host(), 1);
        assert_eq!(rc.device(), 1);
        assert!(!rc.is_zero());

        let rc = rc.with_host(0);
        assert_eq!(rc.host(), 0);
        assert_eq!(rc.device(), 1);

        let rc = rc.with_device(0);
        assert!(rc.is_zero());

        let full = RefCount::new(HOST_MAX, DEVICE_MAX);
        assert_eq!(full.host(), HOST_MAX);
        assert_eq!(full.device(), DEVICE_MAX);
    }
}
