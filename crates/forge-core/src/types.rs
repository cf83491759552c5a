//! # FORGE Core Types
//!
//! Fundamental type definitions used across the compute stack.
//!
//! These types provide:
//! - Strong typing for device object handles
//! - Byte sizes with alignment helpers
//! - Stable adapter identity (LUID)

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Check for zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Align up to a power-of-two boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        Self(align_up(self.0, alignment))
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// [`align_up`], or `None` when the result does not fit in a `u64`
#[inline]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Integer division rounding up
#[inline]
pub const fn div_up(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

// =============================================================================
// ADAPTER IDENTITY
// =============================================================================

/// Locally unique identifier of an adapter
///
/// Stable for the lifetime of the platform; used to find the same adapter
/// through different enumeration paths.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Luid {
    /// Low part
    pub low: u32,
    /// High part
    pub high: i32,
}

impl Luid {
    /// Create a LUID from its parts
    #[inline]
    pub const fn new(low: u32, high: i32) -> Self {
        Self { low, high }
    }

    /// Pack into a single 64-bit value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        ((self.high as u32 as u64) << 32) | self.low as u64
    }
}

impl fmt::Debug for Luid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Luid({:08x}:{:08x})", self.high as u32, self.low)
    }
}

static_assertions::assert_eq_size!(Luid, u64);

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a device object
///
/// Handles are type-safe indices into the device's object arenas. They do not
/// own the object: the arena does.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>(0x{:x})", short, self.id)
    }
}

static_assertions::assert_eq_size!(Handle<ResourceMarker>, u64);

// Marker types for handles
/// Marker for committed resources
#[derive(Debug)]
pub enum ResourceMarker {}
/// Marker for descriptor heaps
#[derive(Debug)]
pub enum DescriptorHeapMarker {}

/// Handle to a committed buffer resource
pub type ResourceId = Handle<ResourceMarker>;
/// Handle to a descriptor heap
pub type DescriptorHeapId = Handle<DescriptorHeapMarker>;
