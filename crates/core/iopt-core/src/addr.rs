//! Typed device-virtual and physical address wrappers.
//!
//! Provides [`IoVirtAddr`] and [`PhysAddr`] newtypes that prevent mixing
//! device-visible addresses with physical ones at the type level.

use core::fmt;
use core::ops::{Add, Sub};

/// A 32-bit device-visible (I/O virtual) address.
///
/// The three-level long-descriptor table used by the IOMMU resolves bits
/// 31..12; the IOVA space is therefore exactly 4 GiB and the type is backed
/// by a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct IoVirtAddr(u32);

/// A physical address restricted to the 40-bit output address space of the
/// long-descriptor format.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

/// Physical address space mask: bits 0..39.
const PHYS_ADDR_MASK: u64 = 0x00FF_FFFF_FFFF;

/// Mask for a 9-bit L2/L3 table index.
const TABLE_INDEX_MASK: usize = 0x1FF;

/// Mask for the 2-bit L1 table index.
const ROOT_INDEX_MASK: usize = 0x3;

impl IoVirtAddr {
    /// Creates a new `IoVirtAddr`.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Creates an `IoVirtAddr` from a 64-bit value, returning `None` if it
    /// does not fit in the 4 GiB IOVA space.
    #[inline]
    pub const fn try_from_u64(addr: u64) -> Option<Self> {
        if addr > u32::MAX as u64 {
            None
        } else {
            Some(Self(addr as u32))
        }
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u32` value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the address widened to `u64`.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.as_u64() & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.as_u64() & !(align - 1)) as u32)
    }

    /// Adds `rhs` bytes, returning `None` if the result leaves the IOVA space.
    #[inline]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.as_u64().checked_add(rhs) {
            Some(sum) => Self::try_from_u64(sum),
            None => None,
        }
    }

    /// Returns the L1 table index (bits 30..31).
    #[inline]
    pub const fn l1_index(self) -> usize {
        (self.0 >> 30) as usize & ROOT_INDEX_MASK
    }

    /// Returns the L2 table index (bits 21..29).
    #[inline]
    pub const fn l2_index(self) -> usize {
        (self.0 >> 21) as usize & TABLE_INDEX_MASK
    }

    /// Returns the L3 table index (bits 12..20).
    #[inline]
    pub const fn l3_index(self) -> usize {
        (self.0 >> 12) as usize & TABLE_INDEX_MASK
    }
}

/// Wrapping addition. Walks that run off the top of the IOVA space stop on
/// their own length accounting, so the wrap is never observed.
impl Add<u64> for IoVirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.as_u64().wrapping_add(rhs) as u32)
    }
}

impl Sub<IoVirtAddr> for IoVirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: IoVirtAddr) -> u64 {
        self.as_u64() - rhs.as_u64()
    }
}

impl fmt::Debug for IoVirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoVirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for IoVirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for IoVirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Creates a new `PhysAddr`, masking to the 40-bit output address space.
    /// Panics in debug mode if bits above 40 are set.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        let masked = addr & PHYS_ADDR_MASK;
        debug_assert!(
            masked == addr,
            "PhysAddr::new: address exceeds 40-bit output address space"
        );
        Self(masked)
    }

    /// Creates a new `PhysAddr`, truncating to the 40-bit output address
    /// space.
    #[inline]
    pub const fn new_truncate(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Adds `rhs` bytes, returning `None` if the result leaves the 40-bit
    /// output address space.
    #[inline]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(sum) if sum <= PHYS_ADDR_MASK => Some(Self(sum)),
            _ => None,
        }
    }

    /// Aligns the address up to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_up(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self::new(self.0 + rhs)
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0 - rhs.0
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
