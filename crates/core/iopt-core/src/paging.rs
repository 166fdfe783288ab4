//! Physical frames and the mapping granularities accepted at the table
//! boundary.

use core::fmt;

use crate::addr::{IoVirtAddr, PhysAddr};

/// Size of a translation table frame and of the smallest mapping.
pub const PAGE_SIZE: u64 = 4096;

/// 64 KiB: sixteen contiguous 4 KiB pages.
pub const SIZE_64K: u64 = 0x1_0000;
/// 2 MiB: one level-2 block.
pub const SIZE_2M: u64 = 0x20_0000;
/// 32 MiB: sixteen contiguous level-2 blocks.
pub const SIZE_32M: u64 = 0x200_0000;
/// 1 GiB: one level-1 block.
pub const SIZE_1G: u64 = 0x4000_0000;

// ---------------------------------------------------------------------------
// PhysFrame
// ---------------------------------------------------------------------------

/// A 4 KiB physical memory frame.
///
/// The contained [`PhysAddr`] is guaranteed to be aligned to [`PAGE_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    /// Returns the frame that contains the given physical address (aligns
    /// down).
    #[inline]
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(PAGE_SIZE),
        }
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start.as_u64())
    }
}

// ---------------------------------------------------------------------------
// Granule
// ---------------------------------------------------------------------------

/// A mapping granularity the table engine accepts.
///
/// Any other length is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granule {
    /// A single level-3 page.
    Size4KiB,
    /// Sixteen level-3 pages carrying the contiguous hint.
    Size64KiB,
    /// A single level-2 block.
    Size2MiB,
    /// Sixteen level-2 blocks carrying the contiguous hint.
    Size32MiB,
    /// A single level-1 block.
    Size1GiB,
}

impl Granule {
    /// All granules, coarsest first. Greedy selection walks this order.
    pub const DESCENDING: [Granule; 5] = [
        Granule::Size1GiB,
        Granule::Size32MiB,
        Granule::Size2MiB,
        Granule::Size64KiB,
        Granule::Size4KiB,
    ];

    /// Returns the granule whose size is exactly `len`, if any.
    #[inline]
    pub const fn from_len(len: u64) -> Option<Self> {
        match len {
            PAGE_SIZE => Some(Self::Size4KiB),
            SIZE_64K => Some(Self::Size64KiB),
            SIZE_2M => Some(Self::Size2MiB),
            SIZE_32M => Some(Self::Size32MiB),
            SIZE_1G => Some(Self::Size1GiB),
            _ => None,
        }
    }

    /// The number of bytes this granule maps.
    #[inline]
    pub const fn size(self) -> u64 {
        match self {
            Self::Size4KiB => PAGE_SIZE,
            Self::Size64KiB => SIZE_64K,
            Self::Size2MiB => SIZE_2M,
            Self::Size32MiB => SIZE_32M,
            Self::Size1GiB => SIZE_1G,
        }
    }

    /// Returns `true` if both addresses are aligned to this granule and at
    /// least `available` bytes are left to map.
    #[inline]
    pub const fn fits(self, va: IoVirtAddr, pa: PhysAddr, available: u64) -> bool {
        let size = self.size();
        va.is_aligned(size) && pa.is_aligned(size) && available >= size
    }

    /// Picks the coarsest granule that [`fits`](Self::fits), falling back to
    /// [`Granule::Size4KiB`].
    pub fn largest_fitting(va: IoVirtAddr, pa: PhysAddr, available: u64) -> Self {
        Self::DESCENDING
            .into_iter()
            .find(|g| g.fits(va, pa, available))
            .unwrap_or(Self::Size4KiB)
    }
}

impl fmt::Display for Granule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Size4KiB => "4KiB",
            Self::Size64KiB => "64KiB",
            Self::Size2MiB => "2MiB",
            Self::Size32MiB => "32MiB",
            Self::Size1GiB => "1GiB",
        };
        f.write_str(s)
    }
}
