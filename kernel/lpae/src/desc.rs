//! Long-descriptor encoding.
//!
//! Descriptor layout used by the three-level IOMMU table:
//! ```text
//! +-----+----+-----+----+-------------------------+----+----+----+----+----+------+------+
//! | R   | XN | PXN | CH | Output address [39:12]  | nG | AF | SH | AP | NS | INDX | TYPE |
//! +-----+----+-----+----+-------------------------+----+----+----+----+----+------+------+
//!  63 55  54    53   52  39                    12  11   10  9 8  7 6   5   4  2   1  0
//! ```
//!
//! `TYPE` is `0b11` for a table descriptor at L1/L2 and for a page at L3, and
//! `0b01` for a block at L1/L2. An all-zero descriptor is empty.

use core::fmt;

use iopt_core::addr::{IoVirtAddr, PhysAddr};
use iopt_core::paging::{PAGE_SIZE, SIZE_1G, SIZE_2M};

/// Output address mask of a table descriptor and of an L3 page: bits 12..39.
pub const TABLE_ADDR_MASK: u64 = 0xFF_FFFF_F000;
/// Output address mask of an L3 page descriptor.
pub const PAGE_ADDR_MASK: u64 = TABLE_ADDR_MASK;
/// Output address mask of an L2 (2 MiB) block: bits 21..39.
pub const L2_BLOCK_ADDR_MASK: u64 = 0xFF_FFE0_0000;
/// Output address mask of an L1 (1 GiB) block: bits 30..39.
pub const L1_BLOCK_ADDR_MASK: u64 = 0xFF_C000_0000;

const TYPE_MASK: u64 = 0b11;
const TYPE_BLOCK: u64 = 0b01;
const TYPE_TABLE: u64 = 0b11;
const TYPE_PAGE: u64 = 0b11;

/// Memory attribute index field (bits 2..4).
pub const ATTR_INDEX_SHIFT: u32 = 2;
const ATTR_INDEX_MASK: u64 = 0b111 << ATTR_INDEX_SHIFT;

/// Number of adjacent entries a contiguous-hint group spans.
pub const CONTIGUOUS_ENTRIES: usize = 16;

bitflags::bitflags! {
    /// Lower leaf attributes (bits 5..11), excluding the attribute index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LowerAttrs: u64 {
        /// Non-secure output address.
        const NS        = 1 << 5;
        /// AP = 0b01: read/write.
        const AP_RW     = 0b01 << 6;
        /// AP = 0b11: read-only. Contains [`AP_RW`](Self::AP_RW).
        const AP_RO     = 0b11 << 6;
        /// SH = 0b10: outer shareable.
        const SH_OUTER  = 0b10 << 8;
        /// SH = 0b11: inner shareable. Contains [`SH_OUTER`](Self::SH_OUTER).
        const SH_INNER  = 0b11 << 8;
        /// Access flag.
        const AF        = 1 << 10;
        /// Non-global.
        const NG        = 1 << 11;
    }
}

bitflags::bitflags! {
    /// Upper leaf attributes (bits 52..54).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpperAttrs: u64 {
        /// Sixteen adjacent entries form one translation.
        const CONTIGUOUS = 1 << 52;
        /// Privileged execute-never.
        const PXN        = 1 << 53;
        /// Execute-never.
        const XN         = 1 << 54;
    }
}

/// The attribute bits carried by a block or page descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafAttrs {
    /// Memory attribute index (0..=7).
    pub attr_index: u8,
    /// Access, shareability and scope bits.
    pub lower: LowerAttrs,
    /// Contiguous hint and execute-never bits.
    pub upper: UpperAttrs,
}

impl LeafAttrs {
    /// Packs the attributes into their descriptor bit positions.
    pub const fn bits(self) -> u64 {
        (((self.attr_index as u64) << ATTR_INDEX_SHIFT) & ATTR_INDEX_MASK)
            | self.lower.bits()
            | self.upper.bits()
    }

    /// Extracts the attributes from a raw leaf descriptor.
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            attr_index: ((raw & ATTR_INDEX_MASK) >> ATTR_INDEX_SHIFT) as u8,
            lower: LowerAttrs::from_bits_truncate(raw),
            upper: UpperAttrs::from_bits_truncate(raw),
        }
    }

    /// Returns `true` if the access permission is read/write.
    pub fn is_writable(self) -> bool {
        self.lower.contains(LowerAttrs::AP_RW) && !self.lower.contains(LowerAttrs::AP_RO)
    }

    /// Returns `true` if the contiguous hint is set.
    pub fn is_contiguous(self) -> bool {
        self.upper.contains(UpperAttrs::CONTIGUOUS)
    }

    /// Returns a copy with the contiguous hint set.
    #[must_use]
    pub fn with_contiguous(mut self) -> Self {
        self.upper |= UpperAttrs::CONTIGUOUS;
        self
    }
}

// ---------------------------------------------------------------------------
// Level
// ---------------------------------------------------------------------------

/// A level of the translation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Root: 4 entries of 1 GiB.
    L1,
    /// 512 entries of 2 MiB.
    L2,
    /// 512 entries of 4 KiB.
    L3,
}

impl Level {
    /// Number of descriptors in a table at this level.
    pub const fn entries(self) -> usize {
        match self {
            Self::L1 => 4,
            Self::L2 | Self::L3 => 512,
        }
    }

    /// Bytes of IOVA space covered by one entry.
    pub const fn span(self) -> u64 {
        match self {
            Self::L1 => SIZE_1G,
            Self::L2 => SIZE_2M,
            Self::L3 => PAGE_SIZE,
        }
    }

    /// Index of the entry covering `va`.
    pub const fn index(self, va: IoVirtAddr) -> usize {
        match self {
            Self::L1 => va.l1_index(),
            Self::L2 => va.l2_index(),
            Self::L3 => va.l3_index(),
        }
    }

    /// The level below this one, if any.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }

    const fn leaf_addr_mask(self) -> u64 {
        match self {
            Self::L1 => L1_BLOCK_ADDR_MASK,
            Self::L2 => L2_BLOCK_ADDR_MASK,
            Self::L3 => PAGE_ADDR_MASK,
        }
    }

    const fn leaf_type(self) -> u64 {
        match self {
            Self::L1 | Self::L2 => TYPE_BLOCK,
            Self::L3 => TYPE_PAGE,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A decoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// All zero.
    Empty,
    /// Points at the next-level table. L1/L2 only.
    Table(PhysAddr),
    /// Leaf covering a whole L1 or L2 entry.
    Block {
        /// Output address.
        addr: PhysAddr,
        /// Leaf attributes.
        attrs: LeafAttrs,
    },
    /// Leaf covering one 4 KiB page. L3 only.
    Page {
        /// Output address.
        addr: PhysAddr,
        /// Leaf attributes.
        attrs: LeafAttrs,
    },
    /// Non-zero but not a valid encoding for the level.
    Invalid(u64),
}

impl Descriptor {
    /// Decodes a raw descriptor read from a table at `level`.
    pub const fn decode(level: Level, raw: u64) -> Self {
        if raw == 0 {
            return Self::Empty;
        }
        match (level, raw & TYPE_MASK) {
            (Level::L1 | Level::L2, TYPE_TABLE) => Self::Table(PhysAddr::new(raw & TABLE_ADDR_MASK)),
            (Level::L1 | Level::L2, TYPE_BLOCK) => Self::Block {
                addr: PhysAddr::new(raw & level.leaf_addr_mask()),
                attrs: LeafAttrs::from_raw(raw),
            },
            (Level::L3, TYPE_PAGE) => Self::Page {
                addr: PhysAddr::new(raw & PAGE_ADDR_MASK),
                attrs: LeafAttrs::from_raw(raw),
            },
            _ => Self::Invalid(raw),
        }
    }

    /// Returns `true` for `Block` and `Page`.
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Block { .. } | Self::Page { .. })
    }
}

/// Encodes a table descriptor. APTable is left zero so the leaf decides.
pub const fn table(next: PhysAddr) -> u64 {
    (next.as_u64() & TABLE_ADDR_MASK) | TYPE_TABLE
}

/// Encodes a leaf (block at L1/L2, page at L3).
pub const fn leaf(level: Level, addr: PhysAddr, attrs: LeafAttrs) -> u64 {
    (addr.as_u64() & level.leaf_addr_mask()) | attrs.bits() | level.leaf_type()
}

/// Returns `true` if `raw` is a leaf at `level`.
pub(crate) const fn is_leaf_raw(level: Level, raw: u64) -> bool {
    Descriptor::decode(level, raw).is_leaf()
}
