//! Three-level long-descriptor I/O page-table engine.
//!
//! Maintains the translation tree an IOMMU walks to turn 32-bit device
//! addresses into 40-bit physical addresses:
//!
//! - [`attr`]: protection request to leaf attribute bits.
//! - [`desc`]: descriptor encoding per level.
//! - [`IoPageTable::map`] / [`IoPageTable::map_range`]: place mappings of
//!   4 KiB, 64 KiB, 2 MiB, 32 MiB or 1 GiB, allocating L2/L3 tables on
//!   demand.
//! - [`IoPageTable::unmap_range`]: clear a range of mixed granularity and
//!   reclaim tables that become empty.
//!
//! The engine is not synchronized. The owner serializes access, issues TLB
//! invalidation, and owns the memory being mapped.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod attr;
pub mod desc;
mod map;
mod table;
mod unmap;

#[cfg(test)]
pub(crate) mod testing;

use core::fmt;

use iopt_core::addr::{IoVirtAddr, PhysAddr};
use iopt_core::cache::CacheMaintenance;
use iopt_core::mm::FrameSource;

pub use attr::{CachePolicy, IommuProt, ProtFixup};
pub use desc::{Descriptor, Level};
pub use map::SgEntry;
pub use table::TableStats;
pub use unmap::{Inconsistency, UnmapReport};

use table::{Table, TableAllocator};

/// Errors returned by table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTableError {
    /// Bad length, misaligned address, or no root table.
    InvalidArgument,
    /// A table frame could not be allocated.
    OutOfMemory,
    /// The target range already holds a mapping or a table of another
    /// granularity.
    Conflict,
    /// The tree does not match its own bookkeeping.
    Inconsistent,
}

impl fmt::Display for PgTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgTableError::InvalidArgument => write!(f, "invalid argument"),
            PgTableError::OutOfMemory => write!(f, "out of memory for page tables"),
            PgTableError::Conflict => write!(f, "range already mapped"),
            PgTableError::Inconsistent => write!(f, "page table inconsistent"),
        }
    }
}

/// Construction-time options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableConfig {
    /// Build without cache maintenance; see [`IoPageTable::publish_all`].
    pub redirect: bool,
    /// Memory type of cacheable mappings.
    pub cache_policy: CachePolicy,
}

impl PageTableConfig {
    /// Live table, write-allocate policy.
    pub const fn new() -> Self {
        Self {
            redirect: false,
            cache_policy: CachePolicy::WriteAlloc,
        }
    }

    /// Sets redirect mode.
    #[must_use]
    pub const fn with_redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    /// Sets the cacheable memory policy.
    #[must_use]
    pub const fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }
}

/// An I/O page table instance.
///
/// Owns the root table and, through it, every intermediate table. Dropping
/// the instance frees the whole tree.
pub struct IoPageTable<F: FrameSource, C: CacheMaintenance> {
    root: Option<Table>,
    alloc: TableAllocator<F, C>,
    cache_policy: CachePolicy,
}

impl<F: FrameSource, C: CacheMaintenance> IoPageTable<F, C> {
    /// Creates a table and allocates its root.
    pub fn new(frames: F, maint: C, config: PageTableConfig) -> Result<Self, PgTableError> {
        let mut alloc = TableAllocator::new(frames, maint, config.redirect);
        let root = alloc.alloc_root()?;
        Ok(Self {
            root: Some(root),
            alloc,
            cache_policy: config.cache_policy,
        })
    }

    /// Frees every table including the root.
    ///
    /// Every later operation fails with [`PgTableError::InvalidArgument`].
    pub fn free_root(&mut self) {
        if let Some(root) = self.root.take() {
            self.alloc.free_root(root);
        }
    }

    /// Physical address of the root table, for the translation base register.
    pub fn root_phys(&self) -> Option<PhysAddr> {
        self.root.as_ref().map(Table::phys)
    }

    /// Returns `true` while writes skip cache maintenance.
    pub fn redirect(&self) -> bool {
        self.alloc.redirect
    }

    /// Switches redirect mode.
    pub fn set_redirect(&mut self, redirect: bool) {
        self.alloc.redirect = redirect;
    }

    /// Publishes every descriptor of the tree, regardless of redirect mode.
    pub fn publish_all(&self) {
        if let Some(root) = &self.root {
            self.alloc.publish_tree(root);
        }
    }

    /// Counts of live intermediate tables.
    pub fn stats(&self) -> TableStats {
        self.alloc.stats
    }

    /// The frame source tables are allocated from.
    pub fn frame_source(&self) -> &F {
        &self.alloc.frames
    }

    /// The cache maintainer descriptor writes are published through.
    pub fn maintainer(&self) -> &C {
        &self.alloc.maint
    }

    /// Returns the descriptor governing `va` at `level`.
    ///
    /// `None` if the tree has no table at that level for `va`.
    pub fn entry(&self, level: Level, va: IoVirtAddr) -> Option<Descriptor> {
        let mut table = self.root.as_ref()?;
        while table.level() != level {
            table = table.child(table.level().index(va))?;
        }
        Some(Descriptor::decode(level, table.read(level.index(va))))
    }

    fn root_and_alloc(&mut self) -> Result<(&mut Table, &mut TableAllocator<F, C>), PgTableError> {
        match self.root.as_mut() {
            Some(root) => Ok((root, &mut self.alloc)),
            None => {
                log::error!("iommu: null page table");
                Err(PgTableError::InvalidArgument)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> alloc::vec::Vec<u64> {
        let mut out = alloc::vec::Vec::new();
        if let Some(root) = &self.root {
            root.snapshot(&mut out);
        }
        out
    }
}

impl<F: FrameSource, C: CacheMaintenance> Drop for IoPageTable<F, C> {
    fn drop(&mut self) {
        self.free_root();
    }
}
