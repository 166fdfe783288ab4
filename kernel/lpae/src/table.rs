//! Translation tables and their allocator.
//!
//! Each [`Table`] owns one physical frame holding its descriptors and the
//! next-level tables its `Table` descriptors point at. A child exists in
//! `children` exactly when the matching slot holds a table descriptor, so
//! every intermediate table has one owner and is released by that owner
//! alone.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Range;
use core::ptr::NonNull;

use iopt_core::addr::PhysAddr;
use iopt_core::cache::CacheMaintenance;
use iopt_core::mm::FrameSource;
use iopt_core::paging::PhysFrame;

use crate::PgTableError;
use crate::desc::{self, Level};

/// Number of live intermediate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    /// L2 tables linked from the root.
    pub l2_tables: usize,
    /// L3 tables linked from L2 tables.
    pub l3_tables: usize,
}

/// One table frame and the subtree it owns.
pub(crate) struct Table {
    level: Level,
    frame: PhysFrame,
    slots: NonNull<u64>,
    children: Vec<Option<Box<Table>>>,
}

// SAFETY: the frame behind `slots` is exclusively owned by this table and is
// only reached through `&self`/`&mut self`.
unsafe impl Send for Table {}

impl Table {
    pub(crate) fn level(&self) -> Level {
        self.level
    }

    pub(crate) fn phys(&self) -> PhysAddr {
        self.frame.start_address()
    }

    /// Reads slot `idx`.
    #[inline]
    pub(crate) fn read(&self, idx: usize) -> u64 {
        assert!(idx < self.level.entries());
        // SAFETY: `slots` covers `entries()` descriptors of a live frame.
        unsafe { self.slots.as_ptr().add(idx).read_volatile() }
    }

    /// Stores `raw` into slot `idx` without publishing it.
    #[inline]
    pub(crate) fn store(&mut self, idx: usize, raw: u64) {
        assert!(idx < self.level.entries());
        // SAFETY: as in `read`; `&mut self` gives exclusive access.
        unsafe { self.slots.as_ptr().add(idx).write_volatile(raw) }
    }

    /// Returns the descriptors in `range` as a slice for cache maintenance.
    pub(crate) fn descriptors(&self, range: Range<usize>) -> &[u64] {
        assert!(range.start <= range.end && range.end <= self.level.entries());
        // SAFETY: bounds checked above; the frame outlives `&self`.
        unsafe { core::slice::from_raw_parts(self.slots.as_ptr().add(range.start), range.len()) }
    }

    /// Returns `true` if every slot is zero.
    pub(crate) fn is_empty(&self) -> bool {
        (0..self.level.entries()).all(|idx| self.read(idx) == 0)
    }

    pub(crate) fn child(&self, idx: usize) -> Option<&Table> {
        self.children.get(idx).and_then(|c| c.as_deref())
    }

    pub(crate) fn child_mut(&mut self, idx: usize) -> Option<&mut Table> {
        self.children.get_mut(idx).and_then(|c| c.as_deref_mut())
    }

    /// Appends every descriptor of this subtree, depth first.
    #[cfg(test)]
    pub(crate) fn snapshot(&self, out: &mut Vec<u64>) {
        for idx in 0..self.level.entries() {
            out.push(self.read(idx));
            if let Some(child) = self.child(idx) {
                child.snapshot(out);
            }
        }
    }
}

/// Frame source, maintainer and bookkeeping shared by every table of one
/// instance.
pub(crate) struct TableAllocator<F, C> {
    pub(crate) frames: F,
    pub(crate) maint: C,
    pub(crate) redirect: bool,
    pub(crate) stats: TableStats,
}

impl<F: FrameSource, C: CacheMaintenance> TableAllocator<F, C> {
    pub(crate) fn new(frames: F, maint: C, redirect: bool) -> Self {
        Self {
            frames,
            maint,
            redirect,
            stats: TableStats::default(),
        }
    }

    /// Makes `range` of `table` visible to the walker unless redirected.
    pub(crate) fn publish(&self, table: &Table, range: Range<usize>) {
        if !self.redirect && !range.is_empty() {
            self.maint.publish(table.descriptors(range));
        }
    }

    /// Stores `raw` into one slot and publishes it.
    pub(crate) fn write(&self, table: &mut Table, idx: usize, raw: u64) {
        table.store(idx, raw);
        self.publish(table, idx..idx + 1);
    }

    fn alloc_table(&mut self, level: Level) -> Result<Table, PgTableError> {
        let Some(frame) = self.frames.allocate_frame() else {
            log::error!("iommu: could not allocate {level} table");
            return Err(PgTableError::OutOfMemory);
        };
        let table = Table {
            level,
            frame,
            slots: self.frames.frame_ptr(frame).cast::<u64>(),
            children: if level == Level::L3 {
                Vec::new()
            } else {
                (0..level.entries()).map(|_| None).collect()
            },
        };
        // Frames arrive zero-filled; the walker must see them that way too.
        self.publish(&table, 0..level.entries());
        Ok(table)
    }

    /// Allocates the root table.
    pub(crate) fn alloc_root(&mut self) -> Result<Table, PgTableError> {
        let root = self.alloc_table(Level::L1)?;
        log::debug!("iommu: root table at {}", root.phys());
        Ok(root)
    }

    /// Allocates the table below `parent[idx]` and links it.
    ///
    /// The slot is left untouched if allocation fails.
    pub(crate) fn alloc_level(&mut self, parent: &mut Table, idx: usize) -> Result<(), PgTableError> {
        debug_assert_eq!(parent.read(idx), 0);
        let level = parent.level.next().ok_or(PgTableError::InvalidArgument)?;
        let child = self.alloc_table(level)?;
        self.write(parent, idx, desc::table(child.phys()));
        parent.children[idx] = Some(Box::new(child));
        match level {
            Level::L2 => self.stats.l2_tables += 1,
            _ => self.stats.l3_tables += 1,
        }
        Ok(())
    }

    /// Unlinks `parent[idx]`, clears the slot and frees the subtree.
    pub(crate) fn free_child(&mut self, parent: &mut Table, idx: usize) {
        if let Some(child) = parent.children.get_mut(idx).and_then(Option::take) {
            self.write(parent, idx, 0);
            self.release(*child);
        }
    }

    /// Returns every frame of `table`'s subtree to the frame source.
    fn release(&mut self, mut table: Table) {
        for child in table.children.drain(..).flatten() {
            self.release(*child);
        }
        match table.level {
            Level::L1 => {}
            Level::L2 => self.stats.l2_tables -= 1,
            Level::L3 => self.stats.l3_tables -= 1,
        }
        // SAFETY: the frame came from `self.frames` and nothing links to it
        // any more.
        unsafe { self.frames.deallocate_frame(table.frame) };
    }

    /// Frees every intermediate table below the root, then the root.
    pub(crate) fn free_root(&mut self, root: Table) {
        log::debug!(
            "iommu: freeing root {} ({} L2, {} L3 tables)",
            root.phys(),
            self.stats.l2_tables,
            self.stats.l3_tables
        );
        self.release(root);
    }

    /// Publishes every descriptor of the subtree, ignoring redirect.
    pub(crate) fn publish_tree(&self, table: &Table) {
        self.maint.publish(table.descriptors(0..table.level.entries()));
        for child in table.children.iter().flatten() {
            self.publish_tree(child);
        }
    }
}
