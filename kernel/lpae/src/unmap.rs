//! Unmapping engine.
//!
//! Walks a range that may mix 1 GiB blocks, 2 MiB block runs and 4 KiB page
//! runs. Each step clears as many adjacent leaves of one table as the
//! remaining length covers, then frees the table if that left it empty.

use iopt_core::addr::IoVirtAddr;
use iopt_core::cache::CacheMaintenance;
use iopt_core::mm::FrameSource;
use iopt_core::paging::{PAGE_SIZE, SIZE_1G, SIZE_2M};

use crate::desc::{self, CONTIGUOUS_ENTRIES, Descriptor, Level, UpperAttrs};
use crate::map::check_range;
use crate::table::{Table, TableAllocator};
use crate::{IoPageTable, PgTableError};

/// The slot an unmap walk could not interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inconsistency {
    /// Address the walk had reached.
    pub va: IoVirtAddr,
    /// Level of the offending slot.
    pub level: Level,
    /// Raw descriptor found there.
    pub raw: u64,
}

/// Outcome of [`IoPageTable::unmap_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnmapReport {
    /// Bytes of mappings removed. A block the range only partly covered
    /// counts in full.
    pub unmapped: u64,
    /// Set if the walk halted before the end of the range.
    pub inconsistency: Option<Inconsistency>,
}

impl UnmapReport {
    /// Returns `true` if the walk reached the end of the range.
    pub fn is_complete(&self) -> bool {
        self.inconsistency.is_none()
    }
}

/// Result of one walk step: the address to continue at and the bytes
/// removed.
type Step = Result<(u64, u64), Inconsistency>;

/// Clears the contiguous hint on the live entries of the groups holding
/// slots `start` and `end - 1`.
fn break_contiguous<F: FrameSource, C: CacheMaintenance>(
    alloc: &TableAllocator<F, C>,
    table: &mut Table,
    start: usize,
    end: usize,
) {
    let level = table.level();
    for group in [start / CONTIGUOUS_ENTRIES, (end - 1) / CONTIGUOUS_ENTRIES] {
        let first = group * CONTIGUOUS_ENTRIES;
        let mut touched: Option<(usize, usize)> = None;
        for idx in first..first + CONTIGUOUS_ENTRIES {
            let raw = table.read(idx);
            if desc::is_leaf_raw(level, raw) && raw & UpperAttrs::CONTIGUOUS.bits() != 0 {
                table.store(idx, raw & !UpperAttrs::CONTIGUOUS.bits());
                touched = Some(touched.map_or((idx, idx), |(lo, _)| (lo, idx)));
            }
        }
        if let Some((lo, hi)) = touched {
            log::debug!("iommu: split contiguous {level} group at slot {first}");
            alloc.publish(table, lo..hi + 1);
        }
    }
}

/// Clears the run of pages starting at `here` in `l2[l2_idx]`. The third
/// value is `true` if the L3 table was freed.
fn unmap_l3<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    l2: &mut Table,
    l2_idx: usize,
    here: IoVirtAddr,
    end: u64,
) -> Result<(u64, u64, bool), Inconsistency> {
    let Some(l3) = l2.child_mut(l2_idx) else {
        return Err(Inconsistency {
            va: here,
            level: Level::L2,
            raw: l2.read(l2_idx),
        });
    };

    let entries = Level::L3.entries();
    let start = here.l3_index();
    let mut idx = start;
    let mut next = here.as_u64();
    while idx < entries && next < end && desc::is_leaf_raw(Level::L3, l3.read(idx)) {
        l3.store(idx, 0);
        idx += 1;
        next += PAGE_SIZE;
    }
    if idx == start {
        return Err(Inconsistency {
            va: here,
            level: Level::L3,
            raw: l3.read(start),
        });
    }
    alloc.publish(l3, start..idx);
    break_contiguous(alloc, l3, start, idx);

    // A run over the whole table needs no scan.
    let emptied = idx - start == entries || l3.is_empty();
    if emptied {
        alloc.free_child(l2, l2_idx);
    }
    Ok((next, (idx - start) as u64 * PAGE_SIZE, emptied))
}

/// Handles a position whose L1 slot links an L2 table.
fn unmap_l2<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    root: &mut Table,
    l1: usize,
    here: IoVirtAddr,
    end: u64,
) -> Step {
    let root_raw = root.read(l1);
    let Some(l2) = root.child_mut(l1) else {
        return Err(Inconsistency {
            va: here,
            level: Level::L1,
            raw: root_raw,
        });
    };
    let l2_idx = here.l2_index();

    if l2.child(l2_idx).is_some() {
        let (next, unmapped, l3_freed) = unmap_l3(alloc, l2, l2_idx, here, end)?;
        if l3_freed && l2.is_empty() {
            alloc.free_child(root, l1);
        }
        return Ok((next, unmapped));
    }

    let raw = l2.read(l2_idx);
    if !desc::is_leaf_raw(Level::L2, raw) {
        return Err(Inconsistency {
            va: here,
            level: Level::L2,
            raw,
        });
    }

    let entries = Level::L2.entries();
    let mut idx = l2_idx;
    let mut next = here.align_down(SIZE_2M).as_u64();
    while idx < entries && next < end && desc::is_leaf_raw(Level::L2, l2.read(idx)) {
        l2.store(idx, 0);
        idx += 1;
        next += SIZE_2M;
    }
    alloc.publish(l2, l2_idx..idx);
    break_contiguous(alloc, l2, l2_idx, idx);

    let emptied = idx - l2_idx == entries || l2.is_empty();
    if emptied {
        alloc.free_child(root, l1);
    }
    Ok((next, (idx - l2_idx) as u64 * SIZE_2M))
}

fn step<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    root: &mut Table,
    here: IoVirtAddr,
    end: u64,
) -> Step {
    let l1 = here.l1_index();
    if root.child(l1).is_some() {
        return unmap_l2(alloc, root, l1, here, end);
    }

    let raw = root.read(l1);
    match Descriptor::decode(Level::L1, raw) {
        Descriptor::Block { .. } => {
            alloc.write(root, l1, 0);
            Ok((here.align_down(SIZE_1G).as_u64() + SIZE_1G, SIZE_1G))
        }
        _ => Err(Inconsistency {
            va: here,
            level: Level::L1,
            raw,
        }),
    }
}

/// Unmaps `[va, va + len)`. `silent` suppresses the error log used for
/// rolling back a failed `map_range`.
pub(crate) fn walk<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    root: &mut Table,
    va: IoVirtAddr,
    len: u64,
    silent: bool,
) -> UnmapReport {
    let end = va.as_u64() + len;
    let mut cursor = va.as_u64();
    let mut report = UnmapReport::default();

    while cursor < end {
        let Some(here) = IoVirtAddr::try_from_u64(cursor) else {
            break;
        };
        match step(alloc, root, here, end) {
            Ok((next, unmapped)) => {
                report.unmapped += unmapped;
                cursor = next;
            }
            Err(found) => {
                if !silent {
                    log::error!(
                        "iommu: {} descriptor {:#x} at {} is not mapped (offset {:#x})",
                        found.level,
                        found.raw,
                        found.va,
                        cursor - va.as_u64()
                    );
                }
                report.inconsistency = Some(found);
                break;
            }
        }
    }
    report
}

impl<F: FrameSource, C: CacheMaintenance> IoPageTable<F, C> {
    /// Removes every mapping in `[va, va + len)` and frees tables that
    /// become empty.
    ///
    /// Stops at the first slot that holds no mapping and reports it; what
    /// was cleared before stays cleared.
    pub fn unmap_range(&mut self, va: IoVirtAddr, len: u64) -> Result<UnmapReport, PgTableError> {
        let (root, alloc) = self.root_and_alloc()?;
        check_range(va, len)?;
        Ok(walk(alloc, root, va, len, false))
    }

    /// Like [`unmap_range`](Self::unmap_range), but always reports `len`
    /// back, the way an IOMMU core expects.
    pub fn unmap(&mut self, va: IoVirtAddr, len: u64) -> u64 {
        if let Err(err) = self.unmap_range(va, len) {
            log::debug!("iommu: unmap {va}+{len:#x} ignored ({err})");
        }
        len
    }
}
