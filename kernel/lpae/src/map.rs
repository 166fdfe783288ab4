//! Mapping engine.

use core::cmp;

use iopt_core::addr::{IoVirtAddr, PhysAddr};
use iopt_core::cache::CacheMaintenance;
use iopt_core::mm::FrameSource;
use iopt_core::paging::{Granule, PAGE_SIZE};

use crate::attr::{self, IommuProt};
use crate::desc::{self, CONTIGUOUS_ENTRIES, LeafAttrs};
use crate::table::{Table, TableAllocator};
use crate::{IoPageTable, PgTableError, unmap};

/// One physically contiguous segment of a scatter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Physical address of the segment.
    pub phys: PhysAddr,
    /// Device-visible intermediate address, zero when absent.
    pub dma_addr: PhysAddr,
    /// Length in bytes.
    pub length: u64,
}

impl SgEntry {
    /// A segment without a DMA address.
    pub const fn new(phys: PhysAddr, length: u64) -> Self {
        Self {
            phys,
            dma_addr: PhysAddr::zero(),
            length,
        }
    }

    /// A segment whose DMA address differs from its physical address, such
    /// as a carveout without struct-page backing.
    pub const fn with_dma_addr(phys: PhysAddr, dma_addr: PhysAddr, length: u64) -> Self {
        Self { phys, dma_addr, length }
    }

    /// Address to map: the DMA address if set, else the physical address.
    pub const fn map_address(&self) -> PhysAddr {
        if self.dma_addr.is_zero() { self.phys } else { self.dma_addr }
    }
}

/// Checks that `[va, va + len)` lies inside the 4 GiB IOVA space.
pub(crate) fn check_range(va: IoVirtAddr, len: u64) -> Result<(), PgTableError> {
    let past_end = va.as_u64().checked_add(len).is_none_or(|end| end > 1 << 32);
    if len % PAGE_SIZE != 0 || !va.is_aligned(PAGE_SIZE) || past_end {
        log::error!("iommu: bad range {va}+{len:#x}");
        return Err(PgTableError::InvalidArgument);
    }
    Ok(())
}

/// Returns the table below `parent[idx]`, allocating it if the slot is
/// empty.
fn next_table<'t, F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    parent: &'t mut Table,
    idx: usize,
) -> Result<&'t mut Table, PgTableError> {
    if parent.child(idx).is_none() {
        if parent.read(idx) != 0 {
            // A block already covers this range.
            return Err(PgTableError::Conflict);
        }
        alloc.alloc_level(parent, idx)?;
    }
    parent.child_mut(idx).ok_or(PgTableError::Inconsistent)
}

/// Writes `count` leaves starting at `idx`, each one entry span further into
/// the output range. Fails without writing if any target slot is in use.
fn write_leaves<F: FrameSource, C: CacheMaintenance>(
    alloc: &TableAllocator<F, C>,
    table: &mut Table,
    idx: usize,
    count: usize,
    pa: PhysAddr,
    attrs: LeafAttrs,
) -> Result<(), PgTableError> {
    let level = table.level();
    if idx + count > level.entries() {
        return Err(PgTableError::InvalidArgument);
    }
    if (idx..idx + count).any(|i| table.read(i) != 0) {
        log::debug!("iommu: {level} slots {idx}..{} busy", idx + count);
        return Err(PgTableError::Conflict);
    }
    let step = level.span();
    for i in 0..count {
        table.store(idx + i, desc::leaf(level, pa + i as u64 * step, attrs));
    }
    alloc.publish(table, idx..idx + count);
    Ok(())
}

/// Places one mapping of `granule` at `va`.
fn map_one<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    root: &mut Table,
    va: IoVirtAddr,
    pa: PhysAddr,
    granule: Granule,
    attrs: LeafAttrs,
) -> Result<(), PgTableError> {
    let l1 = va.l1_index();
    match granule {
        Granule::Size1GiB => write_leaves(alloc, root, l1, 1, pa, attrs),
        Granule::Size32MiB | Granule::Size2MiB => {
            let l2 = next_table(alloc, root, l1)?;
            let (count, attrs) = if granule == Granule::Size32MiB {
                (CONTIGUOUS_ENTRIES, attrs.with_contiguous())
            } else {
                (1, attrs)
            };
            write_leaves(alloc, l2, va.l2_index(), count, pa, attrs)
        }
        Granule::Size64KiB | Granule::Size4KiB => {
            let l2 = next_table(alloc, root, l1)?;
            let l3 = next_table(alloc, l2, va.l2_index())?;
            let (count, attrs) = if granule == Granule::Size64KiB {
                (CONTIGUOUS_ENTRIES, attrs.with_contiguous())
            } else {
                (1, attrs)
            };
            write_leaves(alloc, l3, va.l3_index(), count, pa, attrs)
        }
    }
}

/// Maps `len` bytes from `sg` starting at `va`, adding each mapped chunk to
/// `mapped`.
fn map_sg<F: FrameSource, C: CacheMaintenance>(
    alloc: &mut TableAllocator<F, C>,
    root: &mut Table,
    va: IoVirtAddr,
    sg: &[SgEntry],
    len: u64,
    attrs: LeafAttrs,
    mapped: &mut u64,
) -> Result<(), PgTableError> {
    let mut segments = sg.iter();
    let mut segment = segments.next().ok_or(PgTableError::InvalidArgument)?;
    let mut seg_offset = 0;

    while *mapped < len {
        if seg_offset >= segment.length {
            let Some(next) = segments.next() else {
                log::error!("iommu: scatter list ends {:#x} bytes short", len - *mapped);
                return Err(PgTableError::InvalidArgument);
            };
            segment = next;
            seg_offset = 0;
            continue;
        }

        let cur_va = va.checked_add(*mapped).ok_or(PgTableError::InvalidArgument)?;
        let available = cmp::min(segment.length - seg_offset, len - *mapped);
        // The chunk up to its last byte must stay inside the output space.
        let base = segment.map_address();
        let Some(pa) = base
            .checked_add(seg_offset)
            .filter(|pa| pa.checked_add(available - 1).is_some())
        else {
            log::error!(
                "iommu: scatter segment {base}+{:#x} leaves the output address space",
                segment.length
            );
            return Err(PgTableError::InvalidArgument);
        };
        if available < PAGE_SIZE || !pa.is_aligned(PAGE_SIZE) {
            log::error!("iommu: unaligned scatter segment {pa}+{available:#x}");
            return Err(PgTableError::InvalidArgument);
        }

        let granule = Granule::largest_fitting(cur_va, pa, available);
        log::trace!(
            "iommu: map_range va={cur_va} pa={pa} seg_len={:#x} chunk={granule}",
            segment.length
        );
        map_one(alloc, root, cur_va, pa, granule, attrs)?;

        *mapped += granule.size();
        seg_offset += granule.size();
    }
    Ok(())
}

impl<F: FrameSource, C: CacheMaintenance> IoPageTable<F, C> {
    /// Maps one extent of exactly 4 KiB, 64 KiB, 2 MiB, 32 MiB or 1 GiB.
    ///
    /// `va` and `pa` must be aligned to `len`. Tables allocated on the way
    /// down are kept if the leaf write fails.
    pub fn map(&mut self, va: IoVirtAddr, pa: PhysAddr, len: u64, prot: IommuProt) -> Result<(), PgTableError> {
        let Some(granule) = Granule::from_len(len) else {
            log::error!("iommu: bad length {len:#x}");
            return Err(PgTableError::InvalidArgument);
        };
        let cache_policy = self.cache_policy;
        let (root, alloc) = self.root_and_alloc()?;
        if !va.is_aligned(len) || !pa.is_aligned(len) {
            log::error!("iommu: {va} -> {pa} not aligned to {granule}");
            return Err(PgTableError::InvalidArgument);
        }

        let attrs = attr::translate(prot, cache_policy).attrs;
        map_one(alloc, root, va, pa, granule, attrs)
    }

    /// Maps `len` bytes of the scatter list `sg` at `va`, choosing the
    /// coarsest granule each step allows.
    ///
    /// On failure everything this call mapped is unmapped again before the
    /// error is returned.
    pub fn map_range(&mut self, va: IoVirtAddr, sg: &[SgEntry], len: u64, prot: IommuProt) -> Result<(), PgTableError> {
        let cache_policy = self.cache_policy;
        let (root, alloc) = self.root_and_alloc()?;
        check_range(va, len)?;
        if len == 0 {
            return Ok(());
        }

        let attrs = attr::translate(prot, cache_policy).attrs;
        let mut mapped = 0;
        let result = map_sg(alloc, root, va, sg, len, attrs, &mut mapped);
        if let Err(err) = result {
            log::debug!("iommu: map_range {va}+{len:#x} failed ({err}), rolling back {mapped:#x}");
            if mapped > 0 {
                unmap::walk(alloc, root, va, mapped, true);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{Descriptor, Level, LowerAttrs};
    use crate::testing;
    use iopt_core::paging::{SIZE_1G, SIZE_2M, SIZE_32M, SIZE_64K};

    const RW: IommuProt = IommuProt::READ.union(IommuProt::WRITE);
    const RWC: IommuProt = RW.union(IommuProt::CACHEABLE);

    fn va(addr: u32) -> IoVirtAddr {
        IoVirtAddr::new(addr)
    }

    fn pa(addr: u64) -> PhysAddr {
        PhysAddr::new(addr)
    }

    #[test]
    fn map_4k_page() {
        let mut table = testing::table(8);
        table.map(va(0x1000), pa(0x9000), PAGE_SIZE, RWC).unwrap();

        assert!(matches!(table.entry(Level::L1, va(0x1000)), Some(Descriptor::Table(_))));
        assert!(matches!(table.entry(Level::L2, va(0x1000)), Some(Descriptor::Table(_))));
        let Some(Descriptor::Page { addr, attrs }) = table.entry(Level::L3, va(0x1000)) else {
            panic!("no page descriptor");
        };
        assert_eq!(addr, pa(0x9000));
        assert!(attrs.is_writable());
        assert!(attrs.lower.contains(LowerAttrs::AF | LowerAttrs::NG | LowerAttrs::SH_INNER));
        assert_eq!(table.stats().l2_tables, 1);
        assert_eq!(table.stats().l3_tables, 1);
    }

    #[test]
    fn map_1g_block_needs_no_tables() {
        let mut table = testing::table(8);
        table.map(va(0x4000_0000), pa(0x1_0000_0000), SIZE_1G, IommuProt::READ).unwrap();
        let Some(Descriptor::Block { addr, attrs }) = table.entry(Level::L1, va(0x4000_0000)) else {
            panic!("no block descriptor");
        };
        assert_eq!(addr, pa(0x1_0000_0000));
        assert!(!attrs.is_writable());
        assert_eq!(table.frame_source().allocations(), 1);
        assert_eq!(table.entry(Level::L2, va(0x4000_0000)), None);
    }

    #[test]
    fn map_32m_writes_sixteen_hinted_blocks() {
        let mut table = testing::table(8);
        table.map(va(0x0200_0000), pa(0x4200_0000), SIZE_32M, RW).unwrap();
        for i in 0..16u32 {
            let addr = 0x0200_0000 + i * SIZE_2M as u32;
            let Some(Descriptor::Block { addr: out, attrs }) = table.entry(Level::L2, va(addr)) else {
                panic!("missing block {i}");
            };
            assert_eq!(out, pa(0x4200_0000 + u64::from(i) * SIZE_2M));
            assert!(attrs.is_contiguous());
        }
        assert_eq!(table.entry(Level::L2, va(0x0400_0000)), Some(Descriptor::Empty));
    }

    #[test]
    fn map_64k_writes_sixteen_hinted_pages() {
        let mut table = testing::table(8);
        table.map(va(0x0001_0000), pa(0x0005_0000), SIZE_64K, RW).unwrap();
        for i in 0..16u32 {
            let Some(Descriptor::Page { addr, attrs }) = table.entry(Level::L3, va(0x0001_0000 + i * 0x1000)) else {
                panic!("missing page {i}");
            };
            assert_eq!(addr, pa(0x0005_0000 + u64::from(i) * PAGE_SIZE));
            assert!(attrs.is_contiguous());
        }
    }

    #[test]
    fn bad_length_rejected() {
        let mut table = testing::table(8);
        assert_eq!(table.map(va(0), pa(0), 0x2000, RW), Err(PgTableError::InvalidArgument));
        assert_eq!(table.map(va(0), pa(0), 0, RW), Err(PgTableError::InvalidArgument));
        assert_eq!(table.map(va(0x1000), pa(0), SIZE_2M, RW), Err(PgTableError::InvalidArgument));
        assert_eq!(table.frame_source().allocations(), 1);
    }

    #[test]
    fn overlapping_maps_conflict_without_side_effects() {
        let mut table = testing::table(16);
        table.map(va(0x4000_0000), pa(0x4000_0000), SIZE_1G, RW).unwrap();
        table.map(va(0x0020_0000), pa(0x0020_0000), SIZE_2M, RW).unwrap();
        table.map(va(0x0001_0000), pa(0x0001_0000), SIZE_64K, RW).unwrap();
        let before = table.snapshot();
        let allocations = table.frame_source().allocations();

        let attempts: [(u32, u64); 8] = [
            (0x4000_0000, SIZE_1G),
            (0x4000_0000, SIZE_2M),
            (0x4123_4000, PAGE_SIZE),
            (0x0000_0000, SIZE_1G),
            (0x0000_0000, SIZE_32M),
            (0x0020_0000, PAGE_SIZE),
            (0x0001_0000, PAGE_SIZE),
            (0x0001_f000, PAGE_SIZE),
        ];
        for (addr, len) in attempts {
            assert_eq!(
                table.map(va(addr), pa(u64::from(addr)), len, RW),
                Err(PgTableError::Conflict),
                "{addr:#x}+{len:#x}"
            );
            assert_eq!(table.snapshot(), before, "{addr:#x}+{len:#x} changed the tree");
        }
        assert_eq!(table.frame_source().allocations(), allocations);
    }

    #[test]
    fn map_fails_on_oom_and_keeps_slot() {
        let mut table = testing::table(8);
        table.map(va(0x1000), pa(0x1000), PAGE_SIZE, RW).unwrap();
        let before = table.snapshot();
        table.alloc.frames.fail_after(0);
        assert_eq!(
            table.map(va(0x4000_1000), pa(0x1000), PAGE_SIZE, RW),
            Err(PgTableError::OutOfMemory)
        );
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn map_range_prefers_1g_blocks() {
        let mut table = testing::table(8);
        let sg = [SgEntry::new(pa(0x40_0000_0000 - 2 * SIZE_1G), 2 * SIZE_1G)];
        table.map_range(va(0x4000_0000), &sg, 2 * SIZE_1G, RW).unwrap();
        for addr in [0x4000_0000, 0x8000_0000] {
            assert!(matches!(table.entry(Level::L1, va(addr)), Some(Descriptor::Block { .. })));
        }
        assert_eq!(table.stats().l2_tables, 0);
        assert_eq!(table.frame_source().allocations(), 1);
    }

    #[test]
    fn map_range_scattered_pages() {
        let mut table = testing::table(8);
        let sg: [SgEntry; 4] = core::array::from_fn(|i| SgEntry::new(pa(0x10_0000 + i as u64 * 0x3000), PAGE_SIZE));
        table.map_range(va(0x0010_0000), &sg, 4 * PAGE_SIZE, RW).unwrap();
        for (i, seg) in sg.iter().enumerate() {
            let Some(Descriptor::Page { addr, attrs }) = table.entry(Level::L3, va(0x0010_0000 + i as u32 * 0x1000)) else {
                panic!("missing page {i}");
            };
            assert_eq!(addr, seg.phys);
            assert!(!attrs.is_contiguous());
        }
        assert_eq!(table.stats().l3_tables, 1);
    }

    #[test]
    fn map_range_mixes_granules() {
        let mut table = testing::table(8);
        // 4K + 64K + 2M, physically contiguous and co-aligned.
        let len = PAGE_SIZE + SIZE_64K + SIZE_2M;
        let start = 0x001E_F000;
        let sg = [SgEntry::new(pa(u64::from(start)), len + 0x10_0000)];
        table.map_range(va(start), &sg, len, RW).unwrap();

        assert!(matches!(table.entry(Level::L3, va(0x001E_F000)), Some(Descriptor::Page { attrs, .. }) if !attrs.is_contiguous()));
        assert!(matches!(table.entry(Level::L3, va(0x001F_0000)), Some(Descriptor::Page { attrs, .. }) if attrs.is_contiguous()));
        assert!(matches!(table.entry(Level::L2, va(0x0020_0000)), Some(Descriptor::Block { .. })));
        // The segment is longer than `len`; nothing past it is mapped.
        assert_eq!(table.entry(Level::L3, va(0x0040_0000)), None);
        assert_eq!(table.entry(Level::L2, va(0x0040_0000)), Some(Descriptor::Empty));
    }

    #[test]
    fn map_range_prefers_dma_address() {
        let mut table = testing::table(8);
        let sg = [SgEntry::with_dma_addr(pa(0x1000), pa(0x7000), PAGE_SIZE)];
        table.map_range(va(0x2000), &sg, PAGE_SIZE, RW).unwrap();
        assert!(matches!(table.entry(Level::L3, va(0x2000)), Some(Descriptor::Page { addr, .. }) if addr == pa(0x7000)));
    }

    #[test]
    fn map_range_rolls_back_on_oom() {
        let mut table = testing::table(16);
        let baseline = table.frame_source().free_frames();
        // Root is already allocated; let two more through, fail the third.
        table.alloc.frames.fail_after(2);

        // Three segments in three different 2M regions of two L1 entries.
        let sg = [
            SgEntry::new(pa(0x10_0000), PAGE_SIZE),
            SgEntry::new(pa(0x20_0000), PAGE_SIZE),
            SgEntry::new(pa(0x30_0000), PAGE_SIZE),
        ];
        let start = 0x3FFF_F000;
        assert_eq!(
            table.map_range(va(start), &sg, 3 * PAGE_SIZE, RW),
            Err(PgTableError::OutOfMemory)
        );

        for i in 0..3 {
            assert_eq!(table.entry(Level::L3, va(start + i * 0x1000)), None);
        }
        assert_eq!(table.stats(), crate::TableStats::default());
        assert_eq!(table.frame_source().free_frames(), baseline);
        assert_eq!(table.entry(Level::L1, va(start)), Some(Descriptor::Empty));
    }

    #[test]
    fn map_range_rolls_back_on_conflict() {
        let mut table = testing::table(8);
        table.map(va(0x3000), pa(0xA000), PAGE_SIZE, RW).unwrap();
        let before = table.snapshot();

        let sg = [SgEntry::new(pa(0x2_0000), 3 * PAGE_SIZE)];
        assert_eq!(
            table.map_range(va(0x1000), &sg, 3 * PAGE_SIZE, RW),
            Err(PgTableError::Conflict)
        );
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn map_range_short_scatter_list() {
        let mut table = testing::table(8);
        let before = table.snapshot();
        let sg = [SgEntry::new(pa(0x2_0000), PAGE_SIZE)];
        assert_eq!(
            table.map_range(va(0x1000), &sg, 2 * PAGE_SIZE, RW),
            Err(PgTableError::InvalidArgument)
        );
        // The first page and the tables allocated for it are gone again.
        assert_eq!(table.entry(Level::L3, va(0x1000)), None);
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn map_range_rejects_segment_past_output_space() {
        let mut table = testing::table(8);
        let before = table.snapshot();
        let sg = [SgEntry::new(pa(0xFF_FFFF_F000), 2 * PAGE_SIZE)];
        assert_eq!(
            table.map_range(va(0x1000), &sg, 2 * PAGE_SIZE, RW),
            Err(PgTableError::InvalidArgument)
        );
        assert_eq!(table.entry(Level::L3, va(0x2000)), None);
        assert_eq!(table.snapshot(), before);
        assert_eq!(table.stats(), crate::TableStats::default());

        // The last page of the output space maps when nothing runs past it.
        table.map_range(va(0x1000), &sg, PAGE_SIZE, RW).unwrap();
        assert!(matches!(
            table.entry(Level::L3, va(0x1000)),
            Some(Descriptor::Page { addr, .. }) if addr == pa(0xFF_FFFF_F000)
        ));
    }

    #[test]
    fn map_range_rolls_back_when_a_later_segment_overflows() {
        let mut table = testing::table(8);
        let before = table.snapshot();
        let sg = [
            SgEntry::new(pa(0x9000), PAGE_SIZE),
            SgEntry::new(pa(0xFF_FFFF_F000), 2 * PAGE_SIZE),
        ];
        assert_eq!(
            table.map_range(va(0x1000), &sg, 3 * PAGE_SIZE, RW),
            Err(PgTableError::InvalidArgument)
        );
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn map_range_rejects_bad_ranges() {
        let mut table = testing::table(8);
        let sg = [SgEntry::new(pa(0), SIZE_2M)];
        assert_eq!(table.map_range(va(0), &sg, 0x1800, RW), Err(PgTableError::InvalidArgument));
        assert_eq!(table.map_range(va(0x800), &sg, PAGE_SIZE, RW), Err(PgTableError::InvalidArgument));
        assert_eq!(
            table.map_range(va(0xFFFF_F000), &sg, 2 * PAGE_SIZE, RW),
            Err(PgTableError::InvalidArgument)
        );
        assert_eq!(table.map_range(va(0), &[], 0, RW), Ok(()));
    }
}
