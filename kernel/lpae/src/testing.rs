//! Host-side collaborators for unit tests.

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::NonNull;

use iopt_core::addr::PhysAddr;
use iopt_core::cache::CacheMaintenance;
use iopt_core::mm::{DirectMap, FrameAllocator, FrameDeallocator, PhysMemoryRegion};
use iopt_core::paging::{PAGE_SIZE, PhysFrame};
use iopt_core::pmm::BitmapFramePool;

use crate::{IoPageTable, PageTableConfig};

/// Physical base the heap buffer pretends to live at.
const POOL_BASE: u64 = 0x8000_0000;

/// A frame pool backed by a heap buffer, with optional fault injection.
pub(crate) struct TestFrames {
    pool: BitmapFramePool,
    memory: NonNull<u8>,
    layout: Layout,
    /// Allocations left before every further one fails.
    remaining: Option<usize>,
    allocations: usize,
}

impl TestFrames {
    /// Creates a pool with `frames` usable frames (plus one for the bitmap).
    pub(crate) fn new(frames: usize) -> Self {
        let total = frames + 1;
        let layout = Layout::from_size_align(total * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        // SAFETY: non-zero size.
        let memory = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        let region = PhysMemoryRegion {
            start: PhysAddr::new(POOL_BASE),
            size: layout.size() as u64,
        };
        // SAFETY: the buffer is exclusively ours and stays alive as long as
        // the pool does.
        let pool = unsafe {
            BitmapFramePool::new(region, (memory.as_ptr() as u64).wrapping_sub(POOL_BASE)).unwrap()
        };
        Self {
            pool,
            memory,
            layout,
            remaining: None,
            allocations: 0,
        }
    }

    /// Lets `successes` more allocations through, then fails the rest.
    pub(crate) fn fail_after(&mut self, successes: usize) {
        self.remaining = Some(successes);
    }

    pub(crate) fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    pub(crate) fn allocations(&self) -> usize {
        self.allocations
    }
}

impl Drop for TestFrames {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}

// SAFETY: forwards to the pool.
unsafe impl FrameAllocator for TestFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        let frame = self.pool.allocate_frame()?;
        self.allocations += 1;
        Some(frame)
    }
}

// SAFETY: forwards to the pool.
unsafe impl FrameDeallocator for TestFrames {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let result = unsafe { self.pool.deallocate(frame) };
        assert!(result.is_ok(), "freed foreign frame {frame:?}");
    }
}

// SAFETY: forwards to the pool.
unsafe impl DirectMap for TestFrames {
    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8> {
        self.pool.frame_ptr(frame)
    }
}

/// Counts publish calls and the descriptors they covered.
#[derive(Default)]
pub(crate) struct RecordingMaintenance {
    calls: Cell<usize>,
    descriptors: Cell<usize>,
}

impl RecordingMaintenance {
    pub(crate) fn calls(&self) -> usize {
        self.calls.get()
    }

    pub(crate) fn descriptors(&self) -> usize {
        self.descriptors.get()
    }
}

impl CacheMaintenance for RecordingMaintenance {
    fn publish(&self, descriptors: &[u64]) {
        self.calls.set(self.calls.get() + 1);
        self.descriptors.set(self.descriptors.get() + descriptors.len());
    }
}

pub(crate) type TestTable = IoPageTable<TestFrames, RecordingMaintenance>;

/// A fresh table with room for `frames` table frames.
pub(crate) fn table(frames: usize) -> TestTable {
    table_with(frames, PageTableConfig::new())
}

pub(crate) fn table_with(frames: usize, config: PageTableConfig) -> TestTable {
    IoPageTable::new(TestFrames::new(frames), RecordingMaintenance::default(), config).unwrap()
}
