//! Bitmap-based physical frame pool.
//!
//! Manages one contiguous physical region reached through a direct-map
//! offset. Each bit of the bitmap represents one 4 KiB frame of the region:
//! 1 means allocated/reserved, 0 means free. The bitmap lives in the leading
//! frames of the region itself. Word-level scanning with `trailing_zeros()`
//! keeps allocation cheap.

use core::ptr::NonNull;

use crate::addr::PhysAddr;
use crate::mm::{DirectMap, FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};
use crate::paging::{PAGE_SIZE, PhysFrame};

const BITS_PER_WORD: usize = 64;

/// A bitmap-based pool of page-table frames.
///
/// All mutation goes through `&mut self`; callers that share a pool across
/// table instances wrap it in their own lock.
pub struct BitmapFramePool {
    /// Bitmap stored in the first frames of the managed region.
    bitmap: &'static mut [u64],
    /// Physical address of frame 0 of the region.
    base: PhysAddr,
    /// Total number of frames tracked by the bitmap.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index hint for next allocation search.
    search_hint: usize,
    /// Added to a physical address to obtain its CPU-visible address.
    direct_map_offset: u64,
}

impl BitmapFramePool {
    /// Creates a pool over `region`.
    ///
    /// # Safety
    ///
    /// - `direct_map_offset + p` must be a valid, writable CPU address for
    ///   every physical address `p` inside `region`.
    /// - The region must not be used by anything else for the lifetime of
    ///   the pool.
    pub unsafe fn new(region: PhysMemoryRegion, direct_map_offset: u64) -> Result<Self, PmmError> {
        let base = region.start.align_up(PAGE_SIZE);
        let end = PhysAddr::new_truncate(region.start.as_u64() + region.size).align_down(PAGE_SIZE);
        if end <= base {
            return Err(PmmError::RegionTooSmall);
        }

        let total_frames = ((end - base) / PAGE_SIZE) as usize;
        let bitmap_words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_frames = (bitmap_words * 8).div_ceil(PAGE_SIZE as usize);

        if total_frames <= bitmap_frames {
            return Err(PmmError::RegionTooSmall);
        }

        // SAFETY: The caller guarantees the region is mapped at
        // `direct_map_offset` and exclusively ours; the bitmap fits within
        // its first `bitmap_frames` frames.
        let bitmap = unsafe {
            let ptr = direct_map_offset.wrapping_add(base.as_u64()) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };

        bitmap.fill(0);

        // Bits past the end of the region are never handed out.
        let tail = total_frames % BITS_PER_WORD;
        if tail != 0 {
            bitmap[bitmap_words - 1] = u64::MAX << tail;
        }

        // The bitmap's own frames are in use.
        for frame_idx in 0..bitmap_frames {
            bitmap[frame_idx / BITS_PER_WORD] |= 1u64 << (frame_idx % BITS_PER_WORD);
        }

        Ok(Self {
            bitmap,
            base,
            total_frames,
            free_count: total_frames - bitmap_frames,
            search_hint: 0,
            direct_map_offset,
        })
    }

    /// Allocates a single zero-filled frame.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        if self.free_count == 0 {
            return None;
        }

        // Scan from search_hint, wrapping around if needed.
        let start = self.search_hint;
        let words = self.bitmap.len();

        for offset in 0..words {
            let word_idx = (start + offset) % words;
            let word = self.bitmap[word_idx];

            if word == u64::MAX {
                continue;
            }

            // First zero bit: invert, then trailing_zeros gives position.
            let bit_idx = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit_idx;

            self.bitmap[word_idx] |= 1u64 << bit_idx;
            self.free_count -= 1;
            self.search_hint = word_idx;

            let frame = PhysFrame::containing_address(self.base + frame_idx as u64 * PAGE_SIZE);
            // SAFETY: The frame was just taken out of the free set and lies
            // inside the direct-mapped region.
            unsafe {
                core::ptr::write_bytes(self.frame_ptr(frame).as_ptr(), 0, PAGE_SIZE as usize);
            }
            return Some(frame);
        }

        None
    }

    /// Returns a frame to the pool.
    ///
    /// # Safety
    ///
    /// The frame must have been previously allocated by this pool and must
    /// not be in use.
    pub unsafe fn deallocate(&mut self, frame: PhysFrame) -> Result<(), PmmError> {
        let frame_idx = self.frame_index(frame).ok_or(PmmError::InvalidFrame)?;

        let word_idx = frame_idx / BITS_PER_WORD;
        let bit_idx = frame_idx % BITS_PER_WORD;

        debug_assert!(
            self.bitmap[word_idx] & (1u64 << bit_idx) != 0,
            "double free of frame {:#x}",
            frame.start_address().as_u64()
        );
        self.bitmap[word_idx] &= !(1u64 << bit_idx);
        self.free_count += 1;

        if word_idx < self.search_hint {
            self.search_hint = word_idx;
        }

        Ok(())
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Returns the total number of tracked frames, including the bitmap's.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns `true` if `frame` is currently allocated from this pool.
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        self.frame_index(frame)
            .is_some_and(|idx| self.bitmap[idx / BITS_PER_WORD] & (1u64 << (idx % BITS_PER_WORD)) != 0)
    }

    fn frame_index(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address();
        if addr < self.base {
            return None;
        }
        let idx = ((addr - self.base) / PAGE_SIZE) as usize;
        (idx < self.total_frames).then_some(idx)
    }
}

// SAFETY: `allocate` hands out each free frame once and zero-fills it.
unsafe impl FrameAllocator for BitmapFramePool {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}

// SAFETY: forwards to `deallocate`, which rejects foreign frames.
unsafe impl FrameDeallocator for BitmapFramePool {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        let _ = unsafe { self.deallocate(frame) };
    }
}

// SAFETY: `new` requires the whole region to be direct-mapped at the offset.
unsafe impl DirectMap for BitmapFramePool {
    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8> {
        let virt = self.direct_map_offset.wrapping_add(frame.start_address().as_u64());
        // SAFETY: The bitmap occupies the first direct-mapped frame, so the
        // direct map never places a region frame at CPU address zero.
        unsafe { NonNull::new_unchecked(virt as *mut u8) }
    }
}
