//! Physical memory source traits.
//!
//! The table engine never owns physical memory directly. Every table frame
//! comes from a [`FrameAllocator`], goes back through a [`FrameDeallocator`],
//! and is reached by the CPU through a [`DirectMap`].

use core::fmt;
use core::ptr::NonNull;

use crate::addr::PhysAddr;
use crate::paging::PhysFrame;

/// A physical frame allocator.
///
/// # Safety
///
/// Implementations must return unique, page-aligned, zero-filled frames that
/// are not in use elsewhere.
pub unsafe trait FrameAllocator {
    /// Allocates a single physical frame, returning `None` if out of memory.
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// A physical frame deallocator.
///
/// # Safety
///
/// Implementations must only deallocate frames that were previously allocated
/// by the corresponding allocator and are no longer in use.
pub unsafe trait FrameDeallocator {
    /// Returns a physical frame to the allocator.
    ///
    /// # Safety
    ///
    /// `frame` must have come from the paired allocator and must not be
    /// referenced by any live descriptor.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame);
}

/// CPU access to physical frames.
///
/// # Safety
///
/// `frame_ptr` must return a pointer through which the whole 4 KiB frame is
/// readable and writable for as long as the frame stays allocated.
pub unsafe trait DirectMap {
    /// Returns the CPU-visible address of the start of `frame`.
    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8>;
}

/// Everything the table engine needs from the physical memory layer.
pub trait FrameSource: FrameAllocator + FrameDeallocator + DirectMap {}

impl<T: FrameAllocator + FrameDeallocator + DirectMap> FrameSource for T {}

// SAFETY: forwards to the underlying implementation.
unsafe impl<T: FrameAllocator + ?Sized> FrameAllocator for &mut T {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        (**self).allocate_frame()
    }
}

// SAFETY: forwards to the underlying implementation.
unsafe impl<T: FrameDeallocator + ?Sized> FrameDeallocator for &mut T {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        unsafe { (**self).deallocate_frame(frame) }
    }
}

// SAFETY: forwards to the underlying implementation.
unsafe impl<T: DirectMap + ?Sized> DirectMap for &mut T {
    fn frame_ptr(&self, frame: PhysFrame) -> NonNull<u8> {
        (**self).frame_ptr(frame)
    }
}

/// A contiguous physical memory region handed to a frame pool.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Physical start address of the region.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
}

/// Frame pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// The frame address is outside the pool or not frame aligned.
    InvalidFrame,
    /// The region cannot hold its own bitmap plus at least one frame.
    RegionTooSmall,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmmError::InvalidFrame => write!(f, "invalid frame address"),
            PmmError::RegionTooSmall => write!(f, "region too small for frame pool"),
        }
    }
}
