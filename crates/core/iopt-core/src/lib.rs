//! Core types for I/O page-table engines.
//!
//! This crate contains the host-testable building blocks the table engine
//! sits on: typed device-virtual and physical addresses, frames and mapping
//! granules, the frame-source traits, a bitmap frame pool, and the cache
//! maintenance hook used to publish descriptor stores to a non-coherent
//! walker.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod addr;
pub mod cache;
pub mod mm;
pub mod paging;
pub mod pmm;

pub use addr::{IoVirtAddr, PhysAddr};
pub use cache::{CacheMaintenance, NoMaintenance};
pub use mm::{DirectMap, FrameAllocator, FrameDeallocator, FrameSource, PhysMemoryRegion, PmmError};
pub use paging::{Granule, PAGE_SIZE, PhysFrame};
pub use pmm::BitmapFramePool;
