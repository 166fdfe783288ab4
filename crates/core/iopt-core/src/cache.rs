//! Making descriptor writes visible to a non-coherent table walker.
//!
//! An IOMMU that does not snoop CPU caches reads translation tables straight
//! from memory. After every descriptor store the table engine hands the
//! touched slots to a [`CacheMaintenance`] implementation, which must write
//! the covering cache lines back before returning.

/// Publishes descriptor stores to the device's table walker.
pub trait CacheMaintenance {
    /// Makes the stores to `descriptors` visible to the walker.
    ///
    /// `descriptors` always lies inside a single table frame.
    fn publish(&self, descriptors: &[u64]);
}

impl<T: CacheMaintenance + ?Sized> CacheMaintenance for &T {
    fn publish(&self, descriptors: &[u64]) {
        (**self).publish(descriptors);
    }
}

/// Maintenance for a coherent walker: nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMaintenance;

impl CacheMaintenance for NoMaintenance {
    #[inline]
    fn publish(&self, _descriptors: &[u64]) {}
}

#[cfg(target_arch = "aarch64")]
pub use arm64::DcacheClean;

#[cfg(target_arch = "aarch64")]
mod arm64 {
    use core::arch::asm;

    use super::CacheMaintenance;

    /// Cleans data cache lines to the point of coherency with `DC CVAC`.
    #[derive(Debug, Clone, Copy)]
    pub struct DcacheClean {
        line_size: usize,
    }

    impl DcacheClean {
        /// Reads the minimum data cache line size from `CTR_EL0`.
        #[must_use]
        pub fn new() -> Self {
            let ctr: u64;
            // SAFETY: CTR_EL0 is readable at EL1 and has no side effects.
            unsafe {
                asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
            }
            // DminLine is log2 of the line size in 4-byte words.
            Self {
                line_size: 4 << ((ctr >> 16) & 0xF),
            }
        }
    }

    impl Default for DcacheClean {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CacheMaintenance for DcacheClean {
        fn publish(&self, descriptors: &[u64]) {
            if descriptors.is_empty() {
                return;
            }
            let start = descriptors.as_ptr() as usize;
            let end = start + core::mem::size_of_val(descriptors);
            let mut line = start & !(self.line_size - 1);
            while line < end {
                // SAFETY: `line` covers memory of a live descriptor slice.
                unsafe {
                    asm!("dc cvac, {}", in(reg) line, options(nostack, preserves_flags));
                }
                line += self.line_size;
            }
            // SAFETY: barrier only.
            unsafe {
                asm!("dsb ish", options(nostack, preserves_flags));
            }
        }
    }
}
