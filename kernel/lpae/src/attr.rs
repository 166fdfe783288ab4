//! Protection request to leaf attribute translation.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::desc::{LeafAttrs, LowerAttrs, UpperAttrs};

/// Attribute index of normal non-cacheable memory.
pub const ATTR_INDEX_NON_CACHEABLE: u8 = 1;
/// Attribute index of normal inner write-allocate memory.
pub const ATTR_INDEX_WRITE_ALLOC: u8 = 7;

bitflags::bitflags! {
    /// Protection requested by the caller of a map operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IommuProt: u32 {
        /// Device may read.
        const READ      = 1 << 0;
        /// Device may write.
        const WRITE     = 1 << 1;
        /// Mapping is cacheable and coherent with the CPU.
        const CACHEABLE = 1 << 2;
    }
}

/// Memory type used for cacheable mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Fixed inner write-allocate policy.
    #[default]
    WriteAlloc,
    /// Use the attribute index the host kernel uses for its own normal
    /// memory mappings.
    MirrorHost {
        /// Host attribute index (0..=7).
        attr_index: u8,
    },
}

impl CachePolicy {
    /// Attribute index for cacheable leaves under this policy.
    pub const fn attr_index(self) -> u8 {
        match self {
            Self::WriteAlloc => ATTR_INDEX_WRITE_ALLOC,
            Self::MirrorHost { attr_index } => attr_index & 0b111,
        }
    }
}

/// A protection request that was adjusted before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtFixup {
    /// Neither read nor write was requested; read/write was assumed.
    AssumedReadWrite,
    /// Write-only is unsupported; read was added.
    WriteOnlyUpgraded,
}

static WARNED_NO_ACCESS: AtomicBool = AtomicBool::new(false);
static WARNED_WRITE_ONLY: AtomicBool = AtomicBool::new(false);

fn warn_once(flag: &AtomicBool, msg: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        log::warn!("iommu: {msg}");
    }
}

/// Leaf attributes produced by [`translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translated {
    /// Attributes to encode into every leaf of the mapping.
    pub attrs: LeafAttrs,
    /// Set when the request had to be adjusted.
    pub fixup: Option<ProtFixup>,
}

/// Converts `prot` into leaf attributes.
///
/// Total over its input: an unusable request is adjusted, warned about once,
/// and reported in [`Translated::fixup`].
pub fn translate(mut prot: IommuProt, policy: CachePolicy) -> Translated {
    let mut fixup = None;

    if !prot.intersects(IommuProt::READ | IommuProt::WRITE) {
        prot |= IommuProt::READ | IommuProt::WRITE;
        warn_once(&WARNED_NO_ACCESS, "no attributes in mapping; assuming RW");
        fixup = Some(ProtFixup::AssumedReadWrite);
    }

    if prot.contains(IommuProt::WRITE) && !prot.contains(IommuProt::READ) {
        prot |= IommuProt::READ;
        warn_once(&WARNED_WRITE_ONLY, "write-only unsupported; falling back to RW");
        fixup = Some(ProtFixup::WriteOnlyUpgraded);
    }

    let cacheable = prot.contains(IommuProt::CACHEABLE);

    let mut lower = LowerAttrs::NG | LowerAttrs::AF;
    if cacheable {
        lower |= LowerAttrs::SH_INNER;
    }
    lower |= if prot.contains(IommuProt::WRITE) {
        LowerAttrs::AP_RW
    } else {
        LowerAttrs::AP_RO
    };

    Translated {
        attrs: LeafAttrs {
            attr_index: if cacheable {
                policy.attr_index()
            } else {
                ATTR_INDEX_NON_CACHEABLE
            },
            lower,
            upper: UpperAttrs::empty(),
        },
        fixup,
    }
}
