//! Physical address and page-frame types shared by every agplib crate.
//!
//! The aperture, the GART and the page lists all speak in either byte
//! addresses or page frame numbers. Keeping the two as separate newtypes
//! stops a PFN from being programmed into a descriptor that expects a byte
//! address (and the other way round).

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// A physical memory address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// A physical page frame number (`address >> PAGE_SHIFT`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pfn(pub u64);

// =============================================================================
// PhysAddr implementation
// =============================================================================

impl PhysAddr {
    pub const NULL: Self = Self(0);

    /// Highest address reachable by a 32-bit-only aperture.
    pub const MAX_32BIT: Self = Self(0xFFFF_FFFF);

    /// Highest address of the whole physical space.
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Add an offset to this address (wrapping on overflow).
    #[inline]
    pub const fn offset(self, off: u64) -> Self {
        Self(self.0.wrapping_add(off))
    }

    /// Add an offset, returning None on overflow.
    #[inline]
    pub const fn checked_offset(self, off: u64) -> Option<Self> {
        match self.0.checked_add(off) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Check if address is aligned to the given power-of-two alignment.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        align == 0 || self.0 & (align - 1) == 0
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Frame containing this address.
    #[inline]
    pub const fn pfn(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    /// Base address of the page `pages` pages past this one.
    #[inline]
    pub const fn add_pages(self, pages: u64) -> Self {
        Self(self.0.wrapping_add(pages << PAGE_SHIFT))
    }
}

impl core::fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

// =============================================================================
// Pfn implementation
// =============================================================================

impl Pfn {
    #[inline]
    pub const fn new(frame: u64) -> Self {
        Self(frame)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn to_phys(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Number of pages needed to hold `bytes`, rounding up.
#[inline]
pub const fn bytes_to_pages(bytes: u64) -> u64 {
    (bytes >> PAGE_SHIFT) + if bytes & (PAGE_SIZE - 1) != 0 { 1 } else { 0 }
}

#[inline]
pub const fn pages_to_bytes(pages: u64) -> u64 {
    pages << PAGE_SHIFT
}
