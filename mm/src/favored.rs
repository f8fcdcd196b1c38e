//! Favored-range physical allocator.
//!
//! Platforms may advertise physical windows that are preferable for aperture
//! backing. Allocations walk those windows first, in table order, and fall
//! back to the whole addressable space for whatever is left.

use alloc::vec::Vec;

use agplib_abi::memory_ranges::MemoryRangeTable;
use agplib_abi::{PAGE_SIZE, PhysAddr, bytes_to_pages};
use agplib_lib::{klog_debug, klog_trace, klog_warn};

use crate::page_list::PageList;
use crate::page_source::PhysicalPageSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FavoredRange {
    pub lower: PhysAddr,
    pub upper: PhysAddr,
}

/// Ordered favored ranges plus the ceiling every allocation must respect.
///
/// Built once when the target attaches and immutable afterwards.
#[derive(Clone, Debug)]
pub struct FavoredMemory {
    ranges: Vec<FavoredRange>,
    max_address: PhysAddr,
}

impl FavoredMemory {
    pub fn empty(max_address: PhysAddr) -> Self {
        Self {
            ranges: Vec::new(),
            max_address,
        }
    }

    /// Ranges starting above `max_address` are dropped; ranges ending above it
    /// are clipped to it.
    pub fn from_ranges(
        ranges: impl IntoIterator<Item = (PhysAddr, PhysAddr)>,
        max_address: PhysAddr,
    ) -> Self {
        let ranges = ranges
            .into_iter()
            .filter_map(|(lower, upper)| {
                if lower > max_address {
                    klog_debug!(
                        "agp: dropping favored range {:#x}-{:#x} above max {:#x}",
                        lower,
                        upper,
                        max_address
                    );
                    return None;
                }
                Some(FavoredRange {
                    lower,
                    upper: upper.min(max_address),
                })
            })
            .collect();
        Self {
            ranges,
            max_address,
        }
    }

    /// Build from a raw platform memory-range table. Unknown table versions
    /// produce an empty list.
    pub fn from_table(raw: &[u8], max_address: PhysAddr) -> Self {
        match MemoryRangeTable::parse(raw) {
            Some(table) => Self::from_ranges(
                table
                    .iter()
                    .map(|e| (PhysAddr(e.lower), PhysAddr(e.upper))),
                max_address,
            ),
            None => {
                klog_debug!("agp: memory range table absent or unrecognised");
                Self::empty(max_address)
            }
        }
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[FavoredRange] {
        &self.ranges
    }

    pub fn max_address(&self) -> PhysAddr {
        self.max_address
    }

    /// Allocate up to `total_bytes` of backing pages.
    ///
    /// The result may be shorter than asked for; callers compare its length
    /// with the request. `None` means nothing could be allocated.
    pub fn allocate_physical(
        &self,
        source: &mut dyn PhysicalPageSource,
        total_bytes: u64,
    ) -> Option<PageList> {
        self.allocate_with_combiner(source, total_bytes, PageList::try_combine)
    }

    fn allocate_with_combiner(
        &self,
        source: &mut dyn PhysicalPageSource,
        total_bytes: u64,
        combine: fn(Vec<PageList>) -> Result<PageList, Vec<PageList>>,
    ) -> Option<PageList> {
        let mut needed = bytes_to_pages(total_bytes);
        let mut fragments: Vec<PageList> = Vec::new();
        klog_trace!("agp: allocating {} pages", needed);

        for range in &self.ranges {
            if let Some(list) = source.allocate_in(range.lower, range.upper, needed * PAGE_SIZE) {
                klog_trace!(
                    "agp: {} pages from favored range {:#x}-{:#x}",
                    list.len(),
                    range.lower,
                    range.upper
                );
                needed -= list.len() as u64;
                fragments.push(list);
                if needed == 0 {
                    break;
                }
            }
        }

        if needed > 0 {
            if let Some(list) = source.allocate_in(PhysAddr::NULL, self.max_address, needed * PAGE_SIZE) {
                klog_trace!("agp: {} pages from global memory", list.len());
                fragments.push(list);
            }
        }

        if fragments.is_empty() {
            return None;
        }

        match combine(fragments) {
            Ok(list) => Some(list),
            Err(fragments) => {
                klog_warn!("agp: could not combine page lists, retrying unconstrained");
                for fragment in fragments {
                    source.free(fragment);
                }
                source.allocate_in(PhysAddr::NULL, self.max_address, total_bytes)
            }
        }
    }

    /// Like [`allocate_physical`](Self::allocate_physical), but a short
    /// allocation is freed and reported as failure.
    pub fn allocate_physical_exact(
        &self,
        source: &mut dyn PhysicalPageSource,
        total_bytes: u64,
    ) -> Option<PageList> {
        let list = self.allocate_physical(source, total_bytes)?;
        if list.byte_count() < total_bytes {
            klog_warn!(
                "agp: wanted {:#x} bytes, only got {:#x}",
                total_bytes,
                list.byte_count()
            );
            source.free(list);
            return None;
        }
        Some(list)
    }
}

#[cfg(test)]
#[path = "favored_tests.rs"]
mod tests;
