//! Owned lists of physical page frames.
//!
//! A [`PageList`] is the unit of ownership for physical backing: whoever holds
//! it is responsible for returning the frames to a
//! [`PhysicalPageSource`](crate::page_source::PhysicalPageSource). There is no
//! implicit free on drop; callers tear lists down explicitly.

use alloc::vec::Vec;

use agplib_abi::{PAGE_SIZE, Pfn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageList {
    pages: Vec<Pfn>,
}

impl PageList {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn from_vec(pages: Vec<Pfn>) -> Self {
        Self { pages }
    }

    pub fn from_pfns(pages: &[Pfn]) -> Self {
        Self {
            pages: pages.to_vec(),
        }
    }

    /// `count` consecutive frames starting at `first`.
    pub fn contiguous(first: Pfn, count: u64) -> Self {
        Self {
            pages: (first.0..first.0 + count).map(Pfn).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn byte_count(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn pfns(&self) -> &[Pfn] {
        &self.pages
    }

    pub fn push(&mut self, pfn: Pfn) {
        self.pages.push(pfn);
    }

    pub fn into_vec(self) -> Vec<Pfn> {
        self.pages
    }

    /// Highest frame in the list.
    pub fn max_pfn(&self) -> Option<Pfn> {
        self.pages.iter().copied().max()
    }

    /// Copy `[offset, offset + count)` out as a new list.
    pub fn slice(&self, offset: usize, count: usize) -> Option<PageList> {
        let end = offset.checked_add(count)?;
        self.pages.get(offset..end).map(PageList::from_pfns)
    }

    /// Merge `fragments` into one list, preserving order.
    ///
    /// Ownership moves into the merged list on success. If the merged array
    /// cannot be allocated the fragments are handed back untouched.
    pub fn try_combine(mut fragments: Vec<PageList>) -> Result<PageList, Vec<PageList>> {
        if fragments.len() == 1 {
            return Ok(fragments.remove(0));
        }
        let total: usize = fragments.iter().map(PageList::len).sum();
        let mut merged = Vec::new();
        if merged.try_reserve_exact(total).is_err() {
            return Err(fragments);
        }
        for fragment in &fragments {
            merged.extend_from_slice(&fragment.pages);
        }
        Ok(PageList { pages: merged })
    }
}
