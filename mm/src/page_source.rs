//! Physical page allocation contract and a bitmap-backed frame pool.
//!
//! The aperture layer only ever asks for "up to N bytes of pages inside
//! [min, max]" and hands whole lists back. [`FramePool`] implements that
//! contract over a fixed frame window; it backs simulated platforms and is
//! what the host tests drive.

use alloc::vec;
use alloc::vec::Vec;

use agplib_abi::{PAGE_SIZE, PhysAddr, Pfn, bytes_to_pages};

use crate::page_list::PageList;

pub trait PhysicalPageSource: Send {
    /// Allocate up to `bytes` worth of pages whose physical addresses lie in
    /// `[min, max]`. May return fewer pages than asked for, never more.
    /// `None` when nothing at all could be allocated.
    fn allocate_in(&mut self, min: PhysAddr, max: PhysAddr, bytes: u64) -> Option<PageList>;

    /// Return every frame in `pages`.
    fn free(&mut self, pages: PageList);
}

const BITS_PER_WORD: usize = 64;

/// Bitmap frame allocator over `[base, base + frames)`.
pub struct FramePool {
    base: Pfn,
    frames: usize,
    bitmap: Vec<u64>,
    allocated: usize,
    /// Total frames the pool will still hand out; `None` is unlimited.
    budget: Option<usize>,
}

impl FramePool {
    pub fn new(base: Pfn, frames: usize) -> Self {
        Self {
            base,
            frames,
            bitmap: vec![0; frames.div_ceil(BITS_PER_WORD)],
            allocated: 0,
            budget: None,
        }
    }

    /// Pool covering the byte range `[start, start + bytes)`.
    pub fn for_range(start: PhysAddr, bytes: u64) -> Self {
        Self::new(start.pfn(), bytes_to_pages(bytes) as usize)
    }

    /// Cap the number of frames handed out from now on.
    pub fn set_budget(&mut self, frames: Option<usize>) {
        self.budget = frames;
    }

    pub fn allocated_frames(&self) -> usize {
        self.allocated
    }

    pub fn free_frames(&self) -> usize {
        self.frames - self.allocated
    }

    pub fn is_allocated(&self, pfn: Pfn) -> bool {
        self.index_of(pfn).is_some_and(|idx| self.test(idx))
    }

    /// Mark a frame as in use without handing it out.
    pub fn reserve_frame(&mut self, pfn: Pfn) -> bool {
        match self.index_of(pfn) {
            Some(idx) if !self.test(idx) => {
                self.set(idx, true);
                self.allocated += 1;
                true
            }
            _ => false,
        }
    }

    fn index_of(&self, pfn: Pfn) -> Option<usize> {
        let idx = pfn.0.checked_sub(self.base.0)? as usize;
        (idx < self.frames).then_some(idx)
    }

    fn test(&self, idx: usize) -> bool {
        self.bitmap[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, idx: usize, used: bool) {
        let word = &mut self.bitmap[idx / BITS_PER_WORD];
        let bit = 1u64 << (idx % BITS_PER_WORD);
        if used {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Frame index window covering `[min, max]`, clipped to the pool.
    fn window(&self, min: PhysAddr, max: PhysAddr) -> Option<(usize, usize)> {
        if max < min || self.frames == 0 {
            return None;
        }
        let first_pfn = min.0.div_ceil(PAGE_SIZE).max(self.base.0);
        // The last frame must fit entirely at or below `max`.
        let last_pfn = (max.0.saturating_add(1) / PAGE_SIZE).checked_sub(1)?;
        let last_pfn = last_pfn.min(self.base.0 + self.frames as u64 - 1);
        if last_pfn < first_pfn {
            return None;
        }
        Some((
            (first_pfn - self.base.0) as usize,
            (last_pfn - self.base.0) as usize,
        ))
    }
}

impl PhysicalPageSource for FramePool {
    fn allocate_in(&mut self, min: PhysAddr, max: PhysAddr, bytes: u64) -> Option<PageList> {
        let mut wanted = bytes_to_pages(bytes) as usize;
        if let Some(budget) = self.budget {
            wanted = wanted.min(budget);
        }
        if wanted == 0 {
            return None;
        }
        let (first, last) = self.window(min, max)?;

        let mut pages = Vec::new();
        for idx in first..=last {
            if pages.len() == wanted {
                break;
            }
            if !self.test(idx) {
                self.set(idx, true);
                pages.push(Pfn(self.base.0 + idx as u64));
            }
        }
        if pages.is_empty() {
            return None;
        }
        self.allocated += pages.len();
        if let Some(budget) = self.budget.as_mut() {
            *budget -= pages.len();
        }
        Some(PageList::from_vec(pages))
    }

    fn free(&mut self, pages: PageList) {
        for pfn in pages.pfns() {
            if let Some(idx) = self.index_of(*pfn) {
                if self.test(idx) {
                    self.set(idx, false);
                    self.allocated -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_within_window() {
        let mut pool = FramePool::new(Pfn(0x100), 64);
        let list = pool
            .allocate_in(PhysAddr(0x110_000), PhysAddr(0x113_FFF), 8 * PAGE_SIZE)
            .unwrap();
        assert_eq!(list.pfns(), &[Pfn(0x110), Pfn(0x111), Pfn(0x112), Pfn(0x113)]);
        assert_eq!(pool.allocated_frames(), 4);
    }

    #[test]
    fn test_window_outside_pool_yields_none() {
        let mut pool = FramePool::new(Pfn(0x100), 16);
        assert!(pool.allocate_in(PhysAddr(0), PhysAddr(0xFF_FFF), PAGE_SIZE).is_none());
    }

    #[test]
    fn test_budget_limits_and_free_restores() {
        let mut pool = FramePool::new(Pfn(0), 32);
        pool.set_budget(Some(3));
        let list = pool.allocate_in(PhysAddr(0), PhysAddr::MAX, 10 * PAGE_SIZE).unwrap();
        assert_eq!(list.len(), 3);
        assert!(pool.allocate_in(PhysAddr(0), PhysAddr::MAX, PAGE_SIZE).is_none());
        pool.free(list);
        assert_eq!(pool.allocated_frames(), 0);
        assert_eq!(pool.free_frames(), 32);
    }
}
