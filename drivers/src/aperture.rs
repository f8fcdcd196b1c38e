//! Aperture allocator.
//!
//! [`GartState`] is everything a target protects with its one lock: the
//! platform strategy, the page source, config access, the live ranges and
//! the verifier. Every operation below assumes the caller holds that lock,
//! so a verifier tick can never observe a half-finished commit or unmap.
//!
//! Invariant: for every range, `committed` equals the number of pages the
//! platform currently has mapped for it. Failed operations leave both
//! exactly as they found them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use agplib_abi::capability::AgpCapability;
use agplib_abi::{AgpError, AgpResult, CachingType, PAGE_SHIFT, PAGE_SIZE, PhysAddr};
use agplib_lib::{CacheFlush, klog_debug, klog_error, klog_trace, klog_warn};
use agplib_mm::{FavoredMemory, PageList, PhysicalPageSource};

use crate::config::{get_command, set_capability};
use crate::pci::ConfigSpace;
use crate::platform::{AperturePlatform, ApertureInfo};
use crate::verifier::{CapabilitySetStrategy, TickReport, VerifierContext, VerifierFlags};

pub use crate::platform::AgpRange;

/// Smallest reservation tried when probing the usable aperture size.
pub const AGP_SIZE_PROBE_START_PAGES: u32 = ((2 * 1024 * 1024) / PAGE_SIZE) as u32;

/// Opaque handle to a reserved range. Stale handles are rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MapHandle {
    index: u32,
    generation: u32,
}

#[derive(Default)]
struct RangeSlot {
    generation: u32,
    range: Option<AgpRange>,
}

pub struct GartState {
    platform: Box<dyn AperturePlatform>,
    pages: Box<dyn PhysicalPageSource>,
    config: Arc<dyn ConfigSpace>,
    ranges: Vec<RangeSlot>,
    aperture: Option<ApertureInfo>,
    /// Usable window found by [`GartState::get_agp_size`].
    agp_size: Option<ApertureInfo>,
    verifier: VerifierContext,
    cache_flush: CacheFlush,
    max_address: PhysAddr,
}

impl GartState {
    pub fn new(
        platform: Box<dyn AperturePlatform>,
        pages: Box<dyn PhysicalPageSource>,
        config: Arc<dyn ConfigSpace>,
        verifier: VerifierContext,
        cache_flush: CacheFlush,
        max_address: PhysAddr,
    ) -> Self {
        Self {
            platform,
            pages,
            config,
            ranges: Vec::new(),
            aperture: None,
            agp_size: None,
            verifier,
            cache_flush,
            max_address,
        }
    }

    pub fn platform_mut(&mut self) -> &mut dyn AperturePlatform {
        &mut *self.platform
    }

    pub fn page_source_mut(&mut self) -> &mut dyn PhysicalPageSource {
        &mut *self.pages
    }

    pub fn config(&self) -> &dyn ConfigSpace {
        &*self.config
    }

    pub fn aperture(&self) -> Option<ApertureInfo> {
        self.aperture
    }

    pub fn max_address(&self) -> PhysAddr {
        self.max_address
    }

    pub fn verifier(&self) -> &VerifierContext {
        &self.verifier
    }

    pub fn verifier_mut(&mut self) -> &mut VerifierContext {
        &mut self.verifier
    }

    // =========================================================================
    // Aperture programming
    // =========================================================================

    /// Re-read the aperture from the bridge.
    pub fn refresh_aperture(&mut self) -> AgpResult<ApertureInfo> {
        let info = self.platform.query_aperture()?;
        self.aperture = Some(info);
        Ok(info)
    }

    pub fn program_aperture(&mut self, base: PhysAddr, pages: u32) -> AgpResult {
        self.platform.set_aperture(base, pages)?;
        self.aperture = Some(ApertureInfo { base, pages });
        self.agp_size = None;
        Ok(())
    }

    pub fn disable_aperture(&mut self) {
        self.platform.disable_aperture();
        self.agp_size = None;
    }

    /// Write the bridge's command register through the current strategy.
    pub fn set_target_capability(&mut self, capability: &AgpCapability) -> AgpResult {
        set_capability(&*self.config, capability)?;
        match self.verifier.strategy() {
            CapabilitySetStrategy::Direct => {}
            CapabilitySetStrategy::VerifierLocked => self.verifier.record_command(capability.command),
        }
        Ok(())
    }

    // =========================================================================
    // Verifier
    // =========================================================================

    pub fn set_verifier_flags(&mut self, flags: VerifierFlags) -> AgpResult {
        let config = &*self.config;
        self.verifier.set_flags(flags, || get_command(config))?;
        self.platform.update_verification(flags);
        Ok(())
    }

    pub fn verifier_tick(&mut self) -> TickReport {
        let Self {
            verifier,
            platform,
            config,
            ..
        } = self;
        verifier.tick(|| get_command(&**config), || platform.verifier_worker())
    }

    pub fn system_power_changed(&mut self, working: bool) {
        let config = &*self.config;
        self.verifier.system_power_changed(working, || get_command(config));
    }

    // =========================================================================
    // Range table
    // =========================================================================

    pub fn range(&self, handle: MapHandle) -> AgpResult<&AgpRange> {
        self.ranges
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.range.as_ref())
            .ok_or(AgpError::InvalidParameter)
    }

    fn range_mut(&mut self, handle: MapHandle) -> AgpResult<&mut AgpRange> {
        self.ranges
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.range.as_mut())
            .ok_or(AgpError::InvalidParameter)
    }

    fn insert_range(&mut self, range: AgpRange) -> MapHandle {
        let index = match self.ranges.iter().position(|slot| slot.range.is_none()) {
            Some(index) => index,
            None => {
                self.ranges.push(RangeSlot::default());
                self.ranges.len() - 1
            }
        };
        let slot = &mut self.ranges[index];
        slot.range = Some(range);
        MapHandle {
            index: index as u32,
            generation: slot.generation,
        }
    }

    pub fn live_ranges(&self) -> impl Iterator<Item = &AgpRange> {
        self.ranges.iter().filter_map(|slot| slot.range.as_ref())
    }

    /// Pages committed across every live range.
    pub fn committed_pages(&self) -> u64 {
        self.live_ranges().map(|range| range.committed as u64).sum()
    }

    // =========================================================================
    // Public memory operations
    // =========================================================================

    pub fn reserve(&mut self, pages: u32, caching: CachingType) -> AgpResult<MapHandle> {
        if pages == 0 {
            return Err(AgpError::InvalidParameter);
        }
        let mut range = AgpRange::new(pages, caching);
        if let Err(err) = self.platform.reserve_memory(&mut range) {
            klog_error!(
                "agp: reservation of {:#x} pages of type {} failed: {}",
                pages,
                caching,
                err
            );
            return Err(err);
        }
        klog_trace!(
            "agp: reserved {:#x} pages of type {} at {:#x}",
            pages,
            caching,
            range.base
        );
        Ok(self.insert_range(range))
    }

    /// Give a range back. Everything committed in it must be freed first.
    pub fn release(&mut self, handle: MapHandle) -> AgpResult {
        let range = self.range_mut(handle)?;
        if range.committed != 0 {
            klog_warn!(
                "agp: release of range at {:#x} with {:#x} pages still committed",
                range.base,
                range.committed
            );
            return Err(AgpError::InvalidParameter);
        }
        let mut range = range.clone();
        self.platform.release_memory(&mut range)?;

        let slot = &mut self.ranges[handle.index as usize];
        slot.range = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Back every unmapped page of `[offset, offset + count)` with fresh
    /// physical pages. All or nothing: on failure every run mapped by this
    /// call is unmapped and its pages freed.
    ///
    /// Returns the bus address of page `offset` and, when `want_pages` is
    /// set, the pages now mapped across the whole window.
    pub fn commit(
        &mut self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        favored: &FavoredMemory,
        want_pages: bool,
    ) -> AgpResult<(PhysAddr, Option<PageList>)> {
        let range = self.range(handle)?.clone();
        check_bounds(&range, count, offset)?;

        let mut status = Err(AgpError::InsufficientResources);
        let mut bound: Vec<(PageList, u32)> = Vec::new();
        let mut cursor = offset;
        let mut remaining = count;

        while remaining > 0 {
            let run = self.platform.find_free_run(&range, remaining, cursor);
            if run.pages == 0 {
                break;
            }
            remaining -= (run.offset - cursor) + run.pages;
            cursor = run.offset + run.pages;

            match self.bind_run(&range, favored, run.pages, run.offset) {
                Ok(list) => {
                    status = Ok(());
                    bound.push((list, run.offset));
                    self.range_mut(handle)?.committed += run.pages;
                }
                Err(err) => {
                    status = Err(err);
                    break;
                }
            }
        }

        if let Err(err) = status {
            for (list, at) in bound {
                let pages = list.len() as u32;
                if let Err(unmap_err) = self.platform.unmap_memory(&range, pages, at) {
                    klog_error!("agp: unwind unmap at {:#x} failed: {}", at, unmap_err);
                }
                self.range_mut(handle)?.committed -= pages;
                self.pages.free(list);
            }
            klog_debug!(
                "agp: commit of {:#x} pages at {:#x} failed: {}",
                count,
                offset,
                err
            );
            return Err(err);
        }

        let mapped = if want_pages {
            Some(self.platform.get_mapped_pages(&range, count, offset)?)
        } else {
            None
        };
        Ok((range.base.add_pages(offset as u64), mapped))
    }

    /// Allocate, flush and map one run. On failure nothing stays mapped and
    /// the run's pages are back in the source.
    fn bind_run(
        &mut self,
        range: &AgpRange,
        favored: &FavoredMemory,
        pages: u32,
        offset: u32,
    ) -> AgpResult<PageList> {
        let bytes = pages as u64 * PAGE_SIZE;
        let Some(list) = favored.allocate_physical(&mut *self.pages, bytes) else {
            klog_error!("agp: could not allocate pages for {:#x} bytes", bytes);
            return Err(AgpError::InsufficientResources);
        };
        if list.byte_count() < bytes {
            klog_error!(
                "agp: only allocated {:#x} of {:#x} bytes",
                list.byte_count(),
                bytes
            );
            self.pages.free(list);
            return Err(AgpError::InsufficientResources);
        }

        if let Err(err) = self.flush(&list) {
            self.pages.free(list);
            return Err(err);
        }
        match self.platform.map_memory(range, &list, offset) {
            Ok(_) => Ok(list),
            Err(err) => {
                klog_error!(
                    "agp: mapping {:#x} pages at {:#x} failed: {}",
                    pages,
                    offset,
                    err
                );
                self.pages.free(list);
                Err(err)
            }
        }
    }

    fn flush(&mut self, pages: &PageList) -> AgpResult {
        match self.platform.flush_pages(pages) {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(AgpError::InsufficientResources),
            None => {
                self.cache_flush.apply();
                Ok(())
            }
        }
    }

    /// Map caller-owned pages into a window that is entirely unmapped.
    pub fn map(
        &mut self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        pages: &PageList,
    ) -> AgpResult<PhysAddr> {
        let range = self.range(handle)?.clone();
        check_bounds(&range, count, offset)?;
        if pages.len() != count as usize {
            return Err(AgpError::InvalidParameter);
        }

        let max_pfn = self.max_address.as_u64() >> PAGE_SHIFT;
        if let Some(pfn) = pages.pfns().iter().find(|pfn| pfn.as_u64() > max_pfn) {
            klog_warn!(
                "agp: page {:#x} is above the addressable limit {:#x}",
                pfn.to_phys(),
                self.max_address
            );
            return Err(AgpError::InvalidParameter);
        }

        let run = self.platform.find_free_run(&range, count, offset);
        if run.offset != offset || run.pages != count {
            klog_debug!(
                "agp: window {:#x}+{:#x} is not entirely free",
                offset,
                count
            );
            return Err(AgpError::InvalidParameter);
        }

        self.flush(pages)?;
        let addr = self.platform.map_memory(&range, pages, offset)?;
        self.range_mut(handle)?.committed += count;
        Ok(addr)
    }

    /// Unmap caller-owned pages. The window must map exactly `pages`; the
    /// pages themselves are not freed.
    pub fn unmap(
        &mut self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        pages: &PageList,
    ) -> AgpResult {
        let range = self.range(handle)?.clone();
        check_bounds(&range, count, offset)?;

        let mapped = self.platform.get_mapped_pages(&range, count, offset)?;
        if mapped.pfns() != pages.pfns() {
            klog_warn!(
                "agp: unmap at {:#x}+{:#x} does not match the mapped pages",
                offset,
                count
            );
            return Err(AgpError::InvalidParameter);
        }

        self.platform.unmap_memory(&range, count, offset)?;
        self.range_mut(handle)?.committed -= count;
        Ok(())
    }

    /// Unmap committed pages and return them to the page source.
    pub fn free(&mut self, handle: MapHandle, count: u32, offset: u32) -> AgpResult {
        let range = self.range(handle)?.clone();
        check_bounds(&range, count, offset)?;

        let mapped = self.platform.get_mapped_pages(&range, count, offset)?;
        self.platform.unmap_memory(&range, count, offset)?;
        self.pages.free(mapped);
        self.range_mut(handle)?.committed -= count;
        Ok(())
    }

    pub fn get_mapped_pages(&self, handle: MapHandle, count: u32, offset: u32) -> AgpResult<PageList> {
        let range = self.range(handle)?;
        check_bounds(range, count, offset)?;
        self.platform.get_mapped_pages(range, count, offset)
    }

    /// Largest write-combined window the platform will hand out, found by
    /// doubling trial reservations from 2MB. Cached after the first probe.
    pub fn get_agp_size(&mut self) -> AgpResult<ApertureInfo> {
        if let Some(size) = self.agp_size {
            return Ok(size);
        }

        let mut pages = AGP_SIZE_PROBE_START_PAGES;
        let mut largest = None;
        let mut status = Ok(());
        loop {
            let mut trial = AgpRange::new(pages, CachingType::WriteCombined);
            if let Err(err) = self.platform.reserve_memory(&mut trial) {
                status = Err(err);
                break;
            }
            let base = trial.base;
            // Nothing is cached unless every trial went back.
            self.platform.release_memory(&mut trial)?;
            largest = Some(ApertureInfo { base, pages });
            match pages.checked_mul(2) {
                Some(next) => pages = next,
                None => break,
            }
        }

        match largest {
            Some(size) => {
                klog_debug!("agp: usable aperture {:#x}, {:#x} pages", size.base, size.pages);
                self.agp_size = Some(size);
                Ok(size)
            }
            None => status.and(Err(AgpError::InsufficientResources)),
        }
    }
}

/// `[offset, offset + count)` must be a non-empty window inside the range.
fn check_bounds(range: &AgpRange, count: u32, offset: u32) -> AgpResult {
    if count == 0
        || offset >= range.pages
        || offset as u64 + count as u64 > range.pages as u64
    {
        return Err(AgpError::InvalidParameter);
    }
    Ok(())
}

#[cfg(test)]
#[path = "aperture_tests.rs"]
mod tests;
