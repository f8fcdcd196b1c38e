//! Simulated GART chipset.
//!
//! Implements [`AperturePlatform`] the way a uniform AGP3 bridge does: the
//! aperture lives in BAR0 and the extended APSIZE/AGPCTRL registers, and the
//! GART is a flat table of one entry per aperture page. Entries move
//! `Free -> Reserved -> Valid -> Reserved -> Free`.
//!
//! The table is shared with a [`GartProbe`] so tests and diagnostics can
//! inspect it, corrupt it, or make mapping fail on demand.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use agplib_abi::capability::{
    APERTURE_SIZES, AgpCapability, AgpControl, ExtendedRegister, aperture_pages_from_apsize,
    apsize_from_aperture_pages,
};
use agplib_abi::{
    AgpError, AgpResult, BugCheckCode, CachingType, IntegrityViolation, PAGE_SIZE, PhysAddr, Pfn,
};
use agplib_lib::{klog_debug, klog_trace, klog_warn};
use agplib_mm::PageList;
use spin::Mutex;

use crate::config::{get_extended, set_extended};
use crate::device_flags::DeviceFlags;
use crate::pci::ConfigSpace;
use crate::pci_defs::{PCI_ADDRESS_MEMORY_ADDRESS_MASK, PCI_BAR0_OFFSET};
use crate::platform::{
    AGP_CAPABILITIES_MAP_PHYSICAL, AgpRange, AperturePlatform, ApertureInfo, FreeRun, MasterSetup,
};
use crate::resource::{IoResourceDescriptor, IoResourceOption};
use crate::verifier::VerifierFlags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GartEntry {
    Free,
    Reserved(CachingType),
    Valid(CachingType, Pfn),
}

impl GartEntry {
    /// Raw PTE image: frame in the upper bits, caching type and valid bit
    /// below.
    pub fn encode(self) -> u64 {
        match self {
            Self::Free => 0,
            Self::Reserved(caching) => (caching as u64) << 1,
            Self::Valid(caching, pfn) => (pfn.as_u64() << 12) | ((caching as u64) << 1) | 1,
        }
    }
}

#[derive(Default)]
struct GartTable {
    entries: Vec<GartEntry>,
    /// Copy kept while corruption checking is on, compared by the worker.
    shadow: Option<Vec<GartEntry>>,
    /// Successful `map_memory` calls left before the next one fails.
    fail_map_after: Option<usize>,
    special: DeviceFlags,
    tlb_flushes: u64,
}

impl GartTable {
    fn set(&mut self, index: usize, entry: GartEntry) {
        self.entries[index] = entry;
        if let Some(shadow) = self.shadow.as_mut() {
            shadow[index] = entry;
        }
    }

    /// First-fit search for `len` free entries. Backward searches return the
    /// lowest index of the first run found from the top.
    fn find_free(&self, len: usize, backward: bool) -> Option<usize> {
        let total = self.entries.len();
        if len == 0 || len > total {
            return None;
        }
        let mut found = 0;
        for step in 0..total {
            let index = if backward { total - 1 - step } else { step };
            if self.entries[index] == GartEntry::Free {
                found += 1;
                if found == len {
                    return Some(if backward { index } else { index + 1 - len });
                }
            } else {
                found = 0;
            }
        }
        None
    }
}

/// Shared view of a [`GartChipset`]'s table.
#[derive(Clone)]
pub struct GartProbe(Arc<Mutex<GartTable>>);

impl GartProbe {
    pub fn len(&self) -> usize {
        self.0.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, index: usize) -> Option<GartEntry> {
        self.0.lock().entries.get(index).copied()
    }

    /// Number of entries currently mapping a page.
    pub fn valid_entries(&self) -> usize {
        self.0
            .lock()
            .entries
            .iter()
            .filter(|e| matches!(e, GartEntry::Valid(..)))
            .count()
    }

    /// Overwrite a live entry behind the driver's back.
    pub fn corrupt(&self, index: usize, entry: GartEntry) {
        if let Some(slot) = self.0.lock().entries.get_mut(index) {
            *slot = entry;
        }
    }

    /// Let `count` more maps succeed, then fail every one after.
    pub fn fail_map_after(&self, count: Option<usize>) {
        self.0.lock().fail_map_after = count;
    }

    pub fn special_flags(&self) -> DeviceFlags {
        self.0.lock().special
    }

    pub fn tlb_flushes(&self) -> u64 {
        self.0.lock().tlb_flushes
    }

    pub fn has_shadow(&self) -> bool {
        self.0.lock().shadow.is_some()
    }
}

pub struct GartChipset {
    config: Arc<dyn ConfigSpace>,
    table: Arc<Mutex<GartTable>>,
    aperture: Option<ApertureInfo>,
    coherent: bool,
    /// The aperture has been enabled by a first map.
    global_enable: bool,
    verification: VerifierFlags,
    memory_ranges: Option<Vec<u8>>,
}

impl GartChipset {
    pub fn new(config: Arc<dyn ConfigSpace>) -> Self {
        Self {
            config,
            table: Arc::new(Mutex::new(GartTable::default())),
            aperture: None,
            coherent: false,
            global_enable: false,
            verification: VerifierFlags::empty(),
            memory_ranges: None,
        }
    }

    /// Accept hardware-coherent reservations.
    pub fn with_coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    /// Raw memory-range table reported to the favored allocator.
    pub fn with_memory_ranges(mut self, table: Vec<u8>) -> Self {
        self.memory_ranges = Some(table);
        self
    }

    pub fn probe(&self) -> GartProbe {
        GartProbe(self.table.clone())
    }

    fn control(&self) -> AgpResult<AgpControl> {
        Ok(AgpControl::from_bits_retain(get_extended(
            &*self.config,
            ExtendedRegister::AgpControl,
        )?))
    }

    fn set_control(&self, control: AgpControl) -> AgpResult {
        set_extended(&*self.config, ExtendedRegister::AgpControl, control.bits())
    }

    fn set_tlb(&self, enable: bool) -> AgpResult {
        let mut control = self.control()?;
        control.set(AgpControl::GTLB_ENABLE, enable);
        if !enable {
            self.table.lock().tlb_flushes += 1;
        }
        self.set_control(control)
    }

    fn reserved_state(caching: CachingType) -> Option<GartEntry> {
        match caching {
            CachingType::NonCached | CachingType::WriteCombined | CachingType::HardwareCoherentCached => {
                Some(GartEntry::Reserved(caching))
            }
            CachingType::Cached => None,
        }
    }

    /// Table index of page `offset` of `range`, checking the window fits.
    fn window(range: &AgpRange, pages: u32, offset: u32) -> AgpResult<core::ops::Range<usize>> {
        if pages == 0 || offset as u64 + pages as u64 > range.pages as u64 {
            return Err(AgpError::InvalidParameter);
        }
        let start = range.context + offset as usize;
        Ok(start..start + pages as usize)
    }
}

impl AperturePlatform for GartChipset {
    fn query_aperture(&mut self) -> AgpResult<ApertureInfo> {
        let base = self.config.read_u32(PCI_BAR0_OFFSET)? as u64 & PCI_ADDRESS_MEMORY_ADDRESS_MASK;
        let apsize = get_extended(&*self.config, ExtendedRegister::ApertureSize)? as u16;
        let Some(pages) = aperture_pages_from_apsize(apsize) else {
            klog_warn!("agp: unexpected APSIZE {:#x}", apsize);
            self.aperture = None;
            return Err(AgpError::Unsuccessful);
        };
        let info = ApertureInfo {
            base: PhysAddr::new(base),
            pages,
        };
        self.aperture = Some(info);
        Ok(info)
    }

    fn aperture_requirements(&mut self) -> AgpResult<Vec<IoResourceDescriptor>> {
        let current = match self.aperture {
            Some(info) => info,
            None => self.query_aperture()?,
        };
        // Same size as the BIOS picked, or smaller.
        Ok(APERTURE_SIZES
            .iter()
            .filter(|(_, pages)| *pages <= current.pages)
            .map(|(_, pages)| {
                IoResourceDescriptor::aperture_memory(
                    IoResourceOption::ALTERNATIVE,
                    PhysAddr::NULL,
                    PhysAddr::MAX_32BIT,
                    (*pages as u64 * PAGE_SIZE) as u32,
                )
            })
            .collect())
    }

    fn set_aperture(&mut self, base: PhysAddr, pages: u32) -> AgpResult {
        let Some(apsize) = apsize_from_aperture_pages(pages) else {
            klog_warn!("agp: invalid aperture size {:#x} pages at {:#x}", pages, base);
            return Err(AgpError::InvalidParameter);
        };
        if !base.is_aligned(pages as u64 * PAGE_SIZE) {
            klog_warn!("agp: aperture base {:#x} not aligned to its size", base);
            return Err(AgpError::InvalidParameter);
        }
        {
            let mut table = self.table.lock();
            if !table.entries.is_empty() && table.entries.len() != pages as usize {
                if table.entries.iter().any(|e| *e != GartEntry::Free) {
                    return Err(AgpError::DeviceBusy);
                }
                table.entries.clear();
                table.shadow = None;
            }
        }

        let mut control = self.control()?;
        if control.contains(AgpControl::APERTURE_ENABLE) {
            control.remove(AgpControl::APERTURE_ENABLE);
            self.set_control(control)?;
        }

        // APSIZE first, it decides which APBASE bits are writable.
        set_extended(&*self.config, ExtendedRegister::ApertureSize, apsize as u32)?;
        self.config.write_u32(
            PCI_BAR0_OFFSET,
            (base.as_u64() & PCI_ADDRESS_MEMORY_ADDRESS_MASK) as u32,
        )?;

        if self.global_enable {
            control.insert(AgpControl::APERTURE_ENABLE);
            self.set_control(control)?;
        }
        self.aperture = Some(ApertureInfo { base, pages });
        klog_debug!("agp: aperture set to {:#x}, {} pages", base, pages);
        self.set_tlb(true)
    }

    fn disable_aperture(&mut self) {
        let disabled = self.control().and_then(|mut control| {
            control.remove(AgpControl::APERTURE_ENABLE);
            self.set_control(control)
        });
        // The table goes regardless; the bridge is on its way out.
        if let Err(err) = disabled {
            klog_warn!("agp: aperture left enabled: {}", err);
        }
        self.global_enable = false;
        let mut table = self.table.lock();
        table.entries.clear();
        if let Some(shadow) = table.shadow.as_mut() {
            shadow.clear();
        }
    }

    fn initialize_target(&mut self) -> AgpResult {
        self.query_aperture()?;
        let mut control = self.control()?;
        control.remove(AgpControl::APERTURE_ENABLE | AgpControl::GTLB_ENABLE);
        self.set_control(control)?;
        self.global_enable = false;
        Ok(())
    }

    fn initialize_master(
        &mut self,
        target: &AgpCapability,
        master: &AgpCapability,
    ) -> AgpResult<MasterSetup> {
        let common = target.status.rate() & master.status.rate();
        if common == 0 {
            klog_warn!("agp: bridge and adapter share no transfer rate");
            return Err(AgpError::InvalidParameter);
        }
        // Highest common rate bit.
        let rate = 1 << (31 - common.leading_zeros());
        let sba = target.status.side_band_addressing() & master.status.side_band_addressing();
        let fw = target.status.fast_write() & master.status.fast_write();

        let mut command = target.command;
        command.set_rate(rate);
        command.set_sba_enable(sba);
        command.set_fast_write_enable(fw);
        command.set_request_queue_depth(target.status.request_queue_depth_max());
        command.set_agp_enable(1);

        let mut target_out = *target;
        target_out.command = command;
        let mut master_out = *master;
        master_out.command = command;
        klog_debug!("agp: rate {:#x}, sba {}, fw {}", rate, sba, fw);
        Ok(MasterSetup {
            target: target_out,
            master: master_out,
            capabilities: AGP_CAPABILITIES_MAP_PHYSICAL,
        })
    }

    fn reserve_memory(&mut self, range: &mut AgpRange) -> AgpResult {
        let aperture = self.aperture.ok_or(AgpError::NoAperture)?;
        if range.pages == 0 {
            return Err(AgpError::InvalidParameter);
        }
        if range.pages > aperture.pages {
            return Err(AgpError::InsufficientResources);
        }

        let mut table = self.table.lock();
        if table.entries.is_empty() {
            table.entries = vec![GartEntry::Free; aperture.pages as usize];
            if self.verification.contains(VerifierFlags::GART_CORRUPTION) {
                table.shadow = Some(table.entries.clone());
            }
        }

        let backward = range.caching == CachingType::NonCached;
        let Some(index) = table.find_free(range.pages as usize, backward) else {
            klog_debug!(
                "agp: no run of {} free entries for {}",
                range.pages,
                range.caching
            );
            return Err(AgpError::InsufficientResources);
        };

        let state = match range.caching {
            CachingType::HardwareCoherentCached if !self.coherent => {
                return Err(AgpError::NotSupported);
            }
            caching => Self::reserved_state(caching).ok_or(AgpError::InvalidParameter)?,
        };
        for i in index..index + range.pages as usize {
            table.set(i, state);
        }

        range.base = aperture.base.add_pages(index as u64);
        range.context = index;
        klog_trace!("agp: reserved {} entries at {}", range.pages, index);
        Ok(())
    }

    fn release_memory(&mut self, range: &mut AgpRange) -> AgpResult {
        let mut table = self.table.lock();
        let end = range.context + range.pages as usize;
        if end > table.entries.len() {
            return Err(AgpError::InvalidParameter);
        }
        for i in range.context..end {
            table.set(i, GartEntry::Free);
        }
        range.base = PhysAddr::NULL;
        Ok(())
    }

    fn find_free_run(&self, range: &AgpRange, pages: u32, offset: u32) -> FreeRun {
        let Ok(window) = Self::window(range, pages, offset) else {
            return FreeRun::default();
        };
        let table = self.table.lock();
        let Some(entries) = table.entries.get(window) else {
            return FreeRun::default();
        };
        let reserved = |e: &GartEntry| matches!(e, GartEntry::Reserved(_));
        match entries.iter().position(reserved) {
            Some(first) => FreeRun {
                offset: offset + first as u32,
                pages: entries[first..].iter().take_while(|e| reserved(e)).count() as u32,
            },
            None => FreeRun::default(),
        }
    }

    fn map_memory(&mut self, range: &AgpRange, pages: &PageList, offset: u32) -> AgpResult<PhysAddr> {
        let window = Self::window(range, pages.len() as u32, offset)?;
        let reserved = Self::reserved_state(range.caching).ok_or(AgpError::InvalidParameter)?;
        {
            let mut table = self.table.lock();
            let entries = table.entries.get(window.clone()).ok_or(AgpError::InvalidParameter)?;
            if entries.iter().any(|e| *e != reserved) {
                return Err(AgpError::InvalidParameter);
            }
            match table.fail_map_after {
                Some(0) => return Err(AgpError::Unsuccessful),
                Some(n) => table.fail_map_after = Some(n - 1),
                None => {}
            }
        }

        self.set_tlb(false)?;
        {
            let mut table = self.table.lock();
            for (i, pfn) in window.zip(pages.pfns()) {
                table.set(i, GartEntry::Valid(range.caching, *pfn));
            }
        }
        self.set_tlb(true)?;

        if !self.global_enable {
            let mut control = self.control()?;
            control.insert(AgpControl::APERTURE_ENABLE);
            self.set_control(control)?;
            self.global_enable = true;
        }
        Ok(range.base.add_pages(offset as u64))
    }

    fn unmap_memory(&mut self, range: &AgpRange, pages: u32, offset: u32) -> AgpResult {
        let window = Self::window(range, pages, offset)?;
        let reserved = Self::reserved_state(range.caching).ok_or(AgpError::InvalidParameter)?;
        self.set_tlb(false)?;
        {
            let mut table = self.table.lock();
            if window.end > table.entries.len() {
                return Err(AgpError::InvalidParameter);
            }
            for i in window {
                if matches!(table.entries[i], GartEntry::Valid(..)) {
                    table.set(i, reserved);
                }
            }
        }
        self.set_tlb(true)
    }

    fn get_mapped_pages(&self, range: &AgpRange, pages: u32, offset: u32) -> AgpResult<PageList> {
        let window = Self::window(range, pages, offset)?;
        let table = self.table.lock();
        let entries = table.entries.get(window).ok_or(AgpError::InvalidParameter)?;
        let mut list = PageList::new();
        for entry in entries {
            match entry {
                GartEntry::Valid(_, pfn) => list.push(*pfn),
                _ => return Err(AgpError::InvalidParameter),
            }
        }
        Ok(list)
    }

    fn special_target(&mut self, flags: DeviceFlags) -> AgpResult {
        klog_debug!("agp: special target {:#x}", flags.bits());
        self.table.lock().special |= flags;
        Ok(())
    }

    fn update_verification(&mut self, flags: VerifierFlags) {
        self.verification = flags;
        let mut table = self.table.lock();
        table.shadow = if flags.contains(VerifierFlags::GART_CORRUPTION) {
            Some(table.entries.clone())
        } else {
            None
        };
    }

    fn verifier_worker(&mut self) -> Option<IntegrityViolation> {
        let table = self.table.lock();
        let shadow = table.shadow.as_ref()?;
        table
            .entries
            .iter()
            .zip(shadow)
            .position(|(live, cached)| live != cached)
            .map(|index| {
                IntegrityViolation::new(
                    BugCheckCode::AgpGartCorruption,
                    index as u64,
                    table.entries[index].encode(),
                )
            })
    }

    fn memory_range_table(&self) -> Option<Vec<u8>> {
        self.memory_ranges.clone()
    }
}

#[cfg(test)]
#[path = "gart_tests.rs"]
mod tests;
