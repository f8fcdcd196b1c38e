//! Chipset-specific operations the library is built on.
//!
//! One implementation per chipset family. The library owns range
//! bookkeeping, physical allocation and locking; the platform owns the
//! aperture registers and the GART itself. Every method is called with the
//! target lock held.

use alloc::vec::Vec;

use agplib_abi::capability::AgpCapability;
use agplib_abi::{AgpError, AgpResult, CachingType, IntegrityViolation, PAGE_SIZE, PhysAddr};
use agplib_mm::PageList;

use crate::device_flags::DeviceFlags;
use crate::resource::IoResourceDescriptor;
use crate::verifier::VerifierFlags;

/// The aperture window as programmed in the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApertureInfo {
    pub base: PhysAddr,
    pub pages: u32,
}

impl ApertureInfo {
    pub const fn len_bytes(&self) -> u32 {
        (self.pages as u64 * PAGE_SIZE) as u32
    }

    pub const fn last_byte(&self) -> PhysAddr {
        PhysAddr(self.base.0 + self.len_bytes() as u64 - 1)
    }

    pub const fn contains(&self, addr: PhysAddr) -> bool {
        addr.0 >= self.base.0 && addr.0 - self.base.0 < self.len_bytes() as u64
    }
}

/// A reservation inside the aperture.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgpRange {
    pub pages: u32,
    pub caching: CachingType,
    pub committed: u32,
    /// Bus address of the first page, filled in by `reserve_memory`.
    pub base: PhysAddr,
    /// Platform cookie, filled in by `reserve_memory`.
    pub context: usize,
}

impl AgpRange {
    pub const fn new(pages: u32, caching: CachingType) -> Self {
        Self {
            pages,
            caching,
            committed: 0,
            base: PhysAddr::NULL,
            context: 0,
        }
    }
}

/// A run of reserved, unmapped pages inside a range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeRun {
    pub offset: u32,
    pub pages: u32,
}

/// Command values chosen for the bridge and the adapter when the master
/// starts. The library writes them; the target's goes through the
/// verifier-aware path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterSetup {
    pub target: AgpCapability,
    pub master: AgpCapability,
    /// `AGP_CAPABILITIES_*` bits reported to the master.
    pub capabilities: u32,
}

/// The master may map caller-supplied pages.
pub const AGP_CAPABILITIES_MAP_PHYSICAL: u32 = 0x0000_0001;

pub trait AperturePlatform: Send {
    /// Read the aperture currently programmed in the bridge.
    fn query_aperture(&mut self) -> AgpResult<ApertureInfo>;

    /// Windows the bridge could be moved to, largest first.
    fn aperture_requirements(&mut self) -> AgpResult<Vec<IoResourceDescriptor>>;

    fn set_aperture(&mut self, base: PhysAddr, pages: u32) -> AgpResult;

    /// Turn the aperture off, on stop or remove.
    fn disable_aperture(&mut self) {}

    fn initialize_target(&mut self) -> AgpResult;

    /// Pick the command values for bridge and adapter from their quirk
    /// adjusted capabilities.
    fn initialize_master(
        &mut self,
        target: &AgpCapability,
        master: &AgpCapability,
    ) -> AgpResult<MasterSetup>;

    /// Carve `range.pages` entries out of the GART and fill in `base` and
    /// `context`.
    fn reserve_memory(&mut self, range: &mut AgpRange) -> AgpResult;

    /// Give back the entries of a range with nothing mapped.
    fn release_memory(&mut self, range: &mut AgpRange) -> AgpResult;

    /// First run of unmapped pages inside `[offset, offset + pages)`. A run
    /// of length zero means there is none.
    fn find_free_run(&self, range: &AgpRange, pages: u32, offset: u32) -> FreeRun;

    /// Map `pages` at page `offset` of the range and return the bus address.
    fn map_memory(&mut self, range: &AgpRange, pages: &PageList, offset: u32) -> AgpResult<PhysAddr>;

    fn unmap_memory(&mut self, range: &AgpRange, pages: u32, offset: u32) -> AgpResult;

    /// Pages currently mapped at `[offset, offset + pages)`.
    fn get_mapped_pages(&self, range: &AgpRange, pages: u32, offset: u32) -> AgpResult<PageList>;

    /// Chipset-specific cache flush. `None` uses the library default.
    fn flush_pages(&mut self, _pages: &PageList) -> Option<AgpResult> {
        None
    }

    /// Chipset-specific programming requested by quirk bits or `set_rate`.
    fn special_target(&mut self, _flags: DeviceFlags) -> AgpResult {
        Err(AgpError::NotSupported)
    }

    /// Verifier modes were switched; the platform keeps whatever shadow
    /// state its worker needs.
    fn update_verification(&mut self, _flags: VerifierFlags) {}

    /// Expensive platform check, run every few verifier ticks.
    fn verifier_worker(&mut self) -> Option<IntegrityViolation> {
        None
    }

    /// Raw memory-range table for the favored allocator.
    fn memory_range_table(&self) -> Option<Vec<u8>> {
        None
    }
}
