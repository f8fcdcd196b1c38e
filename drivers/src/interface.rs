//! Bus interface vended to the display driver.
//!
//! Each handle holds a reference on its master for as long as it lives.
//! Operations newer than the negotiated version fail with `NotSupported`.

use alloc::sync::Arc;

use agplib_abi::{AgpError, AgpResult, CachingType, PhysAddr};
use agplib_mm::PageList;

use crate::aperture::MapHandle;
use crate::master::MasterContext;
use crate::platform::ApertureInfo;

/// Caller structure sizes on a 64-bit host: a common header, then one
/// pointer per operation.
pub const AGP_BUS_INTERFACE_V1_SIZE: usize = 80;
pub const AGP_BUS_INTERFACE_V2_SIZE: usize = 88;
pub const AGP_BUS_INTERFACE_V3_SIZE: usize = 112;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterfaceVersion {
    /// Reserve, release, commit, free, mapped pages.
    V1 = 1,
    /// Adds `set_rate`.
    V2 = 2,
    /// Adds caller-page map/unmap and `get_agp_size`.
    V3 = 3,
}

impl InterfaceVersion {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    pub const fn required_size(self) -> usize {
        match self {
            Self::V1 => AGP_BUS_INTERFACE_V1_SIZE,
            Self::V2 => AGP_BUS_INTERFACE_V2_SIZE,
            Self::V3 => AGP_BUS_INTERFACE_V3_SIZE,
        }
    }
}

pub struct AgpBusInterface {
    master: Arc<MasterContext>,
    version: InterfaceVersion,
}

impl AgpBusInterface {
    pub(crate) fn new(master: Arc<MasterContext>, version: InterfaceVersion) -> Self {
        master.reference();
        Self { master, version }
    }

    pub fn version(&self) -> InterfaceVersion {
        self.version
    }

    /// `AGP_CAPABILITIES_*` of the link.
    pub fn capabilities(&self) -> u32 {
        self.master.capabilities()
    }

    fn require(&self, version: InterfaceVersion) -> AgpResult {
        if self.version < version {
            return Err(AgpError::NotSupported);
        }
        Ok(())
    }

    /// Reserve `pages` of aperture. Returns the handle and the bus address
    /// of the first page.
    pub fn reserve_memory(&self, pages: u32, caching: CachingType) -> AgpResult<(MapHandle, PhysAddr)> {
        let target = self.master.target();
        let mut state = target.lock();
        let handle = state.reserve(pages, caching)?;
        let base = state.range(handle)?.base;
        self.master.add_reserved(pages);
        Ok((handle, base))
    }

    pub fn release_memory(&self, handle: MapHandle) -> AgpResult {
        let target = self.master.target();
        let mut state = target.lock();
        let pages = state.range(handle)?.pages;
        state.release(handle)?;
        self.master.sub_reserved(pages);
        Ok(())
    }

    /// Back `[offset, offset + count)` with fresh pages. With `want_pages`
    /// the pages mapped across the whole window come back too.
    pub fn commit_memory(
        &self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        want_pages: bool,
    ) -> AgpResult<(PhysAddr, Option<PageList>)> {
        let target = self.master.target();
        target
            .lock()
            .commit(handle, count, offset, target.favored(), want_pages)
    }

    pub fn free_memory(&self, handle: MapHandle, count: u32, offset: u32) -> AgpResult {
        self.master.target().lock().free(handle, count, offset)
    }

    pub fn get_mapped_pages(&self, handle: MapHandle, count: u32, offset: u32) -> AgpResult<PageList> {
        self.master
            .target()
            .lock()
            .get_mapped_pages(handle, count, offset)
    }

    pub fn set_rate(&self, rate: u32) -> AgpResult {
        self.require(InterfaceVersion::V2)?;
        self.master.set_rate(rate)
    }

    pub fn map_memory(
        &self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        pages: &PageList,
    ) -> AgpResult<PhysAddr> {
        self.require(InterfaceVersion::V3)?;
        self.master.target().lock().map(handle, count, offset, pages)
    }

    pub fn unmap_memory(
        &self,
        handle: MapHandle,
        count: u32,
        offset: u32,
        pages: &PageList,
    ) -> AgpResult {
        self.require(InterfaceVersion::V3)?;
        self.master.target().lock().unmap(handle, count, offset, pages)
    }

    /// Effective base and size of AGP memory.
    pub fn get_agp_size(&self) -> AgpResult<ApertureInfo> {
        self.require(InterfaceVersion::V3)?;
        self.master.target().lock().get_agp_size()
    }
}

impl Drop for AgpBusInterface {
    fn drop(&mut self) {
        self.master.dereference();
    }
}

#[cfg(test)]
#[path = "interface_tests.rs"]
mod tests;
