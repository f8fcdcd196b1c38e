//! Simulated bridge, adapter and memory shared by the driver tests.

use alloc::boxed::Box;
use alloc::sync::Arc;

use agplib_abi::capability::{
    AGP_STATUS_OFFSET, ExtendedRegister, PCI_CAPABILITY_ID_AGP, PCI_CAPABILITY_ID_AGP_TARGET,
};
use agplib_abi::{PAGE_SIZE, PhysAddr};
use agplib_lib::CacheFlush;
use agplib_mm::{FramePool, PageList, PhysicalPageSource};
use spin::Mutex;

use crate::aperture::GartState;
use crate::gart::{GartChipset, GartProbe};
use crate::globals::AgpGlobals;
use crate::master::MasterContext;
use crate::pci::{ConfigImage, SharedConfig};
use crate::pci_defs::{PCI_BAR0_OFFSET, PCI_CLASS_BRIDGE, PCI_CLASS_DISPLAY};
use crate::settings::AgpSettings;
use crate::target::TargetContext;
use crate::verifier::{IntegrityPolicy, NullTimer};

pub const BRIDGE_CAP: u8 = 0xA0;
pub const ADAPTER_CAP: u8 = 0x60;
pub const APERTURE_BASE: u64 = 0xE000_0000;
/// APSIZE encoding of a 4MB aperture.
pub const APSIZE_4MB: u16 = 0xF3F;
pub const APERTURE_PAGES: u32 = 1024;

/// Status of an AGP3 bridge: 4X and 8X, SBA, fast writes, queue depth 32.
pub const AGP3_STATUS: u32 = 0x1F00_020B | (1 << 4);
/// Status of an AGP2 device: 1X/2X/4X, SBA, fast writes, queue depth 16.
pub const AGP2_STATUS: u32 = 0x0F00_0207 | (1 << 4);

/// Capability body (after ID and next) with room for the extended registers.
fn capability_body(status: u32, apsize: u16) -> [u8; 34] {
    let mut body = [0u8; 34];
    body[0] = 0x30;
    let status_at = AGP_STATUS_OFFSET as usize - 2;
    body[status_at..status_at + 4].copy_from_slice(&status.to_le_bytes());
    let apsize_at = ExtendedRegister::ApertureSize.offset() as usize - 2;
    body[apsize_at..apsize_at + 2].copy_from_slice(&apsize.to_le_bytes());
    body
}

/// An AGP3 bridge with a 4MB aperture at [`APERTURE_BASE`].
pub fn agp3_bridge() -> ConfigImage {
    bridge(PCI_CAPABILITY_ID_AGP_TARGET, AGP3_STATUS)
}

/// A classic host bridge with the same aperture.
pub fn host_bridge() -> ConfigImage {
    bridge(PCI_CAPABILITY_ID_AGP, AGP2_STATUS)
}

fn bridge(cap_id: u8, status: u32) -> ConfigImage {
    let mut image = ConfigImage::new(0x8086, 0x2570);
    image
        .set_class(PCI_CLASS_BRIDGE, 0x00)
        .set_revision(0x02)
        .add_capability(BRIDGE_CAP, cap_id, &capability_body(status, APSIZE_4MB));
    image.poke_u32(PCI_BAR0_OFFSET, APERTURE_BASE as u32 | 0x8);
    image
}

/// A graphics adapter with the given AGP status.
pub fn adapter(status: u32) -> ConfigImage {
    let mut image = ConfigImage::new(0x10DE, 0x0110);
    image
        .set_class(PCI_CLASS_DISPLAY, 0x00)
        .add_capability(ADAPTER_CAP, PCI_CAPABILITY_ID_AGP, &capability_body(status, 0)[..10]);
    image
}

/// A [`FramePool`] the test keeps a handle on.
#[derive(Clone)]
pub struct SharedPool(pub Arc<Mutex<FramePool>>);

impl SharedPool {
    /// `frames` frames starting at 16MB.
    pub fn new(frames: usize) -> Self {
        Self(Arc::new(Mutex::new(FramePool::for_range(
            PhysAddr(0x0100_0000),
            frames as u64 * PAGE_SIZE,
        ))))
    }

    pub fn allocated(&self) -> usize {
        self.0.lock().allocated_frames()
    }

    pub fn set_budget(&self, frames: Option<usize>) {
        self.0.lock().set_budget(frames);
    }
}

impl PhysicalPageSource for SharedPool {
    fn allocate_in(&mut self, min: PhysAddr, max: PhysAddr, bytes: u64) -> Option<PageList> {
        self.0.lock().allocate_in(min, max, bytes)
    }

    fn free(&mut self, pages: PageList) {
        self.0.lock().free(pages);
    }
}

/// Settings for host tests: no cache flush, findings reported not fatal.
pub fn test_settings() -> AgpSettings {
    AgpSettings {
        policy: IntegrityPolicy::ReportAndContinue,
        cache_flush: CacheFlush::None,
        ..AgpSettings::default()
    }
}

/// A target attached to a simulated bridge.
pub struct Rig {
    pub bridge: SharedConfig,
    pub gart: GartProbe,
    pub pool: SharedPool,
    pub target: Arc<TargetContext>,
}

impl Rig {
    pub fn new() -> Self {
        Self::build(agp3_bridge(), test_settings(), 256)
    }

    pub fn build(image: ConfigImage, settings: AgpSettings, frames: usize) -> Self {
        let bridge = SharedConfig::new(image);
        let chipset = GartChipset::new(Arc::new(bridge.clone()));
        let gart = chipset.probe();
        let pool = SharedPool::new(frames);
        let target = TargetContext::attach(
            Arc::new(AgpGlobals::new(settings)),
            Arc::new(bridge.clone()),
            Box::new(chipset),
            Box::new(pool.clone()),
            Box::new(NullTimer),
        )
        .expect("attach target");
        Self {
            bridge,
            gart,
            pool,
            target,
        }
    }

    /// Attach an adapter below the bridge.
    pub fn master(&self, status: u32) -> (Arc<MasterContext>, SharedConfig) {
        let config = SharedConfig::new(adapter(status));
        let master =
            MasterContext::attach(&self.target, Arc::new(config.clone())).expect("attach master");
        (master, config)
    }

    /// Pages bound in the GART must equal the pages committed in ranges.
    pub fn assert_conserved(&self, state: &GartState) {
        assert_eq!(self.gart.valid_entries() as u64, state.committed_pages());
    }
}
