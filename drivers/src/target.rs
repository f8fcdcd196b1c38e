//! Target (AGP bridge) context.
//!
//! One per bridge. Owns the [`GartState`] lock that serializes the public
//! memory interface with the verifier, the favored-range list built at
//! attach, and the resource strategy picked from the capability ID.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};

use agplib_abi::capability::{AgpCapability, PCI_CAPABILITY_ID_AGP_TARGET};
use agplib_abi::{AgpError, AgpResult, PhysAddr};
use agplib_lib::{klog_debug, klog_info, klog_warn};
use agplib_mm::{FavoredMemory, PageList, PhysicalPageSource};
use spin::{Mutex, MutexGuard};

use crate::aperture::GartState;
use crate::config::{CapabilityReadout, device_identity, find_agp_capability, get_capability};
use crate::device_flags::DeviceIdentity;
use crate::globals::AgpGlobals;
use crate::master::MasterContext;
use crate::pci::ConfigSpace;
use crate::platform::{AperturePlatform, ApertureInfo};
use crate::resource::{
    CmResourceList, IoResourceRequirementsList, StartDisposition, agp3_filter_requirements,
    agp3_start, host_filter_requirements, host_start,
};
use crate::verifier::{TickReport, VerifierContext, VerifierFlags, VerifierTimer};

/// Resource strategy, fixed at attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Classic host bridge; the aperture is not a BAR the OS knows about.
    HostBridge,
    /// AGP3 target; the aperture is a regular BAR.
    Agp3Bridge,
}

/// System power states the verifier cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemPower {
    Working,
    Sleeping,
}

pub struct TargetContext {
    kind: TargetKind,
    globals: Arc<AgpGlobals>,
    identity: DeviceIdentity,
    favored: FavoredMemory,
    /// Assigned-list index of the aperture BAR, AGP3 only.
    resource_index: Mutex<Option<usize>>,
    state: Mutex<GartState>,
    master: Mutex<Weak<MasterContext>>,
}

impl TargetContext {
    /// Attach to a bridge. Fails with `NotImplemented` when the device has
    /// no AGP capability.
    pub fn attach(
        globals: Arc<AgpGlobals>,
        config: Arc<dyn ConfigSpace>,
        mut platform: Box<dyn AperturePlatform>,
        pages: Box<dyn PhysicalPageSource>,
        timer: Box<dyn VerifierTimer>,
    ) -> AgpResult<Arc<Self>> {
        let (offset, header) = find_agp_capability(&*config)?;
        let kind = if config.read_u8(offset)? == PCI_CAPABILITY_ID_AGP_TARGET {
            TargetKind::Agp3Bridge
        } else {
            TargetKind::HostBridge
        };
        let identity = device_identity(&header);

        platform.initialize_target()?;

        let settings = globals.settings();
        let favored = match platform.memory_range_table() {
            Some(raw) => FavoredMemory::from_table(&raw, settings.max_address),
            None => FavoredMemory::empty(settings.max_address),
        };

        let verifier = VerifierContext::new(settings.policy, timer);
        let mut state = GartState::new(
            platform,
            pages,
            config,
            verifier,
            settings.cache_flush,
            settings.max_address,
        );
        if let Err(err) = state.refresh_aperture() {
            klog_warn!("agp: could not read the current aperture: {}", err);
        }
        if !settings.verifier.is_empty() {
            if let Err(err) = state.set_verifier_flags(settings.verifier) {
                klog_warn!("agp: verifier not armed: {}", err);
            }
        }

        klog_info!(
            "agp: target {:04x}:{:04x} attached as {:?}, {} favored ranges",
            identity.vendor,
            identity.device,
            kind,
            favored.num_ranges()
        );
        Ok(Arc::new(Self {
            kind,
            globals,
            identity,
            favored,
            resource_index: Mutex::new(None),
            state: Mutex::new(state),
            master: Mutex::new(Weak::new()),
        }))
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn globals(&self) -> &Arc<AgpGlobals> {
        &self.globals
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn favored(&self) -> &FavoredMemory {
        &self.favored
    }

    /// The target lock.
    pub fn lock(&self) -> MutexGuard<'_, GartState> {
        self.state.lock()
    }

    pub fn aperture(&self) -> Option<ApertureInfo> {
        self.state.lock().aperture()
    }

    pub fn resource_index(&self) -> Option<usize> {
        *self.resource_index.lock()
    }

    // =========================================================================
    // Master slot
    // =========================================================================

    pub fn master(&self) -> Option<Arc<MasterContext>> {
        self.master.lock().upgrade()
    }

    /// Claim the master slot. A bridge has at most one live master.
    pub(crate) fn bind_master(&self, master: &Arc<MasterContext>) -> AgpResult {
        let mut slot = self.master.lock();
        if slot.upgrade().is_some() {
            klog_warn!("agp: target already has a master");
            return Err(AgpError::DeviceBusy);
        }
        *slot = Arc::downgrade(master);
        Ok(())
    }

    // =========================================================================
    // Capability
    // =========================================================================

    pub fn capability(&self) -> AgpResult<CapabilityReadout> {
        let state = self.state.lock();
        get_capability(state.config(), &self.globals)
    }

    pub fn set_capability(&self, capability: &AgpCapability) -> AgpResult {
        self.state.lock().set_target_capability(capability)
    }

    // =========================================================================
    // Resource negotiation
    // =========================================================================

    /// Splice the aperture into the requirements on their way up.
    pub fn filter_requirements(&self, list: &mut IoResourceRequirementsList) -> AgpResult {
        let mut state = self.state.lock();
        let aperture = state.refresh_aperture().ok().filter(|a| !a.base.is_null());
        let requirements = state.platform_mut().aperture_requirements()?;
        match self.kind {
            TargetKind::HostBridge => {
                host_filter_requirements(list, aperture, &requirements);
                Ok(())
            }
            TargetKind::Agp3Bridge => {
                let index = agp3_filter_requirements(list, aperture, &requirements)?;
                *self.resource_index.lock() = Some(index);
                Ok(())
            }
        }
    }

    /// Program the aperture the OS assigned and decide what goes down.
    pub fn start(&self, resources: CmResourceList) -> StartDisposition {
        let mut state = self.state.lock();
        let set_aperture = |base: PhysAddr, pages: u32| state.program_aperture(base, pages);
        match self.kind {
            TargetKind::HostBridge => host_start(resources, set_aperture),
            TargetKind::Agp3Bridge => match *self.resource_index.lock() {
                Some(index) => agp3_start(resources, index, set_aperture),
                None => {
                    klog_warn!("agp: start before requirements were filtered");
                    StartDisposition::Complete(AgpError::NoAperture)
                }
            },
        }
    }

    /// Stop or remove: turn the aperture off.
    pub fn stop(&self) {
        klog_debug!("agp: target stopping");
        self.state.lock().disable_aperture();
    }

    // =========================================================================
    // Verifier and power
    // =========================================================================

    pub fn set_verifier_flags(&self, flags: VerifierFlags) -> AgpResult {
        self.state.lock().set_verifier_flags(flags)
    }

    /// Deferred verifier work, called by the host each timer period.
    pub fn verifier_tick(&self) -> TickReport {
        self.state.lock().verifier_tick()
    }

    pub fn system_power_changed(&self, power: SystemPower) {
        self.state
            .lock()
            .system_power_changed(power == SystemPower::Working);
    }

    // =========================================================================
    // Physical memory helpers for chipset code
    // =========================================================================

    /// Backing pages through the favored ranges. May come back short.
    pub fn allocate_physical_memory(&self, bytes: u64) -> Option<PageList> {
        let mut state = self.state.lock();
        self.favored.allocate_physical(state.page_source_mut(), bytes)
    }

    /// Like [`allocate_physical_memory`](Self::allocate_physical_memory) but
    /// all or nothing.
    pub fn allocate_physical_memory_exact(&self, bytes: u64) -> Option<PageList> {
        let mut state = self.state.lock();
        self.favored.allocate_physical_exact(state.page_source_mut(), bytes)
    }

    pub fn free_physical_memory(&self, pages: PageList) {
        self.state.lock().page_source_mut().free(pages);
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
