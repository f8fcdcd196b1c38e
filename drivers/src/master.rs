//! Master (graphics adapter) context.
//!
//! The master has no resources of its own to filter. It vends the bus
//! interface to the display driver, and it refuses to stop or go away while
//! any interface handle or reserved page is outstanding. Those counters are
//! atomics so the stop/remove queries never wait behind the target lock.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use agplib_abi::capability::AgpCapability;
use agplib_abi::{AgpError, AgpResult};
use agplib_lib::{Rendezvous, klog_debug, klog_info, klog_warn};
use spin::Mutex;

use crate::config::{get_capability, set_capability};
use crate::device_flags::DeviceFlags;
use crate::interface::{AgpBusInterface, InterfaceVersion};
use crate::pci::ConfigSpace;
use crate::platform::MasterSetup;
use crate::target::TargetContext;

/// `set_rate` bit: turn side-band addressing off.
pub const AGP_SET_RATE_DISABLE_SBA: u32 = 0x0001_0000;
/// `set_rate` bit: turn fast writes off.
pub const AGP_SET_RATE_DISABLE_FW: u32 = 0x0002_0000;
const AGP_SET_RATE_MASK: u32 = 0xF;

/// Runs a routine on every processor at the same time.
pub trait ProcessorBroadcast {
    fn processor_count(&self) -> usize;

    /// Call `routine` once on each processor and return when all are done.
    fn broadcast(&self, routine: &(dyn Fn() + Sync));
}

/// Uniprocessor broadcast: the routine runs inline.
pub struct SingleProcessor;

impl ProcessorBroadcast for SingleProcessor {
    fn processor_count(&self) -> usize {
        1
    }

    fn broadcast(&self, routine: &(dyn Fn() + Sync)) {
        routine();
    }
}

pub struct MasterContext {
    target: Arc<TargetContext>,
    config: Arc<dyn ConfigSpace>,
    /// `AGP_CAPABILITIES_*` bits from the last initialization.
    capabilities: AtomicU32,
    interface_count: AtomicU32,
    reserved_pages: AtomicU64,
    disable_count: AtomicU32,
    stop_pending: AtomicBool,
    remove_pending: AtomicBool,
}

impl MasterContext {
    /// Bind a master below `target`. A bridge takes one master only.
    pub fn attach(target: &Arc<TargetContext>, config: Arc<dyn ConfigSpace>) -> AgpResult<Arc<Self>> {
        let master = Arc::new(Self {
            target: target.clone(),
            config,
            capabilities: AtomicU32::new(0),
            interface_count: AtomicU32::new(0),
            reserved_pages: AtomicU64::new(0),
            disable_count: AtomicU32::new(0),
            stop_pending: AtomicBool::new(false),
            remove_pending: AtomicBool::new(false),
        });
        target.bind_master(&master)?;
        Ok(master)
    }

    pub fn target(&self) -> &Arc<TargetContext> {
        &self.target
    }

    pub fn config(&self) -> &dyn ConfigSpace {
        &*self.config
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities.load(Ordering::Acquire)
    }

    pub fn interface_count(&self) -> u32 {
        self.interface_count.load(Ordering::Acquire)
    }

    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages.load(Ordering::Acquire)
    }

    pub fn disable_count(&self) -> u32 {
        self.disable_count.load(Ordering::Acquire)
    }

    pub fn master_capability(&self) -> AgpResult<AgpCapability> {
        get_capability(&*self.config, self.target.globals()).map(|r| r.capability)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Negotiate and program the AGP link on both ends.
    ///
    /// The chipset routine runs once, under a rendezvous, with every other
    /// processor parked. The command values go to the bridge first unless
    /// the bridge asks for reverse initialization.
    pub fn start(&self, processors: &dyn ProcessorBroadcast) -> AgpResult {
        self.clear_pending(&self.stop_pending);

        let target = self.target.capability()?;
        let master = get_capability(&*self.config, self.target.globals())?;

        let barrier = Rendezvous::new(processors.processor_count());
        let outcome: Mutex<Option<AgpResult<MasterSetup>>> = Mutex::new(None);
        processors.broadcast(&|| {
            let result = barrier.arrive(|| {
                self.target
                    .lock()
                    .platform_mut()
                    .initialize_master(&target.capability, &master.capability)
            });
            if let Some(result) = result {
                *outcome.lock() = Some(result);
            }
        });
        let setup = outcome.into_inner().unwrap_or(Err(AgpError::Unsuccessful))?;

        if target.flags.needs_special_target() {
            let bits = target.flags.special_target_bits();
            if let Err(err) = self.target.lock().platform_mut().special_target(bits) {
                klog_warn!("agp: special target {:#x} failed: {}", bits.bits(), err);
            }
        }

        if target.flags.contains(DeviceFlags::REVERSE_INITIALIZATION) {
            set_capability(&*self.config, &setup.master)?;
            self.target.set_capability(&setup.target)?;
        } else {
            self.target.set_capability(&setup.target)?;
            set_capability(&*self.config, &setup.master)?;
        }
        self.target.globals().record_command(setup.target.command);
        self.capabilities.store(setup.capabilities, Ordering::Release);
        klog_info!(
            "agp: link up, command {:#010x}, capabilities {:#x}",
            setup.target.command.0,
            setup.capabilities
        );
        Ok(())
    }

    // =========================================================================
    // Quiesce gate
    // =========================================================================

    fn busy(&self) -> bool {
        self.interface_count() != 0 || self.reserved_pages() != 0
    }

    /// Refuse while a client still holds an interface or reserved pages.
    pub fn check_quiesced(&self) -> AgpResult {
        if self.busy() {
            klog_debug!(
                "agp: master busy, {} interfaces, {:#x} reserved pages",
                self.interface_count(),
                self.reserved_pages()
            );
            return Err(AgpError::DeviceBusy);
        }
        Ok(())
    }

    fn set_pending(&self, pending: &AtomicBool) -> AgpResult {
        self.check_quiesced()?;
        if !pending.swap(true, Ordering::AcqRel) {
            self.disable_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn clear_pending(&self, pending: &AtomicBool) {
        if pending.swap(false, Ordering::AcqRel) {
            self.disable_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn query_stop(&self) -> AgpResult {
        self.set_pending(&self.stop_pending)
    }

    pub fn cancel_stop(&self) {
        self.clear_pending(&self.stop_pending);
    }

    pub fn query_remove(&self) -> AgpResult {
        self.set_pending(&self.remove_pending)
    }

    pub fn cancel_remove(&self) {
        self.clear_pending(&self.remove_pending);
    }

    // =========================================================================
    // Interface
    // =========================================================================

    /// Vend the bus interface. `size` is the caller's structure size and
    /// must cover everything `version` defines.
    pub fn query_interface(self: &Arc<Self>, version: u16, size: usize) -> AgpResult<AgpBusInterface> {
        let Some(version) = InterfaceVersion::from_raw(version) else {
            klog_debug!("agp: unknown interface version {}", version);
            return Err(AgpError::NotSupported);
        };
        if size < version.required_size() {
            klog_debug!(
                "agp: interface buffer {} too small for {:?}",
                size,
                version
            );
            return Err(AgpError::InvalidParameter);
        }
        Ok(AgpBusInterface::new(self.clone(), version))
    }

    pub(crate) fn reference(&self) {
        self.interface_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dereference(&self) {
        self.interface_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn add_reserved(&self, pages: u32) {
        self.reserved_pages.fetch_add(pages as u64, Ordering::AcqRel);
    }

    pub(crate) fn sub_reserved(&self, pages: u32) {
        self.reserved_pages.fetch_sub(pages as u64, Ordering::AcqRel);
    }

    /// Apply a display driver's rate request. The SBA and fast-write bits
    /// stick in the session override even when the rate itself is refused.
    pub fn set_rate(&self, rate: u32) -> AgpResult {
        let registry = self.target.globals().flags_registry();
        if rate & AGP_SET_RATE_DISABLE_SBA != 0 {
            if self.master_capability()?.status.is_agp3() {
                return Err(AgpError::InvalidParameter);
            }
            registry.add_session_override(DeviceFlags::NO_SBA_ENABLE);
        }
        if rate & AGP_SET_RATE_DISABLE_FW != 0 {
            registry.add_session_override(DeviceFlags::NO_FW_ENABLE);
        }

        let flags = match rate & AGP_SET_RATE_MASK {
            0 => DeviceFlags::SET_RATE_0X,
            1 => DeviceFlags::SET_RATE_1X,
            2 => DeviceFlags::SET_RATE_2X,
            4 => DeviceFlags::SET_RATE_4X,
            8 => DeviceFlags::SET_RATE_8X,
            _ => return Err(AgpError::InvalidParameter),
        };
        self.target.lock().platform_mut().special_target(flags)
    }
}

#[cfg(test)]
#[path = "master_tests.rs"]
mod tests;
