//! Library-wide state shared by every target and master.
//!
//! Built once at load time and handed to each context as an `Arc`; nothing
//! reaches it through a static.

use core::sync::atomic::{AtomicU32, Ordering};

use agplib_abi::capability::{AgpCommand, AgpStatus};
use agplib_lib::{klog_info, klog_set_level};

use crate::device_flags::{DeviceFlags, DeviceFlagsRegistry, DeviceIdentity};
use crate::settings::AgpSettings;

pub struct AgpGlobals {
    settings: AgpSettings,
    flags: DeviceFlagsRegistry,
    /// Last status/command observed on a target, for the management block.
    last_status: AtomicU32,
    last_command: AtomicU32,
}

impl AgpGlobals {
    pub fn new(mut settings: AgpSettings) -> Self {
        if let Some(level) = settings.log_level {
            klog_set_level(level);
        }
        let flags = DeviceFlagsRegistry::new(
            core::mem::take(&mut settings.global_hacks),
            core::mem::take(&mut settings.device_hacks),
        );
        klog_info!(
            "agp: loaded settings, verifier {:#x}, max address {:#x}",
            settings.verifier.bits(),
            settings.max_address
        );
        Self {
            settings,
            flags,
            last_status: AtomicU32::new(0),
            last_command: AtomicU32::new(0),
        }
    }

    pub fn settings(&self) -> &AgpSettings {
        &self.settings
    }

    pub fn device_flags(&self, id: &DeviceIdentity) -> DeviceFlags {
        self.flags.lookup(id)
    }

    pub fn flags_registry(&self) -> &DeviceFlagsRegistry {
        &self.flags
    }

    pub fn record_status(&self, status: AgpStatus) {
        self.last_status.store(status.0, Ordering::Release);
    }

    pub fn record_command(&self, command: AgpCommand) {
        self.last_command.store(command.0, Ordering::Release);
    }

    pub fn last_capability(&self) -> (AgpStatus, AgpCommand) {
        (
            AgpStatus(self.last_status.load(Ordering::Acquire)),
            AgpCommand(self.last_command.load(Ordering::Acquire)),
        )
    }
}

impl Default for AgpGlobals {
    fn default() -> Self {
        Self::new(AgpSettings::default())
    }
}
