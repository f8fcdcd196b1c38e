//! AGP capability access.
//!
//! Locates the AGP (or AGP3 target) capability block through the standard
//! capability chain, then reads or writes it in place. Reads apply the
//! device's quirk flags to the returned copy only; config space is never
//! modified as a side effect of a read.

use agplib_abi::capability::{
    AGP_CAPABILITY_SIZE, AGP_COMMAND_OFFSET, AgpCapability, AgpCommand, ExtendedRegister,
    PCI_AGP_RATE_1X, PCI_AGP_RATE_2X, PCI_AGP_RATE_4X, PCI_CAPABILITY_ID_AGP,
    PCI_CAPABILITY_ID_AGP_TARGET,
};
use agplib_abi::{AgpError, AgpResult};
use agplib_lib::{klog_debug, klog_trace};

use crate::device_flags::{DeviceFlags, DeviceIdentity};
use crate::globals::AgpGlobals;
use crate::pci::{ConfigSpace, PciCapabilityIter, read_common_header};
use crate::pci_defs::PciCommonHeader;

/// Offset of the AGP capability block and a copy of the common header.
pub fn find_agp_capability(cfg: &dyn ConfigSpace) -> AgpResult<(u8, PciCommonHeader)> {
    let header = read_common_header(cfg)?;
    if !header.has_capability_list() {
        klog_debug!(
            "agp: {:04x}:{:04x} has no capability list",
            header.vendor_id,
            header.device_id
        );
        return Err(AgpError::NotImplemented);
    }

    let mut iter = PciCapabilityIter::new(cfg, header.cap_ptr);
    let found = iter
        .by_ref()
        .find(|cap| cap.id == PCI_CAPABILITY_ID_AGP || cap.id == PCI_CAPABILITY_ID_AGP_TARGET);
    if let Some(err) = iter.error() {
        return Err(err);
    }
    match found {
        Some(cap) => {
            klog_trace!("agp: capability {:#04x} at {:#04x}", cap.id, cap.offset);
            Ok((cap.offset, header))
        }
        None => Err(AgpError::NotImplemented),
    }
}

/// Identity used for quirk lookups.
pub fn device_identity(header: &PciCommonHeader) -> DeviceIdentity {
    let (subvendor, subsystem) = header.quirk_subsystem();
    DeviceIdentity {
        vendor: header.vendor_id,
        device: header.device_id,
        subvendor,
        subsystem,
        revision: header.revision,
    }
}

/// An AGP capability as seen through the device's quirks.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityReadout {
    pub offset: u8,
    pub header: PciCommonHeader,
    pub capability: AgpCapability,
    pub flags: DeviceFlags,
}

impl CapabilityReadout {
    pub fn is_agp3(&self) -> bool {
        self.capability.status.is_agp3()
    }
}

/// Mask the status bits the quirk flags rule out. AGP3 reuses the 1X/2X
/// rate bits for 4X/8X.
pub fn apply_quirks(capability: &mut AgpCapability, flags: DeviceFlags) {
    let status = &mut capability.status;
    let agp3 = status.is_agp3();
    let mut rate = status.rate();

    if flags.contains(DeviceFlags::NO_1X) && !agp3 {
        rate &= !PCI_AGP_RATE_1X;
    }
    if flags.contains(DeviceFlags::NO_2X) && !agp3 {
        rate &= !PCI_AGP_RATE_2X;
    }
    if flags.contains(DeviceFlags::NO_4X) {
        rate &= if agp3 { !PCI_AGP_RATE_1X } else { !PCI_AGP_RATE_4X };
    }
    if flags.contains(DeviceFlags::NO_8X) && agp3 {
        rate &= !PCI_AGP_RATE_2X;
    }
    status.set_rate(rate);

    if flags.contains(DeviceFlags::NO_SBA_ENABLE) && !agp3 {
        status.set_side_band_addressing(0);
    }
    if flags.contains(DeviceFlags::NO_FW_ENABLE) {
        status.set_fast_write(0);
    }
}

/// Read the capability, apply quirks and record what was seen in `globals`.
pub fn get_capability(cfg: &dyn ConfigSpace, globals: &AgpGlobals) -> AgpResult<CapabilityReadout> {
    let (offset, header) = find_agp_capability(cfg)?;
    let mut raw = [0u8; AGP_CAPABILITY_SIZE];
    cfg.read(offset, &mut raw)?;
    let mut capability = AgpCapability::from_bytes(&raw);

    let flags = globals.device_flags(&device_identity(&header));
    if !flags.is_empty() {
        klog_debug!(
            "agp: {:04x}:{:04x} quirk flags {:#x}",
            header.vendor_id,
            header.device_id,
            flags.bits()
        );
        apply_quirks(&mut capability, flags);
    }

    globals.record_status(capability.status);
    globals.record_command(capability.command);

    Ok(CapabilityReadout {
        offset,
        header,
        capability,
        flags,
    })
}

/// Write the command register of the capability. Only those four bytes are
/// touched; status and the header belong to the device.
pub fn set_capability(cfg: &dyn ConfigSpace, capability: &AgpCapability) -> AgpResult {
    let (offset, _) = find_agp_capability(cfg)?;
    cfg.write_u32(register_at(offset, AGP_COMMAND_OFFSET)?, capability.command.0)
}

/// Raw command register, no quirks applied.
pub fn get_command(cfg: &dyn ConfigSpace) -> AgpResult<AgpCommand> {
    let (offset, _) = find_agp_capability(cfg)?;
    cfg.read_u32(register_at(offset, AGP_COMMAND_OFFSET)?).map(AgpCommand)
}

/// Config offset of a register inside the capability block. A block placed
/// near the end of config space can put its tail past 0xFF.
fn register_at(capability: u8, delta: u8) -> AgpResult<u8> {
    capability
        .checked_add(delta)
        .ok_or(AgpError::ConfigAccess { offset: capability })
}

pub fn get_extended(cfg: &dyn ConfigSpace, register: ExtendedRegister) -> AgpResult<u32> {
    let (offset, _) = find_agp_capability(cfg)?;
    let at = register_at(offset, register.offset())?;
    match register.size() {
        2 => cfg.read_u16(at).map(u32::from),
        _ => cfg.read_u32(at),
    }
}

pub fn set_extended(cfg: &dyn ConfigSpace, register: ExtendedRegister, value: u32) -> AgpResult {
    if !register.is_writable() {
        return Err(AgpError::NotImplemented);
    }
    let (offset, _) = find_agp_capability(cfg)?;
    let at = register_at(offset, register.offset())?;
    match register.size() {
        2 => cfg.write_u16(at, value as u16),
        _ => cfg.write_u32(at, value),
    }
}

/// (vendor, device) of a master.
pub fn master_device_id(cfg: &dyn ConfigSpace) -> AgpResult<(u16, u16)> {
    let header = read_common_header(cfg)?;
    Ok((header.vendor_id, header.device_id))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
