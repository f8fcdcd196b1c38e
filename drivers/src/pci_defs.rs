//! PCI configuration space constants and the common header.
//!
//! Add new constants here only when a consumer exists.

// =============================================================================
// Configuration Space Register Offsets
// =============================================================================

pub const PCI_VENDOR_ID_OFFSET: u8 = 0x00;
pub const PCI_DEVICE_ID_OFFSET: u8 = 0x02;
pub const PCI_COMMAND_OFFSET: u8 = 0x04;
pub const PCI_STATUS_OFFSET: u8 = 0x06;
pub const PCI_REVISION_ID_OFFSET: u8 = 0x08;
pub const PCI_PROG_IF_OFFSET: u8 = 0x09;
pub const PCI_SUBCLASS_OFFSET: u8 = 0x0A;
pub const PCI_CLASS_CODE_OFFSET: u8 = 0x0B;
pub const PCI_HEADER_TYPE_OFFSET: u8 = 0x0E;

/// BAR0 doubles as APBASE on AGP host bridges.
pub const PCI_BAR0_OFFSET: u8 = 0x10;

/// Subsystem vendor ID (16-bit, header type 0 only).
pub const PCI_SUBSYSTEM_VENDOR_ID_OFFSET: u8 = 0x2C;

/// Subsystem ID (16-bit, header type 0 only).
pub const PCI_SUBSYSTEM_ID_OFFSET: u8 = 0x2E;

/// Capabilities pointer for header types 0 and 1.
pub const PCI_CAP_PTR_OFFSET: u8 = 0x34;

/// Capabilities pointer for CardBus bridges (header type 2).
pub const PCI_CARDBUS_CAP_PTR_OFFSET: u8 = 0x14;

pub const PCI_COMMON_HEADER_SIZE: usize = 0x40;
pub const PCI_CONFIG_SPACE_SIZE: usize = 0x100;

// =============================================================================
// Field values
// =============================================================================

/// Status: Capabilities list present (bit 4).
pub const PCI_STATUS_CAP_LIST: u16 = 0x10;

pub const PCI_HEADER_TYPE_MASK: u8 = 0x7F;
pub const PCI_HEADER_TYPE_DEVICE: u8 = 0x00;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 0x01;
pub const PCI_HEADER_TYPE_CARDBUS: u8 = 0x02;

pub const PCI_CLASS_DISPLAY: u8 = 0x03;
pub const PCI_CLASS_BRIDGE: u8 = 0x06;

pub const PCI_VENDOR_ID_INVALID: u16 = 0xFFFF;

/// Memory BAR address bits.
pub const PCI_ADDRESS_MEMORY_ADDRESS_MASK: u64 = !0xF;

// =============================================================================
// Common header
// =============================================================================

/// The fields of the first 64 bytes the AGP code cares about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PciCommonHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision: u8,
    pub prog_if: u8,
    pub subclass: u8,
    pub class_code: u8,
    pub header_type: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub cap_ptr: u8,
}

fn le16(raw: &[u8], at: u8) -> u16 {
    u16::from_le_bytes([raw[at as usize], raw[at as usize + 1]])
}

impl PciCommonHeader {
    pub fn from_bytes(raw: &[u8; PCI_COMMON_HEADER_SIZE]) -> Self {
        let header_type = raw[PCI_HEADER_TYPE_OFFSET as usize];
        let cap_ptr = if header_type & PCI_HEADER_TYPE_MASK == PCI_HEADER_TYPE_CARDBUS {
            raw[PCI_CARDBUS_CAP_PTR_OFFSET as usize]
        } else {
            raw[PCI_CAP_PTR_OFFSET as usize]
        };
        Self {
            vendor_id: le16(raw, PCI_VENDOR_ID_OFFSET),
            device_id: le16(raw, PCI_DEVICE_ID_OFFSET),
            command: le16(raw, PCI_COMMAND_OFFSET),
            status: le16(raw, PCI_STATUS_OFFSET),
            revision: raw[PCI_REVISION_ID_OFFSET as usize],
            prog_if: raw[PCI_PROG_IF_OFFSET as usize],
            subclass: raw[PCI_SUBCLASS_OFFSET as usize],
            class_code: raw[PCI_CLASS_CODE_OFFSET as usize],
            header_type,
            subsystem_vendor_id: le16(raw, PCI_SUBSYSTEM_VENDOR_ID_OFFSET),
            subsystem_id: le16(raw, PCI_SUBSYSTEM_ID_OFFSET),
            cap_ptr,
        }
    }

    pub fn configuration_type(&self) -> u8 {
        self.header_type & PCI_HEADER_TYPE_MASK
    }

    pub fn has_capability_list(&self) -> bool {
        self.status & PCI_STATUS_CAP_LIST != 0
    }

    /// Subsystem IDs only mean something on type 0 functions that are not
    /// bridges; everything else matches quirk entries as (0, 0).
    pub fn quirk_subsystem(&self) -> (u16, u16) {
        if self.configuration_type() == PCI_HEADER_TYPE_DEVICE && self.class_code != PCI_CLASS_BRIDGE
        {
            (self.subsystem_vendor_id, self.subsystem_id)
        } else {
            (0, 0)
        }
    }
}
