//! AGP capability block layout in PCI configuration space.
//!
//! ```text
//! +0  cap id | next ptr | minor:4 major:4 | reserved
//! +4  status  (rate, agp3 mode, fast write, 4GB, ..., SBA, ..., RQ depth)
//! +8  command (rate, FW enable, 4GB enable, ..., AGP enable, SBA enable, RQ depth)
//! +12 extended registers (AGP3 targets only)
//! ```

use bitflags::bitflags;

pub const PCI_CAPABILITY_ID_AGP: u8 = 0x02;
pub const PCI_CAPABILITY_ID_AGP_TARGET: u8 = 0x0E;

pub const AGP_CAPABILITY_SIZE: usize = 12;
pub const AGP_STATUS_OFFSET: u8 = 4;
pub const AGP_COMMAND_OFFSET: u8 = 8;
pub const AGP_EXTENDED_OFFSET: u8 = 12;

/// Rate bits. In AGP3 mode the same bits mean 4X (bit 0) and 8X (bit 1).
pub const PCI_AGP_RATE_1X: u32 = 0x1;
pub const PCI_AGP_RATE_2X: u32 = 0x2;
pub const PCI_AGP_RATE_4X: u32 = 0x4;
pub const PCI_AGP_RATE_MASK: u32 = 0x7;

/// Generates `name()`/`set_name()` pairs over a packed `u32` register.
macro_rules! register_fields {
    ($ty:ident { $($name:ident : $shift:expr, $width:expr;)* }) => {
        paste::paste! {
            impl $ty {
                $(
                    #[inline]
                    pub const fn $name(self) -> u32 {
                        (self.0 >> $shift) & ((1u32 << $width) - 1)
                    }

                    #[inline]
                    pub fn [<set_ $name>](&mut self, value: u32) {
                        let mask = ((1u32 << $width) - 1) << $shift;
                        self.0 = (self.0 & !mask) | ((value << $shift) & mask);
                    }
                )*
            }
        }
    };
}

/// AGP status register (capability offset +4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct AgpStatus(pub u32);

register_fields!(AgpStatus {
    rate: 0, 3;
    agp3_mode: 3, 1;
    fast_write: 4, 1;
    four_gb: 5, 1;
    host_trans_disable: 6, 1;
    gart64: 7, 1;
    ita_coherent: 8, 1;
    side_band_addressing: 9, 1;
    cal_cycle: 10, 3;
    async_request_size: 13, 3;
    isoch_support: 17, 1;
    request_queue_depth_max: 24, 8;
});

impl AgpStatus {
    #[inline]
    pub const fn is_agp3(self) -> bool {
        self.agp3_mode() != 0
    }
}

/// AGP command register (capability offset +8).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct AgpCommand(pub u32);

register_fields!(AgpCommand {
    rate: 0, 3;
    fast_write_enable: 4, 1;
    four_gb_enable: 5, 1;
    gart64: 7, 1;
    agp_enable: 8, 1;
    sba_enable: 9, 1;
    cal_cycle: 10, 3;
    async_request_size: 13, 3;
    request_queue_depth: 24, 8;
});

/// The 12-byte base AGP capability block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgpCapability {
    pub cap_id: u8,
    pub next: u8,
    pub minor: u8,
    pub major: u8,
    pub status: AgpStatus,
    pub command: AgpCommand,
}

impl AgpCapability {
    pub fn from_bytes(raw: &[u8; AGP_CAPABILITY_SIZE]) -> Self {
        Self {
            cap_id: raw[0],
            next: raw[1],
            minor: raw[2] & 0x0F,
            major: raw[2] >> 4,
            status: AgpStatus(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]])),
            command: AgpCommand(u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]])),
        }
    }

    pub fn to_bytes(&self) -> [u8; AGP_CAPABILITY_SIZE] {
        let mut raw = [0u8; AGP_CAPABILITY_SIZE];
        raw[0] = self.cap_id;
        raw[1] = self.next;
        raw[2] = (self.minor & 0x0F) | (self.major << 4);
        raw[4..8].copy_from_slice(&self.status.0.to_le_bytes());
        raw[8..12].copy_from_slice(&self.command.0.to_le_bytes());
        raw
    }
}

// =============================================================================
// Extended (AGP3 target) registers
// =============================================================================

/// Registers that follow the base block on an AGP3 target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendedRegister {
    IsochStatus,
    AgpControl,
    ApertureSize,
    AperturePageSize,
    GartLow,
    GartHigh,
    IsochCommand,
}

impl ExtendedRegister {
    /// Offset of the register relative to the capability header.
    pub const fn offset(self) -> u8 {
        AGP_EXTENDED_OFFSET
            + match self {
                Self::IsochStatus => 0,
                Self::AgpControl => 4,
                Self::ApertureSize => 8,
                Self::AperturePageSize => 10,
                Self::GartLow => 12,
                Self::GartHigh => 16,
                Self::IsochCommand => 20,
            }
    }

    /// Width of the register in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::IsochStatus | Self::AgpControl | Self::GartLow | Self::GartHigh => 4,
            Self::ApertureSize | Self::AperturePageSize | Self::IsochCommand => 2,
        }
    }

    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::IsochStatus)
    }
}

bitflags! {
    /// AGPCTRL extended register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AgpControl: u32 {
        const GTLB_ENABLE = 1 << 7;
        const APERTURE_ENABLE = 1 << 8;
        const CAL_DISABLE = 1 << 9;
    }
}

// =============================================================================
// APSIZE encodings
// =============================================================================

const MB_PAGES: u32 = (1024 * 1024 / crate::PAGE_SIZE) as u32;

/// (APSIZE value, aperture size in pages) for every encodable size, largest
/// first. 4GB is left out because resource descriptor lengths are 32-bit.
pub const APERTURE_SIZES: [(u16, u32); 10] = [
    (0x800, 2048 * MB_PAGES),
    (0xC00, 1024 * MB_PAGES),
    (0xE00, 512 * MB_PAGES),
    (0xF00, 256 * MB_PAGES),
    (0xF20, 128 * MB_PAGES),
    (0xF30, 64 * MB_PAGES),
    (0xF38, 32 * MB_PAGES),
    (0xF3C, 16 * MB_PAGES),
    (0xF3E, 8 * MB_PAGES),
    (0xF3F, 4 * MB_PAGES),
];

pub fn aperture_pages_from_apsize(apsize: u16) -> Option<u32> {
    APERTURE_SIZES
        .iter()
        .find(|(code, _)| *code == apsize)
        .map(|(_, pages)| *pages)
}

pub fn apsize_from_aperture_pages(pages: u32) -> Option<u16> {
    APERTURE_SIZES
        .iter()
        .find(|(_, size)| *size == pages)
        .map(|(code, _)| *code)
}
