//! Byte-level PCI configuration space access.
//!
//! Everything above this module reads and writes config space through the
//! [`ConfigSpace`] trait, so the same capability code runs against legacy
//! port I/O on hardware and against an in-memory [`ConfigImage`] for
//! simulated chipsets and tests.

use alloc::sync::Arc;

use agplib_abi::{AgpError, AgpResult};
use spin::Mutex;

use crate::pci_defs::*;

/// Pluggable config space accessor for one PCI function.
///
/// Failures mean the link to the device is broken; callers propagate them
/// immediately and never retry.
pub trait ConfigSpace: Send + Sync {
    fn read(&self, offset: u8, buf: &mut [u8]) -> AgpResult;
    fn write(&self, offset: u8, data: &[u8]) -> AgpResult;

    fn read_u8(&self, offset: u8) -> AgpResult<u8> {
        let mut raw = [0u8; 1];
        self.read(offset, &mut raw)?;
        Ok(raw[0])
    }

    fn read_u16(&self, offset: u8) -> AgpResult<u16> {
        let mut raw = [0u8; 2];
        self.read(offset, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn read_u32(&self, offset: u8) -> AgpResult<u32> {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    fn write_u16(&self, offset: u8, value: u16) -> AgpResult {
        self.write(offset, &value.to_le_bytes())
    }

    fn write_u32(&self, offset: u8, value: u32) -> AgpResult {
        self.write(offset, &value.to_le_bytes())
    }
}

fn check_bounds(offset: u8, len: usize) -> AgpResult {
    if offset as usize + len > PCI_CONFIG_SPACE_SIZE {
        return Err(AgpError::ConfigAccess { offset });
    }
    Ok(())
}

// =============================================================================
// Legacy Port I/O (0xCF8/0xCFC)
// =============================================================================

#[cfg(target_arch = "x86_64")]
pub use legacy::LegacyPortIo;

#[cfg(target_arch = "x86_64")]
mod legacy {
    use x86_64::instructions::port::Port;

    use super::*;

    const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
    const PCI_CONFIG_DATA: u16 = 0xCFC;

    /// Serialises the address/data port pair across all functions.
    static PIO_LOCK: Mutex<()> = Mutex::new(());

    /// Config space of one bus/device/function through the legacy ports.
    #[derive(Clone, Copy, Debug)]
    pub struct LegacyPortIo {
        pub bus: u8,
        pub device: u8,
        pub function: u8,
    }

    impl LegacyPortIo {
        pub const fn new(bus: u8, device: u8, function: u8) -> Self {
            Self {
                bus,
                device,
                function,
            }
        }

        #[inline(always)]
        fn config_addr(&self, offset: u8) -> u32 {
            0x8000_0000
                | ((self.bus as u32) << 16)
                | ((self.device as u32) << 11)
                | ((self.function as u32) << 8)
                | ((offset as u32) & 0xFC)
        }

        fn read_dword(&self, offset: u8) -> u32 {
            let mut address = Port::<u32>::new(PCI_CONFIG_ADDRESS);
            let mut data = Port::<u32>::new(PCI_CONFIG_DATA);
            // SAFETY: the legacy configuration mechanism is always present on
            // PC-compatible chipsets; PIO_LOCK keeps the pair consistent.
            unsafe {
                address.write(self.config_addr(offset));
                data.read()
            }
        }

        fn write_dword(&self, offset: u8, value: u32) {
            let mut address = Port::<u32>::new(PCI_CONFIG_ADDRESS);
            let mut data = Port::<u32>::new(PCI_CONFIG_DATA);
            // SAFETY: see `read_dword`.
            unsafe {
                address.write(self.config_addr(offset));
                data.write(value);
            }
        }
    }

    impl ConfigSpace for LegacyPortIo {
        fn read(&self, offset: u8, buf: &mut [u8]) -> AgpResult {
            check_bounds(offset, buf.len())?;
            let _guard = PIO_LOCK.lock();
            for (i, byte) in buf.iter_mut().enumerate() {
                let at = offset as usize + i;
                let dword = self.read_dword((at & !3) as u8);
                *byte = (dword >> ((at & 3) * 8)) as u8;
            }
            Ok(())
        }

        fn write(&self, offset: u8, data: &[u8]) -> AgpResult {
            check_bounds(offset, data.len())?;
            let _guard = PIO_LOCK.lock();
            for (i, byte) in data.iter().enumerate() {
                let at = offset as usize + i;
                let aligned = (at & !3) as u8;
                let shift = (at & 3) * 8;
                let mut dword = self.read_dword(aligned);
                dword = (dword & !(0xFF << shift)) | ((*byte as u32) << shift);
                self.write_dword(aligned, dword);
            }
            Ok(())
        }
    }
}

// =============================================================================
// In-memory config space
// =============================================================================

/// A 256-byte config space image.
#[derive(Clone, Debug)]
pub struct ConfigImage {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    /// Accesses touching this offset fail, to model a dead link.
    fail_at: Option<u8>,
}

impl ConfigImage {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut image = Self {
            bytes: [0; PCI_CONFIG_SPACE_SIZE],
            fail_at: None,
        };
        image.poke_u16(PCI_VENDOR_ID_OFFSET, vendor_id);
        image.poke_u16(PCI_DEVICE_ID_OFFSET, device_id);
        image
    }

    pub fn set_class(&mut self, class_code: u8, subclass: u8) -> &mut Self {
        self.bytes[PCI_CLASS_CODE_OFFSET as usize] = class_code;
        self.bytes[PCI_SUBCLASS_OFFSET as usize] = subclass;
        self
    }

    pub fn set_header_type(&mut self, header_type: u8) -> &mut Self {
        self.bytes[PCI_HEADER_TYPE_OFFSET as usize] = header_type;
        self
    }

    pub fn set_revision(&mut self, revision: u8) -> &mut Self {
        self.bytes[PCI_REVISION_ID_OFFSET as usize] = revision;
        self
    }

    pub fn set_subsystem(&mut self, subsystem_vendor_id: u16, subsystem_id: u16) -> &mut Self {
        self.poke_u16(PCI_SUBSYSTEM_VENDOR_ID_OFFSET, subsystem_vendor_id);
        self.poke_u16(PCI_SUBSYSTEM_ID_OFFSET, subsystem_id);
        self
    }

    /// Append a capability at `offset` to the end of the capability chain and
    /// copy `body` (everything after the 2-byte header) behind it.
    pub fn add_capability(&mut self, offset: u8, cap_id: u8, body: &[u8]) -> &mut Self {
        let start = offset as usize;
        self.bytes[start] = cap_id;
        self.bytes[start + 1] = 0;
        self.bytes[start + 2..start + 2 + body.len()].copy_from_slice(body);

        let status = self.peek_u16(PCI_STATUS_OFFSET) | PCI_STATUS_CAP_LIST;
        self.poke_u16(PCI_STATUS_OFFSET, status);

        let root = self.cap_ptr_offset();
        if self.bytes[root] == 0 {
            self.bytes[root] = offset;
        } else {
            let mut at = self.bytes[root] as usize;
            while self.bytes[at + 1] != 0 {
                at = self.bytes[at + 1] as usize;
            }
            self.bytes[at + 1] = offset;
        }
        self
    }

    pub fn fail_accesses_at(&mut self, offset: Option<u8>) -> &mut Self {
        self.fail_at = offset;
        self
    }

    fn cap_ptr_offset(&self) -> usize {
        if self.bytes[PCI_HEADER_TYPE_OFFSET as usize] & PCI_HEADER_TYPE_MASK
            == PCI_HEADER_TYPE_CARDBUS
        {
            PCI_CARDBUS_CAP_PTR_OFFSET as usize
        } else {
            PCI_CAP_PTR_OFFSET as usize
        }
    }

    pub fn peek(&self, offset: u8) -> u8 {
        self.bytes[offset as usize]
    }

    pub fn poke(&mut self, offset: u8, value: u8) {
        self.bytes[offset as usize] = value;
    }

    pub fn peek_u16(&self, offset: u8) -> u16 {
        let at = offset as usize;
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    pub fn poke_u16(&mut self, offset: u8, value: u16) {
        let at = offset as usize;
        self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn peek_u32(&self, offset: u8) -> u32 {
        let at = offset as usize;
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    pub fn poke_u32(&mut self, offset: u8, value: u32) {
        let at = offset as usize;
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn check(&self, offset: u8, len: usize) -> AgpResult {
        check_bounds(offset, len)?;
        if let Some(bad) = self.fail_at {
            if (offset as usize..offset as usize + len).contains(&(bad as usize)) {
                return Err(AgpError::ConfigAccess { offset: bad });
            }
        }
        Ok(())
    }

    fn read_bytes(&self, offset: u8, buf: &mut [u8]) -> AgpResult {
        self.check(offset, buf.len())?;
        let at = offset as usize;
        buf.copy_from_slice(&self.bytes[at..at + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, offset: u8, data: &[u8]) -> AgpResult {
        self.check(offset, data.len())?;
        let at = offset as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A [`ConfigImage`] shared between the driver and whoever plays the
/// hardware (a simulated chipset or a test).
#[derive(Clone)]
pub struct SharedConfig(Arc<Mutex<ConfigImage>>);

impl SharedConfig {
    pub fn new(image: ConfigImage) -> Self {
        Self(Arc::new(Mutex::new(image)))
    }

    /// Run `f` with exclusive access to the image, as the device would.
    pub fn with<R>(&self, f: impl FnOnce(&mut ConfigImage) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl ConfigSpace for SharedConfig {
    fn read(&self, offset: u8, buf: &mut [u8]) -> AgpResult {
        self.0.lock().read_bytes(offset, buf)
    }

    fn write(&self, offset: u8, data: &[u8]) -> AgpResult {
        self.0.lock().write_bytes(offset, data)
    }
}

// =============================================================================
// PCI Capability List Walking
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciCapability {
    pub offset: u8,
    pub id: u8,
}

/// Iterator over the capability list of one function.
///
/// A guard counter limits traversal to [`Self::MAX_CAPS`] entries so that a
/// cyclic chain terminates. Well-formed chains are walked unchanged.
pub struct PciCapabilityIter<'a> {
    config: &'a dyn ConfigSpace,
    next_ptr: u8,
    remaining: u8,
    error: Option<AgpError>,
}

impl<'a> PciCapabilityIter<'a> {
    /// Capabilities live in 0x40..0x100 and take at least a dword each, so a
    /// chain longer than this has to loop.
    pub const MAX_CAPS: u8 = 48;

    /// Start at `first_ptr` (already read from the type-dependent root).
    pub fn new(config: &'a dyn ConfigSpace, first_ptr: u8) -> Self {
        Self {
            config,
            // The bottom 2 bits of a capability pointer are reserved.
            next_ptr: first_ptr & 0xFC,
            remaining: Self::MAX_CAPS,
            error: None,
        }
    }

    /// The access error that ended the walk, if any.
    pub fn error(&self) -> Option<AgpError> {
        self.error
    }
}

impl Iterator for PciCapabilityIter<'_> {
    type Item = PciCapability;

    fn next(&mut self) -> Option<PciCapability> {
        if self.next_ptr == 0 || self.remaining == 0 || self.error.is_some() {
            return None;
        }
        self.remaining -= 1;

        let offset = self.next_ptr;
        let mut header = [0u8; 2];
        if let Err(err) = self.config.read(offset, &mut header) {
            self.error = Some(err);
            return None;
        }
        self.next_ptr = header[1] & 0xFC;
        Some(PciCapability {
            offset,
            id: header[0],
        })
    }
}

/// Read the common header of a function.
pub fn read_common_header(config: &dyn ConfigSpace) -> AgpResult<PciCommonHeader> {
    let mut raw = [0u8; PCI_COMMON_HEADER_SIZE];
    config.read(0, &mut raw)?;
    Ok(PciCommonHeader::from_bytes(&raw))
}
