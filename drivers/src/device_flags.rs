//! Per-device quirk flags.
//!
//! Quirk rows come from the configuration source as opaque 64-bit masks keyed
//! by (vendor, device[, subsystem, subvendor][, revision]). Lookup picks the
//! most specific row that matches; rows with equal specificity resolve to the
//! one inserted first. Callers must not depend on tie-break order surviving a
//! rebuild of the table from a differently ordered source.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use agplib_lib::cmdline::parse_hex_u64;
use bitflags::bitflags;

use crate::pci_defs::PCI_VENDOR_ID_INVALID;

bitflags! {
    /// Quirk bits understood by the library. Bits above
    /// [`SPECIAL_TARGET`](Self::SPECIAL_TARGET) belong to the chipset
    /// driver and are passed through to its `special_target` hook.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DeviceFlags: u64 {
        const NO_1X = 0x0000_0001;
        const NO_2X = 0x0000_0002;
        const NO_4X = 0x0000_0004;
        const NO_8X = 0x0000_0008;
        const REVERSE_INITIALIZATION = 0x0000_0080;
        const NO_SBA_ENABLE = 0x0000_0100;
        const NO_FW_ENABLE = 0x0000_0200;

        /// Mask of the generic bits above.
        const SPECIAL_TARGET = 0x000F_FFFF;

        const SET_RATE_1X = 0x0010_0000;
        const SET_RATE_2X = 0x0020_0000;
        const SET_RATE_4X = 0x0040_0000;
        const SET_RATE_8X = 0x0080_0000;
        const SET_RATE_0X = 0x0100_0000;

        const _ = !0;
    }
}

impl DeviceFlags {
    /// True when the chipset's `special_target` hook has work to do.
    pub fn needs_special_target(self) -> bool {
        self.bits() > Self::SPECIAL_TARGET.bits() || self.contains(Self::REVERSE_INITIALIZATION)
    }

    /// The bits handed to `special_target`: everything chipset specific plus
    /// the reverse-initialization request.
    pub fn special_target_bits(self) -> Self {
        (self - Self::SPECIAL_TARGET) | (self & Self::REVERSE_INITIALIZATION)
    }
}

bitflags! {
    /// Which optional identity fields a quirk row constrains.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MatchFlags: u8 {
        const REVISION = 1 << 0;
        const SUBSYSTEM = 1 << 1;
    }
}

/// Identity a quirk row is matched against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subsystem: u16,
    pub revision: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HackEntry {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subsystem: u16,
    pub revision: u8,
    pub flags: DeviceFlags,
    pub matching: MatchFlags,
}

impl HackEntry {
    /// A row that matches every revision and subsystem of `vendor:device`.
    pub const fn new(vendor: u16, device: u16, flags: DeviceFlags) -> Self {
        Self {
            vendor,
            device,
            subvendor: 0,
            subsystem: 0,
            revision: 0,
            flags,
            matching: MatchFlags::empty(),
        }
    }

    pub const fn with_revision(mut self, revision: u8) -> Self {
        self.revision = revision;
        self.matching = self.matching.union(MatchFlags::REVISION);
        self
    }

    pub const fn with_subsystem(mut self, subvendor: u16, subsystem: u16) -> Self {
        self.subvendor = subvendor;
        self.subsystem = subsystem;
        self.matching = self.matching.union(MatchFlags::SUBSYSTEM);
        self
    }

    /// Specificity of this row for `id`, or `None` if it does not apply.
    fn score(&self, id: &DeviceIdentity) -> Option<u32> {
        if self.vendor != id.vendor || self.device != id.device {
            return None;
        }
        let mut score = 1;
        if self.matching.contains(MatchFlags::REVISION) {
            if self.revision != id.revision {
                return None;
            }
            score += 2;
        }
        if self.matching.contains(MatchFlags::SUBSYSTEM) {
            if self.subvendor != id.subvendor || self.subsystem != id.subsystem {
                return None;
            }
            score += 4;
        }
        Some(score)
    }
}

/// Parse a quirk key `VVVVDDDD[SSSSssss][RR]`.
///
/// V is the vendor, D the device, S the subsystem, s the subvendor and R the
/// revision, all hex. The optional groups are told apart by length.
pub fn parse_hack_key(key: &str, flags: DeviceFlags) -> Option<HackEntry> {
    if !key.is_ascii() {
        return None;
    }
    let field = |range: core::ops::Range<usize>| -> Option<u16> {
        u16::from_str_radix(key.get(range)?, 16).ok()
    };
    let entry = HackEntry::new(field(0..4)?, field(4..8)?, flags);
    match key.len() {
        8 => Some(entry),
        10 => Some(entry.with_revision(u8::from_str_radix(&key[8..10], 16).ok()?)),
        16 => Some(entry.with_subsystem(field(12..16)?, field(8..12)?)),
        18 => Some(
            entry
                .with_subsystem(field(12..16)?, field(8..12)?)
                .with_revision(u8::from_str_radix(&key[16..18], 16).ok()?),
        ),
        _ => None,
    }
}

/// Ordered quirk table.
#[derive(Clone, Debug, Default)]
pub struct DeviceFlagsTable {
    entries: Vec<HackEntry>,
}

impl DeviceFlagsTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Copy rows up to the first one whose vendor is the invalid-vendor
    /// sentinel.
    pub fn from_raw(rows: &[HackEntry]) -> Self {
        Self {
            entries: rows
                .iter()
                .take_while(|row| row.vendor != PCI_VENDOR_ID_INVALID)
                .copied()
                .collect(),
        }
    }

    pub fn push(&mut self, entry: HackEntry) {
        self.entries.push(entry);
    }

    /// Parse `key` and append it. Returns false if the key or value is malformed.
    pub fn push_key(&mut self, key: &str, value: &str) -> bool {
        let Some(bits) = parse_hex_u64(value) else {
            return false;
        };
        match parse_hack_key(key, DeviceFlags::from_bits_retain(bits)) {
            Some(entry) => {
                self.push(entry);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flags of the most specific matching row, empty if none matches.
    pub fn lookup(&self, id: &DeviceIdentity) -> DeviceFlags {
        let mut best: Option<(u32, DeviceFlags)> = None;
        for entry in &self.entries {
            if let Some(score) = entry.score(id) {
                // Strictly greater: the first row seen keeps a tie.
                if best.is_none_or(|(top, _)| score > top) {
                    best = Some((score, entry.flags));
                }
            }
        }
        best.map(|(_, flags)| flags).unwrap_or_default()
    }
}

/// Layered quirk sources, least to most specific: the global table, the
/// per-installation table and the live session override.
#[derive(Debug, Default)]
pub struct DeviceFlagsRegistry {
    global: DeviceFlagsTable,
    device: DeviceFlagsTable,
    session_override: AtomicU64,
}

impl DeviceFlagsRegistry {
    pub fn new(global: DeviceFlagsTable, device: DeviceFlagsTable) -> Self {
        Self {
            global,
            device,
            session_override: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, id: &DeviceIdentity) -> DeviceFlags {
        self.global.lookup(id) | self.device.lookup(id) | self.session_override()
    }

    pub fn session_override(&self) -> DeviceFlags {
        DeviceFlags::from_bits_retain(self.session_override.load(Ordering::Acquire))
    }

    pub fn add_session_override(&self, flags: DeviceFlags) {
        self.session_override
            .fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn replace_session_override(&self, flags: DeviceFlags) {
        self.session_override.store(flags.bits(), Ordering::Release);
    }
}
