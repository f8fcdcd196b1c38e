//! Resource requirement and assignment lists, and the two target strategies
//! that splice the aperture into them.
//!
//! The host-bridge strategy adds its own descriptors behind a private marker
//! and strips them again at start, so nothing below the filter ever sees
//! them. The AGP3 strategy identifies the aperture BAR already present in
//! the list and only remembers its position.

use alloc::vec::Vec;

use agplib_abi::{AgpError, AgpResult, PAGE_SIZE, PhysAddr};
use agplib_lib::{klog_debug, klog_info, klog_warn};
use bitflags::bitflags;

use crate::platform::ApertureInfo;

/// First word of the private marker descriptor.
pub const AGP_PRIVATE_SIGNATURE: u32 = u32::from_le_bytes(*b"AgpP");

// Wire sizes of the list structures, used to keep `list_size` exact.
pub const IO_RESOURCE_REQUIREMENTS_HEADER_SIZE: u32 = 32;
pub const IO_RESOURCE_LIST_HEADER_SIZE: u32 = 8;
pub const IO_RESOURCE_DESCRIPTOR_SIZE: u32 = 32;

pub const CM_RESOURCE_MEMORY_READ_WRITE: u16 = 0x0000;
pub const CM_RESOURCE_MEMORY_PREFETCHABLE: u16 = 0x0004;

bitflags! {
    /// Descriptor option bits. No bits set means "required".
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IoResourceOption: u8 {
        const PREFERRED = 0x01;
        const DEFAULT = 0x02;
        const ALTERNATIVE = 0x08;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShareDisposition {
    #[default]
    Undetermined,
    DeviceExclusive,
    DriverExclusive,
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoResourceKind {
    Memory {
        min: PhysAddr,
        max: PhysAddr,
        length: u32,
        alignment: u32,
    },
    Port {
        min: u64,
        max: u64,
        length: u32,
        alignment: u32,
    },
    Interrupt {
        min: u32,
        max: u32,
    },
    DevicePrivate {
        data: [u32; 3],
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoResourceDescriptor {
    pub option: IoResourceOption,
    pub share: ShareDisposition,
    pub flags: u16,
    pub kind: IoResourceKind,
}

impl IoResourceDescriptor {
    /// Exclusive, prefetchable memory window of `length` bytes, aligned to
    /// its own size, anywhere in `[min, max]`.
    pub fn aperture_memory(option: IoResourceOption, min: PhysAddr, max: PhysAddr, length: u32) -> Self {
        Self {
            option,
            share: ShareDisposition::DeviceExclusive,
            flags: CM_RESOURCE_MEMORY_READ_WRITE | CM_RESOURCE_MEMORY_PREFETCHABLE,
            kind: IoResourceKind::Memory {
                min,
                max,
                length,
                alignment: length,
            },
        }
    }

    fn private_marker(following: u32) -> Self {
        Self {
            option: IoResourceOption::empty(),
            share: ShareDisposition::DeviceExclusive,
            flags: 0,
            kind: IoResourceKind::DevicePrivate {
                data: [AGP_PRIVATE_SIGNATURE, following, 0],
            },
        }
    }

    pub fn is_alternative(&self) -> bool {
        self.option.contains(IoResourceOption::ALTERNATIVE)
    }

    /// `(min, length)` of a memory descriptor.
    pub fn memory_window(&self) -> Option<(PhysAddr, u32)> {
        match self.kind {
            IoResourceKind::Memory { min, length, .. } => Some((min, length)),
            _ => None,
        }
    }

    /// A memory descriptor that is not an alternative.
    fn preferred_memory(&self) -> Option<(PhysAddr, PhysAddr)> {
        match self.kind {
            IoResourceKind::Memory { min, max, .. } if !self.is_alternative() => Some((min, max)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoResourceList {
    pub version: u16,
    pub revision: u16,
    pub descriptors: Vec<IoResourceDescriptor>,
}

impl IoResourceList {
    pub fn new(descriptors: Vec<IoResourceDescriptor>) -> Self {
        Self {
            version: 1,
            revision: 1,
            descriptors,
        }
    }

    pub fn count(&self) -> usize {
        self.descriptors.len()
    }
}

/// What a device asks for: one or more alternative lists, any one of which
/// satisfies it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoResourceRequirementsList {
    /// Size in bytes of the list as laid out on the wire.
    pub list_size: u32,
    pub bus_number: u32,
    pub slot_number: u32,
    pub alternatives: Vec<IoResourceList>,
}

impl IoResourceRequirementsList {
    pub fn new(bus_number: u32, slot_number: u32, alternatives: Vec<IoResourceList>) -> Self {
        let mut list = Self {
            list_size: 0,
            bus_number,
            slot_number,
            alternatives,
        };
        list.list_size = list.wire_size();
        list
    }

    /// Size derived from the current contents.
    pub fn wire_size(&self) -> u32 {
        IO_RESOURCE_REQUIREMENTS_HEADER_SIZE
            + self
                .alternatives
                .iter()
                .map(|l| IO_RESOURCE_LIST_HEADER_SIZE + l.count() as u32 * IO_RESOURCE_DESCRIPTOR_SIZE)
                .sum::<u32>()
    }
}

// =============================================================================
// Assigned resources
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmResourceKind {
    Memory { start: PhysAddr, length: u32 },
    Port { start: u64, length: u32 },
    Interrupt { level: u32, vector: u32, affinity: u64 },
    DevicePrivate { data: [u32; 3] },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmPartialDescriptor {
    pub share: ShareDisposition,
    pub flags: u16,
    pub kind: CmResourceKind,
}

impl CmPartialDescriptor {
    pub fn memory(start: PhysAddr, length: u32) -> Self {
        Self {
            share: ShareDisposition::DeviceExclusive,
            flags: CM_RESOURCE_MEMORY_READ_WRITE | CM_RESOURCE_MEMORY_PREFETCHABLE,
            kind: CmResourceKind::Memory { start, length },
        }
    }

    fn is_private_marker(&self) -> bool {
        matches!(self.kind, CmResourceKind::DevicePrivate { data } if data[0] == AGP_PRIVATE_SIGNATURE)
    }
}

/// Resources assigned to a device at start.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmResourceList {
    pub descriptors: Vec<CmPartialDescriptor>,
}

impl CmResourceList {
    pub fn new(descriptors: Vec<CmPartialDescriptor>) -> Self {
        Self { descriptors }
    }
}

/// Outcome of a target start.
#[derive(Debug, PartialEq, Eq)]
pub enum StartDisposition {
    /// Pass `resources` to the next lower driver; `status` is the target's
    /// own result, reported once the lower driver has finished.
    Forward {
        resources: CmResourceList,
        status: AgpResult,
    },
    /// Fail the start without forwarding.
    Complete(AgpError),
}

// =============================================================================
// Host bridge strategy
// =============================================================================

/// Whether either end of `[start, end]` lies inside `[min, max]`, which also
/// covers `[min, max]` containing it whole.
fn collides(start: PhysAddr, end: PhysAddr, min: PhysAddr, max: PhysAddr) -> bool {
    (min <= start && start <= max) || (min <= end && end <= max)
}

/// Append the aperture to every alternative list.
///
/// Each list gains a private marker, a preferred descriptor for the current
/// aperture and the platform `requirements` as alternatives. When no
/// aperture is programmed, or the current one collides with a preferred
/// memory descriptor the BIOS already put in the list, the preferred
/// descriptor is left out and the first platform alternative is promoted in
/// its place so the OS arbitrates the window.
pub fn host_filter_requirements(
    list: &mut IoResourceRequirementsList,
    aperture: Option<ApertureInfo>,
    requirements: &[IoResourceDescriptor],
) {
    for (index, alt) in list.alternatives.iter_mut().enumerate() {
        let preferred = aperture.filter(|a| a.pages > 0).map(|a| {
            IoResourceDescriptor::aperture_memory(
                IoResourceOption::PREFERRED,
                a.base,
                a.last_byte(),
                a.len_bytes(),
            )
        });

        let conflict = match aperture.filter(|a| a.pages > 0) {
            None => true,
            Some(a) => alt
                .descriptors
                .iter()
                .filter_map(|d| d.preferred_memory())
                .any(|(min, max)| collides(a.base, a.last_byte(), min, max)),
        };

        let mut appended: Vec<IoResourceDescriptor> = Vec::with_capacity(requirements.len() + 2);
        let mut alternatives = requirements.iter().copied().map(|mut d| {
            d.option = IoResourceOption::ALTERNATIVE;
            d
        });

        match (conflict, preferred) {
            (false, Some(preferred)) => {
                appended.push(IoResourceDescriptor::private_marker(1 + requirements.len() as u32));
                appended.push(preferred);
                appended.extend(alternatives);
            }
            _ => {
                klog_info!(
                    "agp: alternative list {}: aperture conflicts or is unset, letting the OS choose",
                    index
                );
                appended.push(IoResourceDescriptor::private_marker(requirements.len() as u32));
                if let Some(mut first) = alternatives.next() {
                    first.option = IoResourceOption::PREFERRED;
                    appended.push(first);
                }
                appended.extend(alternatives);
            }
        }

        list.list_size += appended.len() as u32 * IO_RESOURCE_DESCRIPTOR_SIZE;
        alt.descriptors.extend(appended);
    }
    klog_debug!(
        "agp: host filter produced {} lists, {} bytes",
        list.alternatives.len(),
        list.list_size
    );
}

/// Find and strip the private marker and the aperture descriptor behind it.
/// Returns the remaining list and the assigned aperture, if any.
pub fn host_extract_aperture(
    mut resources: CmResourceList,
) -> (CmResourceList, Option<(PhysAddr, u32)>) {
    let Some(marker) = resources.descriptors.iter().position(|d| d.is_private_marker()) else {
        return (resources, None);
    };
    let aperture = match resources.descriptors.get(marker + 1).map(|d| d.kind) {
        Some(CmResourceKind::Memory { start, length }) => {
            resources.descriptors.drain(marker..marker + 2);
            Some((start, length))
        }
        _ => {
            resources.descriptors.remove(marker);
            None
        }
    };
    (resources, aperture)
}

/// Program the aperture from the assigned list and forward the stripped
/// remainder, whatever the outcome.
pub fn host_start(
    resources: CmResourceList,
    set_aperture: impl FnOnce(PhysAddr, u32) -> AgpResult,
) -> StartDisposition {
    let (resources, aperture) = host_extract_aperture(resources);
    let status = match aperture {
        Some((base, length)) => set_aperture(base, (length as u64 / PAGE_SIZE) as u32),
        None => {
            klog_warn!("agp: no aperture among assigned resources");
            Err(AgpError::NoAperture)
        }
    };
    StartDisposition::Forward { resources, status }
}

// =============================================================================
// AGP3 bridge strategy
// =============================================================================

/// Splice the platform requirements behind the aperture BAR of the first
/// alternative list and return the BAR's index in the assigned list.
///
/// The aperture BAR is the preferred memory descriptor starting at the
/// current aperture base. Its index in the assigned list counts only the
/// non-alternative descriptors before it, since the OS assigns one resource
/// per descriptor group.
pub fn agp3_filter_requirements(
    list: &mut IoResourceRequirementsList,
    aperture: Option<ApertureInfo>,
    requirements: &[IoResourceDescriptor],
) -> AgpResult<usize> {
    let aperture = aperture.ok_or(AgpError::InvalidParameter)?;
    let alt = list
        .alternatives
        .first_mut()
        .ok_or(AgpError::InvalidParameter)?;

    let Some(found) = alt
        .descriptors
        .iter()
        .position(|d| matches!(d.preferred_memory(), Some((min, _)) if min == aperture.base))
    else {
        klog_warn!(
            "agp: no preferred memory descriptor at {:#x}, AGP stays disabled",
            aperture.base
        );
        return Err(AgpError::InvalidParameter);
    };

    let resource_index = alt.descriptors[..found]
        .iter()
        .filter(|d| !d.is_alternative())
        .count();

    let mut removed = 0;
    if alt
        .descriptors
        .get(found + 1)
        .is_some_and(|d| d.is_alternative() && d.memory_window().is_some())
    {
        alt.descriptors.remove(found + 1);
        removed = 1;
    }

    let inserted = requirements.iter().copied().map(|mut d| {
        d.option = IoResourceOption::ALTERNATIVE;
        d
    });
    alt.descriptors.splice(found + 1..found + 1, inserted);

    list.list_size = list.list_size + requirements.len() as u32 * IO_RESOURCE_DESCRIPTOR_SIZE
        - removed * IO_RESOURCE_DESCRIPTOR_SIZE;
    klog_debug!("agp: aperture is assigned resource {}", resource_index);
    Ok(resource_index)
}

/// Program the aperture from the descriptor at `resource_index`. Nothing is
/// stripped; a failure completes the start without forwarding.
pub fn agp3_start(
    resources: CmResourceList,
    resource_index: usize,
    set_aperture: impl FnOnce(PhysAddr, u32) -> AgpResult,
) -> StartDisposition {
    let status = match resources.descriptors.get(resource_index).map(|d| d.kind) {
        Some(CmResourceKind::Memory { start, length }) => {
            set_aperture(start, (length as u64 / PAGE_SIZE) as u32)
        }
        _ => Err(AgpError::NoAperture),
    };
    match status {
        Ok(()) => StartDisposition::Forward {
            resources,
            status: Ok(()),
        },
        Err(err) => StartDisposition::Complete(err),
    }
}

#[cfg(test)]
#[path = "resource_tests.rs"]
mod tests;
