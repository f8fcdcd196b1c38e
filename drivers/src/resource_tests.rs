use super::*;
use alloc::vec;
use core::cell::Cell;

const APERTURE: ApertureInfo = ApertureInfo {
    base: PhysAddr(0xE000_0000),
    pages: 1024,
};

fn memory(option: IoResourceOption, min: u64, max: u64, length: u32) -> IoResourceDescriptor {
    IoResourceDescriptor::aperture_memory(option, PhysAddr(min), PhysAddr(max), length)
}

fn port() -> IoResourceDescriptor {
    IoResourceDescriptor {
        option: IoResourceOption::empty(),
        share: ShareDisposition::DeviceExclusive,
        flags: 0,
        kind: IoResourceKind::Port {
            min: 0xCF8,
            max: 0xCFF,
            length: 8,
            alignment: 1,
        },
    }
}

fn platform_requirements(count: usize) -> Vec<IoResourceDescriptor> {
    (0..count)
        .map(|i| {
            let length = 0x40_0000u32 >> i;
            memory(IoResourceOption::ALTERNATIVE, 0, 0xFFFF_FFFF, length)
        })
        .collect()
}

fn marker_following(descriptor: &IoResourceDescriptor) -> Option<u32> {
    match descriptor.kind {
        IoResourceKind::DevicePrivate { data } if data[0] == AGP_PRIVATE_SIGNATURE => Some(data[1]),
        _ => None,
    }
}

fn cm_marker() -> CmPartialDescriptor {
    CmPartialDescriptor {
        share: ShareDisposition::DeviceExclusive,
        flags: 0,
        kind: CmResourceKind::DevicePrivate {
            data: [AGP_PRIVATE_SIGNATURE, 1, 0],
        },
    }
}

fn cm_port() -> CmPartialDescriptor {
    CmPartialDescriptor {
        share: ShareDisposition::DeviceExclusive,
        flags: 0,
        kind: CmResourceKind::Port {
            start: 0xCF8,
            length: 8,
        },
    }
}

// =============================================================================
// Host bridge
// =============================================================================

#[test]
fn test_host_filter_appends_preferred_aperture_to_every_list() {
    let bios = memory(IoResourceOption::empty(), 0xF000_0000, 0xF0FF_FFFF, 0x100_0000);
    let mut list = IoResourceRequirementsList::new(
        0,
        0,
        vec![
            IoResourceList::new(vec![port(), bios]),
            IoResourceList::new(vec![port()]),
        ],
    );
    let before = list.list_size;
    let requirements = platform_requirements(3);

    host_filter_requirements(&mut list, Some(APERTURE), &requirements);

    let first = &list.alternatives[0].descriptors;
    assert_eq!(first.len(), 2 + 2 + 3);
    assert_eq!(marker_following(&first[2]), Some(4));
    assert_eq!(
        first[3].kind,
        IoResourceKind::Memory {
            min: APERTURE.base,
            max: APERTURE.last_byte(),
            length: 0x40_0000,
            alignment: 0x40_0000,
        }
    );
    assert_eq!(first[3].option, IoResourceOption::PREFERRED);
    assert!(first[4..].iter().all(IoResourceDescriptor::is_alternative));

    assert_eq!(list.alternatives[1].count(), 1 + 2 + 3);
    assert_eq!(list.list_size, before + 2 * 5 * IO_RESOURCE_DESCRIPTOR_SIZE);
    assert_eq!(list.list_size, list.wire_size());
}

#[test]
fn test_host_filter_conflict_promotes_first_alternative() {
    // The BIOS claimed a window that contains the current aperture.
    let bios = memory(IoResourceOption::empty(), 0xD000_0000, 0xEFFF_FFFF, 0x2000_0000);
    let mut list = IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![bios])]);
    let requirements = platform_requirements(2);

    host_filter_requirements(&mut list, Some(APERTURE), &requirements);

    let descriptors = &list.alternatives[0].descriptors;
    assert_eq!(descriptors.len(), 1 + 1 + 2);
    assert_eq!(marker_following(&descriptors[1]), Some(2));
    assert_eq!(descriptors[2].option, IoResourceOption::PREFERRED);
    assert_eq!(descriptors[2].memory_window(), Some((PhysAddr::NULL, 0x40_0000)));
    assert!(descriptors[3].is_alternative());
    assert_eq!(list.list_size, list.wire_size());
}

#[test]
fn test_host_filter_alternative_bios_ranges_do_not_conflict() {
    let bios = memory(IoResourceOption::ALTERNATIVE, 0xD000_0000, 0xEFFF_FFFF, 0x2000_0000);
    let mut list = IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![bios])]);
    host_filter_requirements(&mut list, Some(APERTURE), &platform_requirements(1));
    assert_eq!(list.alternatives[0].count(), 1 + 2 + 1);
}

#[test]
fn test_host_filter_without_aperture_lets_os_choose() {
    let mut list = IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![port()])]);
    host_filter_requirements(&mut list, None, &platform_requirements(1));

    let descriptors = &list.alternatives[0].descriptors;
    assert_eq!(descriptors.len(), 1 + 1 + 1);
    assert_eq!(marker_following(&descriptors[1]), Some(1));
    assert_eq!(descriptors[2].option, IoResourceOption::PREFERRED);
}

#[test]
fn test_host_start_strips_private_descriptors() {
    let bios = CmPartialDescriptor::memory(PhysAddr(0xF000_0000), 0x100_0000);
    let aperture = CmPartialDescriptor::memory(PhysAddr(0xD000_0000), 0x80_0000);
    let resources = CmResourceList::new(vec![bios, cm_marker(), aperture, cm_port()]);

    let programmed = Cell::new(None);
    let disposition = host_start(resources, |base, pages| {
        programmed.set(Some((base, pages)));
        Ok(())
    });

    assert_eq!(programmed.get(), Some((PhysAddr(0xD000_0000), 2048)));
    assert_eq!(
        disposition,
        StartDisposition::Forward {
            resources: CmResourceList::new(vec![bios, cm_port()]),
            status: Ok(()),
        }
    );
}

#[test]
fn test_host_start_forwards_even_when_programming_fails() {
    let aperture = CmPartialDescriptor::memory(PhysAddr(0xD010_0000), 0x80_0000);
    let resources = CmResourceList::new(vec![cm_marker(), aperture]);
    let disposition = host_start(resources, |_, _| Err(AgpError::InvalidParameter));
    assert_eq!(
        disposition,
        StartDisposition::Forward {
            resources: CmResourceList::default(),
            status: Err(AgpError::InvalidParameter),
        }
    );
}

#[test]
fn test_host_start_without_aperture() {
    let resources = CmResourceList::new(vec![cm_port()]);
    let disposition = host_start(resources.clone(), |_, _| panic!("nothing to program"));
    assert_eq!(
        disposition,
        StartDisposition::Forward {
            resources,
            status: Err(AgpError::NoAperture),
        }
    );

    // A marker without its memory descriptor is still stripped.
    let resources = CmResourceList::new(vec![cm_marker(), cm_port()]);
    let (rest, aperture) = host_extract_aperture(resources);
    assert_eq!(aperture, None);
    assert_eq!(rest.descriptors, vec![cm_port()]);
}

// =============================================================================
// AGP3 bridge
// =============================================================================

fn agp3_list() -> IoResourceRequirementsList {
    let bar = memory(IoResourceOption::PREFERRED, APERTURE.base.0, APERTURE.last_byte().0, 0x40_0000);
    let bus_alternative = memory(IoResourceOption::ALTERNATIVE, 0, 0xFFFF_FFFF, 0x40_0000);
    let mmio = memory(IoResourceOption::empty(), 0xF000_0000, 0xF000_0FFF, 0x1000);
    IoResourceRequirementsList::new(
        0,
        0,
        vec![IoResourceList::new(vec![
            port(),
            memory(IoResourceOption::ALTERNATIVE, 0, 0xFFFF, 0x10),
            bar,
            bus_alternative,
            mmio,
        ])],
    )
}

#[test]
fn test_agp3_filter_splices_behind_the_bar() {
    let mut list = agp3_list();
    let before = list.list_size;
    let requirements = platform_requirements(3);

    let index = agp3_filter_requirements(&mut list, Some(APERTURE), &requirements).unwrap();
    assert_eq!(index, 1);

    let descriptors = &list.alternatives[0].descriptors;
    assert_eq!(descriptors.len(), 5 - 1 + 3);
    assert_eq!(descriptors[2].memory_window(), Some((APERTURE.base, 0x40_0000)));
    for (got, want) in descriptors[3..6].iter().zip(&requirements) {
        assert_eq!(got.kind, want.kind);
        assert!(got.is_alternative());
    }
    assert_eq!(
        descriptors[6].memory_window(),
        Some((PhysAddr(0xF000_0000), 0x1000))
    );
    assert_eq!(list.list_size, before + 2 * IO_RESOURCE_DESCRIPTOR_SIZE);
    assert_eq!(list.list_size, list.wire_size());
}

#[test]
fn test_agp3_filter_keeps_non_memory_follower() {
    let bar = memory(IoResourceOption::PREFERRED, APERTURE.base.0, APERTURE.last_byte().0, 0x40_0000);
    let mut list =
        IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![bar, port()])]);
    let index = agp3_filter_requirements(&mut list, Some(APERTURE), &platform_requirements(1)).unwrap();
    assert_eq!(index, 0);
    assert_eq!(list.alternatives[0].count(), 3);
    assert_eq!(list.list_size, list.wire_size());
}

#[test]
fn test_agp3_filter_requires_a_matching_bar() {
    let mut list = agp3_list();
    let moved = ApertureInfo {
        base: PhysAddr(0xC000_0000),
        pages: 1024,
    };
    assert_eq!(
        agp3_filter_requirements(&mut list, Some(moved), &platform_requirements(1)),
        Err(AgpError::InvalidParameter)
    );
    assert_eq!(list, agp3_list());
    assert_eq!(
        agp3_filter_requirements(&mut list, None, &platform_requirements(1)),
        Err(AgpError::InvalidParameter)
    );
}

#[test]
fn test_agp3_start_programs_the_indexed_bar() {
    let resources = CmResourceList::new(vec![
        cm_port(),
        CmPartialDescriptor::memory(PhysAddr(0xD000_0000), 0x40_0000),
    ]);
    let programmed = Cell::new(None);
    let disposition = agp3_start(resources.clone(), 1, |base, pages| {
        programmed.set(Some((base, pages)));
        Ok(())
    });
    assert_eq!(programmed.get(), Some((PhysAddr(0xD000_0000), 1024)));
    assert_eq!(
        disposition,
        StartDisposition::Forward {
            resources: resources.clone(),
            status: Ok(()),
        }
    );

    assert_eq!(
        agp3_start(resources.clone(), 0, |_, _| Ok(())),
        StartDisposition::Complete(AgpError::NoAperture)
    );
    assert_eq!(
        agp3_start(resources, 1, |_, _| Err(AgpError::DeviceBusy)),
        StartDisposition::Complete(AgpError::DeviceBusy)
    );
}
