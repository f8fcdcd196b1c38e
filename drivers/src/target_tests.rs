use super::*;
use crate::gart::GartChipset;
use crate::master::MasterContext;
use crate::pci::{ConfigImage, SharedConfig};
use crate::pci_defs::PCI_BAR0_OFFSET;
use crate::resource::{
    AGP_PRIVATE_SIGNATURE, CmPartialDescriptor, CmResourceKind, IoResourceDescriptor,
    IoResourceList, IoResourceOption, ShareDisposition,
};
use crate::settings::AgpSettings;
use crate::test_fixtures::{
    AGP3_STATUS, APERTURE_BASE, APERTURE_PAGES, BRIDGE_CAP, Rig, SharedPool, adapter, agp3_bridge,
    host_bridge, test_settings,
};
use crate::verifier::{NullTimer, VerifierState};
use agplib_abi::capability::AGP_COMMAND_OFFSET;
use agplib_abi::{BugCheckCode, CachingType, PAGE_SIZE};
use alloc::vec;

fn bar_list() -> IoResourceRequirementsList {
    let bar = IoResourceDescriptor::aperture_memory(
        IoResourceOption::PREFERRED,
        PhysAddr(APERTURE_BASE),
        PhysAddr(APERTURE_BASE + 0x3F_FFFF),
        0x40_0000,
    );
    IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![bar])])
}

#[test]
fn test_attach_picks_strategy_from_capability_id() {
    let rig = Rig::new();
    assert_eq!(rig.target.kind(), TargetKind::Agp3Bridge);
    assert_eq!(rig.target.identity().vendor, 0x8086);
    assert_eq!(
        rig.target.aperture(),
        Some(ApertureInfo {
            base: PhysAddr(APERTURE_BASE),
            pages: APERTURE_PAGES,
        })
    );
    assert_eq!(rig.target.favored().num_ranges(), 0);

    let host = Rig::build(host_bridge(), test_settings(), 16);
    assert_eq!(host.target.kind(), TargetKind::HostBridge);
}

#[test]
fn test_attach_without_capability_fails() {
    let config = SharedConfig::new(ConfigImage::new(0x8086, 0x7190));
    let chipset = GartChipset::new(Arc::new(config.clone()));
    let result = TargetContext::attach(
        Arc::new(AgpGlobals::new(test_settings())),
        Arc::new(config),
        Box::new(chipset),
        Box::new(SharedPool::new(1)),
        Box::new(NullTimer),
    );
    assert_eq!(result.err(), Some(AgpError::NotImplemented));
}

#[test]
fn test_attach_arms_configured_verifier() {
    let settings = AgpSettings {
        verifier: VerifierFlags::GUARD_PAGE | VerifierFlags::CONFIG_TAMPER,
        ..test_settings()
    };
    let rig = Rig::build(agp3_bridge(), settings, 16);
    let state = rig.target.lock();
    assert_eq!(state.verifier().state(), VerifierState::Armed);
    assert_eq!(state.verifier().cached_command(), Some(Default::default()));
}

#[test]
fn test_host_filter_and_start_round_trip() {
    let rig = Rig::build(host_bridge(), test_settings(), 16);
    let mut list = IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![])]);
    rig.target.filter_requirements(&mut list).unwrap();
    // Marker, current aperture, one platform alternative.
    assert_eq!(list.alternatives[0].count(), 3);
    assert_eq!(rig.target.resource_index(), None);

    let marker = CmPartialDescriptor {
        share: ShareDisposition::DeviceExclusive,
        flags: 0,
        kind: CmResourceKind::DevicePrivate {
            data: [AGP_PRIVATE_SIGNATURE, 1, 0],
        },
    };
    let aperture = CmPartialDescriptor::memory(PhysAddr(0xD000_0000), 0x40_0000);
    match rig.target.start(CmResourceList::new(vec![marker, aperture])) {
        StartDisposition::Forward { resources, status } => {
            assert!(resources.descriptors.is_empty());
            assert_eq!(status, Ok(()));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rig.target.aperture().unwrap().base, PhysAddr(0xD000_0000));
}

#[test]
fn test_agp3_filter_then_start_moves_aperture() {
    let rig = Rig::new();
    let mut list = bar_list();
    rig.target.filter_requirements(&mut list).unwrap();
    assert_eq!(rig.target.resource_index(), Some(0));
    assert_eq!(list.alternatives[0].count(), 2);

    let assigned = CmResourceList::new(vec![CmPartialDescriptor::memory(
        PhysAddr(0xD000_0000),
        0x40_0000,
    )]);
    assert!(matches!(
        rig.target.start(assigned),
        StartDisposition::Forward { status: Ok(()), .. }
    ));
    assert_eq!(
        rig.target.aperture(),
        Some(ApertureInfo {
            base: PhysAddr(0xD000_0000),
            pages: APERTURE_PAGES,
        })
    );
    assert_eq!(
        rig.bridge.with(|image| image.peek_u32(PCI_BAR0_OFFSET)),
        0xD000_0000
    );
}

#[test]
fn test_agp3_start_before_filter_completes_with_error() {
    let rig = Rig::new();
    let assigned = CmResourceList::new(vec![CmPartialDescriptor::memory(
        PhysAddr(0xD000_0000),
        0x40_0000,
    )]);
    assert_eq!(
        rig.target.start(assigned),
        StartDisposition::Complete(AgpError::NoAperture)
    );
}

#[test]
fn test_agp3_filter_without_bar_fails() {
    let rig = Rig::new();
    let mut list = IoResourceRequirementsList::new(0, 0, vec![IoResourceList::new(vec![])]);
    assert_eq!(
        rig.target.filter_requirements(&mut list),
        Err(AgpError::InvalidParameter)
    );
    assert_eq!(rig.target.resource_index(), None);
}

#[test]
fn test_stop_tears_down_the_table() {
    let rig = Rig::new();
    let favored = rig.target.favored();
    {
        let mut state = rig.target.lock();
        let handle = state.reserve(4, CachingType::WriteCombined).unwrap();
        state.commit(handle, 4, 0, favored, false).unwrap();
    }
    assert_eq!(rig.gart.valid_entries(), 4);
    rig.target.stop();
    assert!(rig.gart.is_empty());
}

#[test]
fn test_one_master_per_target() {
    let rig = Rig::new();
    let (first, _config) = rig.master(AGP3_STATUS);
    assert!(Arc::ptr_eq(&rig.target.master().unwrap(), &first));

    let second = SharedConfig::new(adapter(AGP3_STATUS));
    assert_eq!(
        MasterContext::attach(&rig.target, Arc::new(second.clone())).err(),
        Some(AgpError::DeviceBusy)
    );

    drop(first);
    assert!(rig.target.master().is_none());
    assert!(MasterContext::attach(&rig.target, Arc::new(second)).is_ok());
}

#[test]
fn test_capability_readout_is_recorded_for_management() {
    let rig = Rig::new();
    let readout = rig.target.capability().unwrap();
    assert_eq!(readout.offset, BRIDGE_CAP);
    assert!(readout.is_agp3());
    assert_eq!(
        rig.target.globals().last_capability().0,
        readout.capability.status
    );
}

#[test]
fn test_verifier_catches_tampered_command_through_target() {
    let rig = Rig::new();
    rig.target
        .set_verifier_flags(VerifierFlags::CONFIG_TAMPER)
        .unwrap();
    rig.bridge
        .with(|image| image.poke_u32(BRIDGE_CAP + AGP_COMMAND_OFFSET, 0x0000_0302));

    let mut found = None;
    for _ in 0..16 {
        if let Some(violation) = rig.target.verifier_tick().violation {
            found = Some(violation);
        }
    }
    let violation = found.unwrap();
    assert_eq!(violation.code, BugCheckCode::AgpIllegallyReprogrammed);
    assert_eq!(violation.params, [0, 0x302]);
}

#[test]
fn test_driver_writes_are_not_tamper() {
    let rig = Rig::new();
    rig.target
        .set_verifier_flags(VerifierFlags::CONFIG_TAMPER)
        .unwrap();
    let mut cap = rig.target.capability().unwrap().capability;
    cap.command.set_agp_enable(1);
    rig.target.set_capability(&cap).unwrap();

    for _ in 0..32 {
        assert_eq!(rig.target.verifier_tick().violation, None);
    }
}

#[test]
fn test_sleep_suppresses_config_check() {
    let rig = Rig::new();
    rig.target
        .set_verifier_flags(VerifierFlags::CONFIG_TAMPER)
        .unwrap();
    rig.target.system_power_changed(SystemPower::Sleeping);
    rig.bridge
        .with(|image| image.poke_u32(BRIDGE_CAP + AGP_COMMAND_OFFSET, 0x0000_0302));
    for _ in 0..16 {
        assert_eq!(rig.target.verifier_tick().violation, None);
    }
    rig.target.system_power_changed(SystemPower::Working);
    for _ in 0..16 {
        assert_eq!(rig.target.verifier_tick().violation, None);
    }
}

#[test]
fn test_physical_memory_helpers() {
    let rig = Rig::new();
    rig.pool.set_budget(Some(3));
    assert!(rig.target.allocate_physical_memory_exact(4 * PAGE_SIZE).is_none());
    assert_eq!(rig.pool.allocated(), 0);

    rig.pool.set_budget(None);
    let pages = rig.target.allocate_physical_memory(4 * PAGE_SIZE).unwrap();
    assert_eq!(pages.len(), 4);
    assert_eq!(rig.pool.allocated(), 4);
    rig.target.free_physical_memory(pages);
    assert_eq!(rig.pool.allocated(), 0);
}
