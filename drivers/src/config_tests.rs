use super::*;
use crate::device_flags::{DeviceFlagsTable, HackEntry};
use crate::pci::{ConfigImage, SharedConfig};
use crate::pci_defs::PCI_CAP_PTR_OFFSET;
use crate::settings::AgpSettings;
use crate::test_fixtures::{
    ADAPTER_CAP, AGP2_STATUS, AGP3_STATUS, BRIDGE_CAP, adapter, agp3_bridge, host_bridge,
};
use agplib_abi::capability::AgpStatus;

const PCI_CAPABILITY_ID_MSI: u8 = 0x05;

fn shared(image: ConfigImage) -> SharedConfig {
    SharedConfig::new(image)
}

#[test]
fn test_finds_agp_and_agp3_target_capabilities() {
    let (offset, header) = find_agp_capability(&shared(adapter(AGP2_STATUS))).unwrap();
    assert_eq!(offset, ADAPTER_CAP);
    assert_eq!(header.vendor_id, 0x10DE);

    let (offset, _) = find_agp_capability(&shared(agp3_bridge())).unwrap();
    assert_eq!(offset, BRIDGE_CAP);
}

#[test]
fn test_walks_past_other_capabilities() {
    let mut image = ConfigImage::new(0x1002, 0x5960);
    image
        .add_capability(0x40, PCI_CAPABILITY_ID_MSI, &[0; 6])
        .add_capability(0x58, PCI_CAPABILITY_ID_AGP, &[0x20, 0, 0x07, 0, 0, 0]);
    let (offset, _) = find_agp_capability(&shared(image)).unwrap();
    assert_eq!(offset, 0x58);
}

#[test]
fn test_missing_capability_is_not_implemented() {
    let bare = ConfigImage::new(0x8086, 0x1234);
    assert_eq!(
        find_agp_capability(&shared(bare)).err(),
        Some(AgpError::NotImplemented)
    );

    let mut msi_only = ConfigImage::new(0x8086, 0x1234);
    msi_only.add_capability(0x40, PCI_CAPABILITY_ID_MSI, &[0; 6]);
    assert_eq!(
        get_capability(&shared(msi_only), &AgpGlobals::default()).err(),
        Some(AgpError::NotImplemented)
    );
}

#[test]
fn test_cyclic_chain_terminates() {
    let mut image = ConfigImage::new(0x8086, 0x1234);
    image
        .add_capability(0x40, PCI_CAPABILITY_ID_MSI, &[0; 6])
        .add_capability(0x50, PCI_CAPABILITY_ID_MSI, &[0; 6]);
    // 0x50 points back at 0x40.
    image.poke(0x51, 0x40);
    assert_eq!(
        find_agp_capability(&shared(image)).err(),
        Some(AgpError::NotImplemented)
    );
}

#[test]
fn test_cardbus_header_uses_its_own_root() {
    let mut image = ConfigImage::new(0x104C, 0xAC50);
    image
        .set_header_type(0x02)
        .add_capability(0x80, PCI_CAPABILITY_ID_AGP, &[0x20, 0, 0x07, 0, 0, 0]);
    assert_eq!(image.peek(PCI_CAP_PTR_OFFSET), 0);
    let (offset, _) = find_agp_capability(&shared(image)).unwrap();
    assert_eq!(offset, 0x80);
}

#[test]
fn test_config_access_failure_propagates() {
    let mut image = adapter(AGP2_STATUS);
    image.fail_accesses_at(Some(ADAPTER_CAP));
    assert_eq!(
        find_agp_capability(&shared(image)).err(),
        Some(AgpError::ConfigAccess { offset: ADAPTER_CAP })
    );
}

#[test]
fn test_agp2_quirks_mask_rates_sba_and_fast_write() {
    let mut cap = AgpCapability {
        status: AgpStatus(AGP2_STATUS),
        ..Default::default()
    };
    apply_quirks(
        &mut cap,
        DeviceFlags::NO_1X | DeviceFlags::NO_4X | DeviceFlags::NO_SBA_ENABLE | DeviceFlags::NO_FW_ENABLE,
    );
    assert_eq!(cap.status.rate(), PCI_AGP_RATE_2X);
    assert_eq!(cap.status.side_band_addressing(), 0);
    assert_eq!(cap.status.fast_write(), 0);
    assert_eq!(cap.status.request_queue_depth_max(), AgpStatus(AGP2_STATUS).request_queue_depth_max());
}

#[test]
fn test_agp3_quirks_use_the_remapped_rate_bits() {
    let mut cap = AgpCapability {
        status: AgpStatus(AGP3_STATUS),
        ..Default::default()
    };
    // 1X and 2X do not exist in AGP3 mode, SBA is mandatory.
    apply_quirks(
        &mut cap,
        DeviceFlags::NO_1X | DeviceFlags::NO_2X | DeviceFlags::NO_SBA_ENABLE,
    );
    assert_eq!(cap.status.rate(), 0x3);
    assert_eq!(cap.status.side_band_addressing(), 1);

    apply_quirks(&mut cap, DeviceFlags::NO_8X);
    assert_eq!(cap.status.rate(), 0x1);
    apply_quirks(&mut cap, DeviceFlags::NO_4X);
    assert_eq!(cap.status.rate(), 0);
    assert!(cap.status.is_agp3());
}

#[test]
fn test_get_capability_applies_quirks_to_the_copy_only() {
    let mut settings = AgpSettings::default();
    settings.global_hacks =
        DeviceFlagsTable::from_raw(&[HackEntry::new(0x10DE, 0x0110, DeviceFlags::NO_4X)]);
    let globals = AgpGlobals::new(settings);
    let config = shared(adapter(AGP2_STATUS));

    let readout = get_capability(&config, &globals).unwrap();
    assert_eq!(readout.offset, ADAPTER_CAP);
    assert_eq!(readout.flags, DeviceFlags::NO_4X);
    assert_eq!(readout.capability.status.rate(), PCI_AGP_RATE_1X | PCI_AGP_RATE_2X);
    assert!(!readout.is_agp3());
    assert_eq!(
        config.with(|image| image.peek_u32(ADAPTER_CAP + 4)),
        AGP2_STATUS
    );
    assert_eq!(globals.last_capability().0, readout.capability.status);
}

#[test]
fn test_session_override_reaches_readout() {
    let globals = AgpGlobals::default();
    globals
        .flags_registry()
        .add_session_override(DeviceFlags::NO_FW_ENABLE);
    let readout = get_capability(&shared(agp3_bridge()), &globals).unwrap();
    assert!(readout.flags.contains(DeviceFlags::NO_FW_ENABLE));
    assert_eq!(readout.capability.status.fast_write(), 0);
    assert!(readout.is_agp3());
}

#[test]
fn test_set_capability_writes_only_the_command() {
    let config = shared(host_bridge());
    let mut cap = get_capability(&config, &AgpGlobals::default())
        .unwrap()
        .capability;
    cap.status = AgpStatus(0);
    cap.next = 0x44;
    cap.command.set_rate(PCI_AGP_RATE_4X);
    cap.command.set_agp_enable(1);

    set_capability(&config, &cap).unwrap();
    assert_eq!(get_command(&config).unwrap(), cap.command);
    config.with(|image| {
        assert_eq!(image.peek_u32(BRIDGE_CAP + 4), AGP2_STATUS);
        assert_eq!(image.peek(BRIDGE_CAP + 1), 0);
    });
}

#[test]
fn test_extended_registers() {
    let config = shared(agp3_bridge());
    assert_eq!(
        get_extended(&config, ExtendedRegister::ApertureSize).unwrap(),
        0xF3F
    );

    set_extended(&config, ExtendedRegister::GartLow, 0x1234_5000).unwrap();
    set_extended(&config, ExtendedRegister::AperturePageSize, 0x1).unwrap();
    assert_eq!(
        get_extended(&config, ExtendedRegister::GartLow).unwrap(),
        0x1234_5000
    );
    // The 16-bit write leaves its neighbour alone.
    assert_eq!(
        get_extended(&config, ExtendedRegister::ApertureSize).unwrap(),
        0xF3F
    );
    assert_eq!(
        set_extended(&config, ExtendedRegister::IsochStatus, 0),
        Err(AgpError::NotImplemented)
    );
}

#[test]
fn test_capability_at_end_of_config_space() {
    let mut body = [0u8; 10];
    body[0] = 0x30;
    body[2..6].copy_from_slice(&AGP3_STATUS.to_le_bytes());
    let mut image = ConfigImage::new(0x8086, 0x2570);
    image.add_capability(0xF0, PCI_CAPABILITY_ID_AGP_TARGET, &body);
    let config = shared(image);

    // The block itself fits, so the command register is still reachable.
    assert_eq!(get_command(&config).unwrap(), AgpCommand(0));
    assert_eq!(get_extended(&config, ExtendedRegister::IsochStatus), Ok(0));

    // Registers that would land past 0xFF are refused.
    let refused = Err(AgpError::ConfigAccess { offset: 0xF0 });
    assert_eq!(get_extended(&config, ExtendedRegister::AgpControl), refused);
    assert_eq!(get_extended(&config, ExtendedRegister::GartHigh), refused);
    assert_eq!(
        set_extended(&config, ExtendedRegister::GartHigh, 0x1),
        refused.map(|_| ())
    );
}

#[test]
fn test_identity_ignores_bridge_subsystem() {
    let mut image = host_bridge();
    image.set_subsystem(0x1043, 0x8000);
    let (_, header) = find_agp_capability(&shared(image)).unwrap();
    let id = device_identity(&header);
    assert_eq!((id.subvendor, id.subsystem), (0, 0));
    assert_eq!(id.revision, 0x02);

    let mut image = adapter(AGP2_STATUS);
    image.set_subsystem(0x1043, 0x8000);
    let (_, header) = find_agp_capability(&shared(image)).unwrap();
    let id = device_identity(&header);
    assert_eq!((id.subvendor, id.subsystem), (0x1043, 0x8000));
}

#[test]
fn test_master_device_id() {
    assert_eq!(
        master_device_id(&shared(adapter(AGP3_STATUS))).unwrap(),
        (0x10DE, 0x0110)
    );
}
