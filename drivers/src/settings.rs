//! Load-time settings.
//!
//! Read once from a `key=value` source when the library loads and never
//! re-read. Unknown keys are ignored so one source can be shared with other
//! consumers.
//!
//! | key                  | value                                        |
//! |----------------------|----------------------------------------------|
//! | `verifier`           | hex mask, or `guard`/`config`/`corruption` joined by `,` or `|` |
//! | `verifier.policy`    | `halt` or `report`                           |
//! | `max_address`        | highest physical address usable for backing  |
//! | `cache_flush`        | `invalidate` or `none`                       |
//! | `log`                | klog level name                              |
//! | `hack.<key>`         | global quirk row, hex flags                  |
//! | `devicehack.<key>`   | per-installation quirk row, hex flags        |

use agplib_abi::PhysAddr;
use agplib_lib::cmdline::{pairs, parse_u64};
use agplib_lib::{CacheFlush, KlogLevel, klog_warn};

use crate::device_flags::DeviceFlagsTable;
use crate::verifier::{IntegrityPolicy, VerifierFlags};

const DEFAULT_MAX_ADDRESS: PhysAddr = PhysAddr::MAX_32BIT;

#[derive(Clone, Debug)]
pub struct AgpSettings {
    pub verifier: VerifierFlags,
    pub policy: IntegrityPolicy,
    pub max_address: PhysAddr,
    pub cache_flush: CacheFlush,
    pub log_level: Option<KlogLevel>,
    pub global_hacks: DeviceFlagsTable,
    pub device_hacks: DeviceFlagsTable,
}

impl Default for AgpSettings {
    fn default() -> Self {
        Self {
            verifier: VerifierFlags::empty(),
            policy: IntegrityPolicy::Halt,
            max_address: DEFAULT_MAX_ADDRESS,
            cache_flush: CacheFlush::default(),
            log_level: None,
            global_hacks: DeviceFlagsTable::new(),
            device_hacks: DeviceFlagsTable::new(),
        }
    }
}

impl AgpSettings {
    pub fn parse(source: &str) -> Self {
        let mut settings = Self::default();
        for (key, value) in pairs(source) {
            settings.apply(key, value);
        }
        settings
    }

    fn apply(&mut self, key: &str, value: &str) {
        if let Some(hack) = key.strip_prefix("hack.") {
            if !self.global_hacks.push_key(hack, value) {
                klog_warn!("agp: ignoring malformed quirk {}={}", key, value);
            }
            return;
        }
        if let Some(hack) = key.strip_prefix("devicehack.") {
            if !self.device_hacks.push_key(hack, value) {
                klog_warn!("agp: ignoring malformed quirk {}={}", key, value);
            }
            return;
        }

        match key {
            "verifier" => match parse_verifier_flags(value) {
                Some(flags) => self.verifier = flags,
                None => klog_warn!("agp: bad verifier flags '{}'", value),
            },
            "verifier.policy" => match IntegrityPolicy::from_name(value) {
                Some(policy) => self.policy = policy,
                None => klog_warn!("agp: bad verifier policy '{}'", value),
            },
            "max_address" => match parse_u64(value) {
                Some(addr) => self.max_address = PhysAddr::new(addr),
                None => klog_warn!("agp: bad max_address '{}'", value),
            },
            "cache_flush" => match CacheFlush::from_name(value) {
                Some(flush) => self.cache_flush = flush,
                None => klog_warn!("agp: bad cache_flush '{}'", value),
            },
            "log" => self.log_level = KlogLevel::from_name(value),
            _ => {}
        }
    }
}

fn parse_verifier_flags(value: &str) -> Option<VerifierFlags> {
    if let Some(bits) = parse_u64(value) {
        return Some(VerifierFlags::from_bits_truncate(bits as u32));
    }
    let mut flags = VerifierFlags::empty();
    for name in value.split([',', '|']).filter(|n| !n.is_empty()) {
        flags |= match name {
            "guard" => VerifierFlags::GUARD_PAGE,
            "config" => VerifierFlags::CONFIG_TAMPER,
            "corruption" => VerifierFlags::GART_CORRUPTION,
            "all" => VerifierFlags::all(),
            _ => return None,
        };
    }
    Some(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_flags::{DeviceFlags, DeviceIdentity};

    #[test]
    fn test_defaults() {
        let settings = AgpSettings::parse("");
        assert!(settings.verifier.is_empty());
        assert_eq!(settings.policy, IntegrityPolicy::Halt);
        assert_eq!(settings.max_address, PhysAddr(0xFFFF_FFFF));
        assert_eq!(settings.cache_flush, CacheFlush::InvalidateAll);
    }

    #[test]
    fn test_parse_full_source() {
        let settings = AgpSettings::parse(
            "verifier=guard,config verifier.policy=report max_address=0xFFFFFFFFF \
             cache_flush=none log=debug unrelated=1 \
             hack.80867190=1 devicehack.8086719003=200",
        );
        assert_eq!(
            settings.verifier,
            VerifierFlags::GUARD_PAGE | VerifierFlags::CONFIG_TAMPER
        );
        assert_eq!(settings.policy, IntegrityPolicy::ReportAndContinue);
        assert_eq!(settings.max_address, PhysAddr(0xF_FFFF_FFFF));
        assert_eq!(settings.cache_flush, CacheFlush::None);
        assert_eq!(settings.log_level, Some(KlogLevel::Debug));

        let id = DeviceIdentity {
            vendor: 0x8086,
            device: 0x7190,
            revision: 3,
            ..Default::default()
        };
        assert_eq!(settings.global_hacks.lookup(&id), DeviceFlags::NO_1X);
        assert_eq!(settings.device_hacks.lookup(&id), DeviceFlags::NO_FW_ENABLE);
    }

    #[test]
    fn test_numeric_verifier_mask_and_bad_values() {
        let settings = AgpSettings::parse("verifier=0x7 hack.bogus=1");
        assert_eq!(settings.verifier, VerifierFlags::all());
        assert!(settings.global_hacks.is_empty());

        let settings = AgpSettings::parse("verifier=guard,nonsense");
        assert!(settings.verifier.is_empty());
    }
}
