//! AGP verifier.
//!
//! A periodic background check that the aperture has not been tampered
//! with. While armed, every tick runs under the target lock and may:
//!
//! - scan the canary page for words that lost their signature,
//! - compare the live bridge command register with the last value the
//!   driver wrote,
//! - run the platform's GART worker.
//!
//! The worker is expensive and only runs every [`CORRUPTION_CHECK_PERIOD`]
//! ticks, replacing the canary scan on those ticks. The config check runs
//! every [`CONFIG_CHECK_PERIOD`] ticks.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use agplib_abi::capability::AgpCommand;
use agplib_abi::{AgpResult, BugCheckCode, IntegrityViolation};
use agplib_lib::{klog_debug, klog_error, klog_info, klog_warn};
use bitflags::bitflags;

pub const CORRUPTION_CHECK_PERIOD: u64 = 4;
pub const CONFIG_CHECK_PERIOD: u64 = 16;
pub const VERIFIER_PERIOD_MS: u32 = 1000;

pub const CANARY_SIGNATURE: u32 = 0xA6E5_A6E5;
/// One page of 32-bit words.
pub const CANARY_WORDS: usize = 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VerifierFlags: u32 {
        const GUARD_PAGE = 1 << 0;
        const CONFIG_TAMPER = 1 << 1;
        const GART_CORRUPTION = 1 << 2;
    }
}

/// What happens when a tick finds the aperture compromised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IntegrityPolicy {
    /// Stop the machine. Panicking is the kernel's halt path.
    #[default]
    Halt,
    /// Log the finding, return it from the tick and keep going.
    ReportAndContinue,
}

impl IntegrityPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("halt") {
            Some(Self::Halt)
        } else if name.eq_ignore_ascii_case("report") {
            Some(Self::ReportAndContinue)
        } else {
            None
        }
    }
}

/// How the bridge command register is written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CapabilitySetStrategy {
    /// Plain write.
    #[default]
    Direct,
    /// Write and refresh the verifier's cached copy.
    VerifierLocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifierState {
    Disabled,
    Armed,
}

/// Host hook that schedules [`crate::target::TargetContext::verifier_tick`].
pub trait VerifierTimer: Send {
    fn arm(&mut self, period_ms: u32);
    fn cancel(&mut self);
}

/// Timer that schedules nothing; ticks are driven by hand.
pub struct NullTimer;

impl VerifierTimer for NullTimer {
    fn arm(&mut self, _period_ms: u32) {}
    fn cancel(&mut self) {}
}

/// Which checks ran on a tick and what they found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub canary: bool,
    pub config: bool,
    pub worker: bool,
    pub violation: Option<IntegrityViolation>,
}

pub struct VerifierContext {
    flags: VerifierFlags,
    policy: IntegrityPolicy,
    strategy: CapabilitySetStrategy,
    canary: Vec<u32>,
    cached_command: Option<AgpCommand>,
    /// Config checks are off while the system is out of the working state.
    config_suspended: bool,
    ticks: u64,
    timer: Box<dyn VerifierTimer>,
}

impl VerifierContext {
    pub fn new(policy: IntegrityPolicy, timer: Box<dyn VerifierTimer>) -> Self {
        Self {
            flags: VerifierFlags::empty(),
            policy,
            strategy: CapabilitySetStrategy::Direct,
            canary: Vec::new(),
            cached_command: None,
            config_suspended: false,
            ticks: 0,
            timer,
        }
    }

    pub fn state(&self) -> VerifierState {
        if self.flags.is_empty() {
            VerifierState::Disabled
        } else {
            VerifierState::Armed
        }
    }

    pub fn flags(&self) -> VerifierFlags {
        self.flags
    }

    pub fn strategy(&self) -> CapabilitySetStrategy {
        self.strategy
    }

    pub fn cached_command(&self) -> Option<AgpCommand> {
        self.cached_command
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The canary page. Empty unless guard checking is on.
    pub fn canary_mut(&mut self) -> &mut [u32] {
        &mut self.canary
    }

    /// Switch the enabled checks. Arming caches the current command
    /// register and swaps in the verifier-locked set path; clearing every
    /// flag undoes both and cancels the timer.
    pub fn set_flags(
        &mut self,
        flags: VerifierFlags,
        read_command: impl FnOnce() -> AgpResult<AgpCommand>,
    ) -> AgpResult {
        let was_armed = self.state() == VerifierState::Armed;
        if flags.is_empty() {
            if was_armed {
                self.timer.cancel();
            }
            self.flags = flags;
            self.strategy = CapabilitySetStrategy::Direct;
            self.canary = Vec::new();
            self.cached_command = None;
            klog_info!("agp: verifier disabled");
            return Ok(());
        }

        if flags.contains(VerifierFlags::CONFIG_TAMPER) {
            self.cached_command = Some(read_command()?);
        } else {
            self.cached_command = None;
        }
        self.canary = if flags.contains(VerifierFlags::GUARD_PAGE) {
            vec![CANARY_SIGNATURE; CANARY_WORDS]
        } else {
            Vec::new()
        };
        self.flags = flags;
        self.strategy = CapabilitySetStrategy::VerifierLocked;
        if !was_armed {
            self.ticks = 0;
            self.timer.arm(VERIFIER_PERIOD_MS);
        }
        klog_info!("agp: verifier armed, flags {:#x}", flags.bits());
        Ok(())
    }

    /// The driver just wrote `command` to the bridge.
    pub fn record_command(&mut self, command: AgpCommand) {
        if self.flags.contains(VerifierFlags::CONFIG_TAMPER) {
            self.cached_command = Some(command);
        }
    }

    /// System power state changed. Leaving the working state suspends the
    /// config check; coming back re-caches the register and resumes it.
    pub fn system_power_changed(
        &mut self,
        working: bool,
        read_command: impl FnOnce() -> AgpResult<AgpCommand>,
    ) {
        if !self.flags.contains(VerifierFlags::CONFIG_TAMPER) {
            return;
        }
        if !working {
            self.config_suspended = true;
            klog_debug!("agp: verifier config check suspended");
            return;
        }
        match read_command() {
            Ok(command) => {
                self.cached_command = Some(command);
                self.config_suspended = false;
                klog_debug!("agp: verifier config check resumed");
            }
            Err(err) => klog_warn!("agp: could not re-cache command register: {}", err),
        }
    }

    /// One periodic tick. The caller holds the target lock.
    pub fn tick(
        &mut self,
        read_command: impl FnOnce() -> AgpResult<AgpCommand>,
        worker: impl FnOnce() -> Option<IntegrityViolation>,
    ) -> TickReport {
        let mut report = TickReport::default();
        if self.state() == VerifierState::Disabled {
            return report;
        }
        self.ticks += 1;

        let worker_tick = self.flags.contains(VerifierFlags::GART_CORRUPTION)
            && self.ticks % CORRUPTION_CHECK_PERIOD == 0;
        if worker_tick {
            report.worker = true;
            if let Some(violation) = worker() {
                self.raise(&mut report, violation);
            }
        } else if self.flags.contains(VerifierFlags::GUARD_PAGE) {
            report.canary = true;
            if let Some(violation) = self.scan_canary() {
                self.raise(&mut report, violation);
            }
        }

        if self.flags.contains(VerifierFlags::CONFIG_TAMPER)
            && !self.config_suspended
            && self.ticks % CONFIG_CHECK_PERIOD == 0
        {
            report.config = true;
            match read_command() {
                Ok(live) => {
                    if let Some(violation) = self.check_command(live) {
                        self.raise(&mut report, violation);
                    }
                }
                Err(err) => klog_warn!("agp: verifier could not read command register: {}", err),
            }
        }
        report
    }

    fn scan_canary(&self) -> Option<IntegrityViolation> {
        self.canary
            .iter()
            .position(|word| *word != CANARY_SIGNATURE)
            .map(|offset| {
                IntegrityViolation::new(
                    BugCheckCode::AgpInvalidAccess,
                    offset as u64,
                    self.canary[offset] as u64,
                )
            })
    }

    fn check_command(&self, live: AgpCommand) -> Option<IntegrityViolation> {
        let cached = self.cached_command?;
        (cached != live).then(|| {
            IntegrityViolation::new(
                BugCheckCode::AgpIllegallyReprogrammed,
                cached.0 as u64,
                live.0 as u64,
            )
        })
    }

    fn raise(&self, report: &mut TickReport, violation: IntegrityViolation) {
        match self.policy {
            IntegrityPolicy::Halt => panic!("agp verifier: {}", violation),
            IntegrityPolicy::ReportAndContinue => {
                klog_error!("agp verifier: {}", violation);
                report.violation.get_or_insert(violation);
            }
        }
    }
}

impl Drop for VerifierContext {
    fn drop(&mut self) {
        if self.state() == VerifierState::Armed {
            self.timer.cancel();
        }
    }
}

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;
