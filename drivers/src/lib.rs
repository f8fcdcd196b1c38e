//! AGP bus filter core: capability access, quirks, resource negotiation,
//! the aperture allocator and its public interface, and the verifier.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod aperture;
pub mod config;
pub mod device_flags;
pub mod dispatch;
pub mod gart;
pub mod globals;
pub mod interface;
pub mod management;
pub mod master;
pub mod pci;
pub mod pci_defs;
pub mod platform;
pub mod resource;
pub mod settings;
pub mod target;
pub mod verifier;

#[cfg(test)]
mod test_fixtures;

pub use aperture::{GartState, MapHandle};
pub use globals::AgpGlobals;
pub use interface::{AgpBusInterface, InterfaceVersion};
pub use master::MasterContext;
pub use platform::{AgpRange, AperturePlatform, ApertureInfo};
pub use settings::AgpSettings;
pub use target::{TargetContext, TargetKind};
