//! Error type shared by every AGP library operation.
//!
//! Integrity violations found by the verifier are not represented here; they
//! go through the verifier's integrity policy instead of being returned to a
//! caller that could ignore them.

use core::fmt;

/// Failure status of an AGP operation.
///
/// Variants map onto the status classes the bus driver hands back to its
/// clients: exhaustion is retryable, parameter errors are the caller's bug and
/// leave no state behind, topology errors simply keep AGP disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgpError {
    /// No free aperture window, no physical pages, or no heap for bookkeeping.
    InsufficientResources,
    /// Out-of-bounds window, non-empty release, page mismatch or bad handle.
    InvalidParameter,
    /// No AGP capability, or a register selector the device does not implement.
    NotImplemented,
    /// The platform or the negotiated interface does not offer this operation.
    NotSupported,
    /// Outstanding interface handles or reserved pages block the request.
    DeviceBusy,
    /// The platform layer failed without a more specific status.
    Unsuccessful,
    /// Configuration space could not be read or written at `offset`.
    ConfigAccess { offset: u8 },
    /// No aperture descriptor could be located in the resource list.
    NoAperture,
}

impl fmt::Display for AgpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources => write!(f, "insufficient resources"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotImplemented => write!(f, "not implemented by device"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::DeviceBusy => write!(f, "device busy"),
            Self::Unsuccessful => write!(f, "platform operation failed"),
            Self::ConfigAccess { offset } => {
                write!(f, "config space access failed at offset {:#04x}", offset)
            }
            Self::NoAperture => write!(f, "no aperture resource found"),
        }
    }
}

/// Convenience result type for AGP operations.
pub type AgpResult<T = ()> = Result<T, AgpError>;
