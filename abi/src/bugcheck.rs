use core::fmt;

/// Halt codes raised when the verifier finds the aperture compromised.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BugCheckCode {
    /// The canary page was written. Parameter 0 is the word offset.
    AgpInvalidAccess = 0x104,
    /// A GART entry differs from the driver's shadow copy.
    AgpGartCorruption = 0x105,
    /// The command register no longer holds the last value the driver wrote.
    AgpIllegallyReprogrammed = 0x106,
}

impl BugCheckCode {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::AgpInvalidAccess => "AGP_INVALID_ACCESS",
            Self::AgpGartCorruption => "AGP_GART_CORRUPTION",
            Self::AgpIllegallyReprogrammed => "AGP_ILLEGALLY_REPROGRAMMED",
        }
    }
}

/// A fatal verifier finding with its two diagnostic parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub code: BugCheckCode,
    pub params: [u64; 2],
}

impl IntegrityViolation {
    pub const fn new(code: BugCheckCode, first: u64, second: u64) -> Self {
        Self {
            code,
            params: [first, second],
        }
    }
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:#x}) [{:#x}, {:#x}]",
            self.code.name(),
            self.code.code(),
            self.params[0],
            self.params[1]
        )
    }
}
