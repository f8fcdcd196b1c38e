/// Caching attribute requested for an aperture reservation.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CachingType {
    NonCached = 0,
    Cached = 1,
    WriteCombined = 2,
    HardwareCoherentCached = 3,
}

impl CachingType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NonCached),
            1 => Some(Self::Cached),
            2 => Some(Self::WriteCombined),
            3 => Some(Self::HardwareCoherentCached),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NonCached => "uncached",
            Self::Cached => "cached",
            Self::WriteCombined => "write-combined",
            Self::HardwareCoherentCached => "coherent",
        }
    }
}

impl core::fmt::Display for CachingType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
