//! CPU cache maintenance for freshly allocated aperture backing pages.

/// How pages are flushed before the GART starts aliasing them, when the
/// platform does not supply its own flush hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheFlush {
    /// Write back and invalidate every cache on this processor.
    #[default]
    InvalidateAll,
    /// Skip the flush. For simulated chipsets and host tests.
    None,
}

impl CacheFlush {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("invalidate") || name.eq_ignore_ascii_case("wbinvd") {
            Some(Self::InvalidateAll)
        } else if name.eq_ignore_ascii_case("none") {
            Some(Self::None)
        } else {
            None
        }
    }

    pub fn apply(self) {
        match self {
            Self::InvalidateAll => invalidate_all_caches(),
            Self::None => {}
        }
    }
}

/// `wbinvd`. Privileged; only meaningful in ring 0.
#[cfg(target_arch = "x86_64")]
pub fn invalidate_all_caches() {
    unsafe {
        core::arch::asm!("wbinvd", options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn invalidate_all_caches() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
