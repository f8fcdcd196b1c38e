//! Shared AGP library types.
//!
//! Address newtypes, the error type, caching attributes, halt codes and the
//! bit-exact wire layouts (AGP capability block, platform memory-range table)
//! used by the other agplib crates.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod addr;
pub mod bugcheck;
pub mod caching;
pub mod capability;
pub mod error;
pub mod memory_ranges;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub use addr::*;
pub use bugcheck::{BugCheckCode, IntegrityViolation};
pub use caching::CachingType;
pub use error::{AgpError, AgpResult};
