//! Physical memory side of the AGP library: owned page lists, the page
//! allocation contract and the favored-range allocator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod favored;
pub mod page_list;
pub mod page_source;

pub use favored::{FavoredMemory, FavoredRange};
pub use page_list::PageList;
pub use page_source::{FramePool, PhysicalPageSource};
