#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod cmdline;
pub mod event;
pub mod klog;
pub mod rendezvous;
#[cfg(target_arch = "x86_64")]
pub mod serial;

pub use cache::CacheFlush;
pub use event::CompletionEvent;
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use rendezvous::Rendezvous;
