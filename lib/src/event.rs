//! One-shot completion event.
//!
//! A request handed to an asynchronous lower layer carries an
//! `Arc<CompletionEvent<T>>`; the lower layer calls [`signal`] from its
//! completion path and the issuing thread blocks in [`wait`]. The upper
//! layer therefore always presents a synchronous contract.
//!
//! [`signal`]: CompletionEvent::signal
//! [`wait`]: CompletionEvent::wait

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

pub struct CompletionEvent<T> {
    signaled: AtomicBool,
    value: Mutex<Option<T>>,
}

impl<T> CompletionEvent<T> {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    /// Store the completion value and release the waiter. A second signal is
    /// ignored.
    pub fn signal(&self, value: T) {
        let mut slot = self.value.lock();
        if self.signaled.load(Ordering::Acquire) {
            return;
        }
        *slot = Some(value);
        self.signaled.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Spin until signalled, then take the value.
    pub fn wait(&self) -> T {
        loop {
            while !self.signaled.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            if let Some(value) = self.value.lock().take() {
                return value;
            }
        }
    }
}

impl<T> Default for CompletionEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_returns_value_signalled_from_another_thread() {
        let event = Arc::new(CompletionEvent::new());
        let completer = Arc::clone(&event);
        let handle = std::thread::spawn(move || completer.signal(42u32));
        assert_eq!(event.wait(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_second_signal_is_ignored() {
        let event = CompletionEvent::new();
        event.signal(1u8);
        event.signal(2u8);
        assert_eq!(event.wait(), 1);
    }
}
