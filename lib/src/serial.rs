//! COM1 klog backend built on `uart_16550`.

use core::fmt::{self, Write};

use spin::{Mutex, Once};
use uart_16550::SerialPort;

use crate::klog::klog_register_backend;

pub const COM1_BASE: u16 = 0x3F8;

static PORT: Once<Mutex<SerialPort>> = Once::new();

fn serial_backend(args: fmt::Arguments<'_>) {
    if let Some(port) = PORT.get() {
        let mut port = port.lock();
        let _ = port.write_fmt(args);
        let _ = port.write_str("\n");
    }
}

/// Initialise the UART at `base` and route klog through it.
///
/// # Safety
///
/// `base` must be the I/O base of a 16550-compatible UART and the caller must
/// run with port I/O privilege.
pub unsafe fn serial_klog_init(base: u16) {
    PORT.call_once(|| {
        // SAFETY: guaranteed by the caller.
        let mut port = unsafe { SerialPort::new(base) };
        port.init();
        Mutex::new(port)
    });
    klog_register_backend(serial_backend);
}
