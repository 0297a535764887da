//! Raw port I/O on the physical machine.

use x86::io::{inb, inl, inw, outb, outl, outw};

use crate::exit::AccessWidth;

/// Reads `port` with the given access width.
///
/// # Safety
///
/// Port I/O may have arbitrary side effects on the hardware.
pub unsafe fn port_read(port: u16, width: AccessWidth) -> u32 {
    unsafe {
        match width {
            AccessWidth::Byte => inb(port) as u32,
            AccessWidth::Word => inw(port) as u32,
            AccessWidth::Dword | AccessWidth::Qword => inl(port),
        }
    }
}

/// Writes `value` to `port` with the given access width.
///
/// # Safety
///
/// Port I/O may have arbitrary side effects on the hardware.
pub unsafe fn port_write(port: u16, width: AccessWidth, value: u32) {
    unsafe {
        match width {
            AccessWidth::Byte => outb(port, value as u8),
            AccessWidth::Word => outw(port, value as u16),
            AccessWidth::Dword | AccessWidth::Qword => outl(port, value),
        }
    }
}
