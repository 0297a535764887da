//! IOAPIC register view behind the `IOREGSEL`/`IOWIN` MMIO window.

use bit_field::BitField;
use spin::Mutex;

use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;
use crate::exit::{AccessWidth, ExitReason};

pub const IOAPIC_BASE: usize = 0xFEC0_0000;
pub const IOAPIC_SIZE: usize = 0x1000;
pub const PIN_COUNT: usize = 24;

const IOREGSEL: usize = 0x00;
const IOWIN: usize = 0x10;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_ARBITRATION: u32 = 0x02;
const REG_REDIRECTION_BASE: u32 = 0x10;

const VERSION: u32 = ((PIN_COUNT as u32 - 1) << 16) | 0x11;
const MASKED: usize = 16;

struct IoApicRegs {
    select: u32,
    id: u32,
    redirection: [u64; PIN_COUNT],
}

/// A virtual IOAPIC shared by every vCPU of a domain.
pub struct IoApic {
    regs: Mutex<IoApicRegs>,
}

impl Default for IoApic {
    fn default() -> Self {
        Self::new()
    }
}

impl IoApic {
    pub fn new() -> Self {
        Self {
            regs: Mutex::new(IoApicRegs {
                select: 0,
                id: 0,
                redirection: [1 << MASKED; PIN_COUNT],
            }),
        }
    }

    /// Reads the dword at `offset` of the MMIO window.
    pub fn mmio_read(&self, offset: usize) -> u32 {
        let regs = self.regs.lock();
        match offset {
            IOREGSEL => regs.select,
            IOWIN => Self::window_read(&regs, regs.select),
            _ => 0,
        }
    }

    /// Writes the dword at `offset` of the MMIO window.
    pub fn mmio_write(&self, offset: usize, value: u32) {
        let mut regs = self.regs.lock();
        match offset {
            IOREGSEL => regs.select = value & 0xFF,
            IOWIN => {
                let select = regs.select;
                Self::window_write(&mut regs, select, value);
            }
            _ => {}
        }
    }

    /// Redirection entry of `pin`.
    pub fn redirection(&self, pin: usize) -> Option<u64> {
        self.regs.lock().redirection.get(pin).copied()
    }

    /// Vector and destination APIC id of `pin`, `None` while it is masked.
    pub fn route(&self, pin: usize) -> Option<(u8, u32)> {
        let entry = self.redirection(pin)?;
        if entry.get_bit(MASKED) {
            return None;
        }
        Some((entry.get_bits(0..8) as u8, entry.get_bits(56..64) as u32))
    }

    fn window_read(regs: &IoApicRegs, select: u32) -> u32 {
        match select {
            REG_ID | REG_ARBITRATION => regs.id << 24,
            REG_VERSION => VERSION,
            REG_REDIRECTION_BASE.. => {
                let index = (select - REG_REDIRECTION_BASE) as usize;
                match regs.redirection.get(index / 2) {
                    Some(entry) if index % 2 == 0 => entry.get_bits(0..32) as u32,
                    Some(entry) => entry.get_bits(32..64) as u32,
                    None => 0,
                }
            }
            _ => 0,
        }
    }

    fn window_write(regs: &mut IoApicRegs, select: u32, value: u32) {
        match select {
            REG_ID => regs.id = value.get_bits(24..28),
            REG_REDIRECTION_BASE.. => {
                let index = (select - REG_REDIRECTION_BASE) as usize;
                if let Some(entry) = regs.redirection.get_mut(index / 2) {
                    let bits: core::ops::Range<usize> = if index % 2 == 0 { 0..32 } else { 32..64 };
                    entry.set_bits(bits, value as u64);
                    trace!("[HK] ioapic pin {}: {:#x}", index / 2, entry);
                }
            }
            _ => {}
        }
    }
}

impl<H: Hal> ExitHandler<H> for IoApic {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        if cx.reason() != ExitReason::EPT_VIOLATION {
            return Ok(false);
        }
        let (gpa, mmio) = match (cx.exit.guest_physical_address, cx.exit.mmio) {
            (Some(gpa), Some(mmio)) => (gpa.as_usize(), mmio),
            _ => return Ok(false),
        };
        if !(IOAPIC_BASE..IOAPIC_BASE + IOAPIC_SIZE).contains(&gpa)
            || mmio.width != AccessWidth::Dword
        {
            return Ok(false);
        }

        let offset = gpa - IOAPIC_BASE;
        if mmio.is_write {
            self.mmio_write(offset, mmio.data as u32);
        } else {
            let value = self.mmio_read(offset);
            cx.regs_mut()?.set_reg_of_index(mmio.reg, value as u64);
        }
        cx.advance_rip()?;
        Ok(true)
    }
}
