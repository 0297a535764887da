//! PCI configuration space proxy over the `CF8`/`CFC` port protocol.

use bit_field::BitField;
use spin::Mutex;

use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;
use crate::exit::{AccessWidth, ExitReason};

pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const CONFIG_DATA_PORT: u16 = 0xCFC;

const CONFIG_DWORDS: usize = 64;
const ENABLE_BIT: usize = 31;
const BAR_BASE: usize = 4;
const BAR_COUNT: usize = 6;

/// Whether `port` is one of the four data-window ports.
pub fn is_data_port(port: u16) -> bool {
    (CONFIG_DATA_PORT..CONFIG_DATA_PORT + 4).contains(&port)
}

/// Bus/device/function of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bdf {
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl Bdf {
    pub const fn new(bus: u8, dev: u8, func: u8) -> Self {
        Self { bus, dev, func }
    }

    /// Decodes a latched config address, `None` when the enable bit is clear.
    pub fn from_address(address: u32) -> Option<Self> {
        if !address.get_bit(ENABLE_BIT) {
            return None;
        }
        Some(Self {
            bus: address.get_bits(16..24) as u8,
            dev: address.get_bits(11..16) as u8,
            func: address.get_bits(8..11) as u8,
        })
    }

    /// Config address selecting the dword holding byte `offset`.
    pub fn address(&self, offset: u8) -> u32 {
        let mut address = 0u32;
        address.set_bit(ENABLE_BIT, true);
        address.set_bits(16..24, self.bus as u32);
        address.set_bits(11..16, self.dev as u32);
        address.set_bits(8..11, self.func as u32);
        address.set_bits(2..8, (offset >> 2) as u32);
        address
    }
}

/// An emulated PCI function with a type 0 header.
///
/// Registers are 32 bits wide. Guest writes only reach the bits set in the
/// register's writable mask, which makes BAR sizing work without any special
/// casing: writing all-ones to a BAR reads back `!(size - 1)`.
pub struct PciDevice {
    bdf: Bdf,
    regs: Mutex<[u32; CONFIG_DWORDS]>,
    writable: [u32; CONFIG_DWORDS],
}

impl PciDevice {
    const COMMAND: usize = 1;
    const CLASS: usize = 2;
    const INTERRUPT: usize = 15;

    pub fn new(bdf: Bdf, vendor_id: u16, device_id: u16, class_code: u32) -> Self {
        let mut regs = [0u32; CONFIG_DWORDS];
        regs[0] = (device_id as u32) << 16 | vendor_id as u32;
        regs[Self::CLASS] = class_code << 8;

        let mut writable = [0u32; CONFIG_DWORDS];
        writable[Self::COMMAND] = 0x0000_0547;
        writable[Self::INTERRUPT] = 0x0000_00FF;

        Self {
            bdf,
            regs: Mutex::new(regs),
            writable,
        }
    }

    /// Adds a 32-bit memory BAR of `size` bytes, a power of two of at least 16.
    pub fn with_bar(mut self, index: usize, size: u32) -> Self {
        assert!(index < BAR_COUNT && size.is_power_of_two() && size >= 16);
        self.writable[BAR_BASE + index] = !(size - 1) & 0xFFFF_FFF0;
        self
    }

    /// Sets the legacy interrupt pin (1 = INTA#).
    pub fn with_interrupt_pin(self, pin: u8) -> Self {
        self.regs.lock()[Self::INTERRUPT].set_bits(8..16, pin as u32);
        self
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Reads `width` bytes at byte `offset` of the config space.
    pub fn read(&self, offset: u8, width: AccessWidth) -> u32 {
        let (index, shift) = Self::locate(offset);
        let value = self.regs.lock()[index] >> shift;
        (value as u64 & width.mask()) as u32
    }

    /// Writes `width` bytes at byte `offset`, honouring the writable mask.
    pub fn write(&self, offset: u8, width: AccessWidth, value: u32) {
        let (index, shift) = Self::locate(offset);
        let mask = ((width.mask() << shift) as u32) & self.writable[index];
        let mut regs = self.regs.lock();
        regs[index] = (regs[index] & !mask) | ((value << shift) & mask);
        trace!(
            "[HK] pci {:?}: reg {:#x} <- {:#x}",
            self.bdf, index, regs[index]
        );
    }

    fn locate(offset: u8) -> (usize, u32) {
        ((offset as usize / 4) % CONFIG_DWORDS, (offset as u32 & 3) * 8)
    }
}

impl<H: Hal> ExitHandler<H> for PciDevice {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        if cx.reason() != ExitReason::IO_INSTRUCTION {
            return Ok(false);
        }
        let io = cx.exit.io_info();
        let width = match io.width() {
            Some(width) if is_data_port(io.port) && !io.is_string => width,
            _ => return Ok(false),
        };
        let latch = cx.vcpu()?.pci_latch;
        if Bdf::from_address(latch) != Some(self.bdf) {
            return Ok(false);
        }

        let offset = (latch & 0xFC) as u8 + (io.port - CONFIG_DATA_PORT) as u8;
        let regs = cx.regs_mut()?;
        if io.is_in {
            regs.set_io_result(width, self.read(offset, width));
        } else {
            self.write(offset, width, regs.io_operand(width));
        }
        cx.advance_rip()?;
        Ok(true)
    }
}
