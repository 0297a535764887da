mod diff;

pub use diff::GeneralRegistersDiff;

use bit_field::BitField;

use crate::exit::AccessWidth;

/// General-purpose registers of a guest, saved on every VM exit.
///
/// `RSP` lives in the execution context, the slot here only keeps the
/// hardware register numbering intact.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Name of the register with hardware index `index`.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Reads the register with hardware index `index`. `RSP` reads as zero.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => 0,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Writes the register with hardware index `index`. Writes to `RSP` are dropped.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => {}
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// `EDX:EAX` as used by `RDMSR`/`WRMSR`.
    pub fn get_edx_eax(&self) -> u64 {
        (self.rdx.get_bits(0..32) << 32) | self.rax.get_bits(0..32)
    }

    /// Splits `value` into `EDX:EAX`, clearing the upper halves.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value.get_bits(0..32);
        self.rdx = value.get_bits(32..64);
    }

    /// Stores the result of an `IN` instruction.
    ///
    /// 32-bit results zero-extend into `RAX`; 8- and 16-bit results only
    /// replace `AL`/`AX`.
    pub fn set_io_result(&mut self, width: AccessWidth, value: u32) {
        match width {
            AccessWidth::Dword | AccessWidth::Qword => self.rax = value as u64,
            _ => {
                let range = width.bits_range();
                self.rax.set_bits(range, value as u64 & width.mask());
            }
        }
    }

    /// Operand of an `OUT` instruction.
    pub fn io_operand(&self, width: AccessWidth) -> u32 {
        (self.rax & width.mask()) as u32
    }
}
