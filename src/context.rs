use core::fmt::{Debug, Formatter, Result};

use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::regs::GeneralRegisters;

/// Architectural state of one vCPU, the software image of its VMCS guest area.
///
/// The entry backend loads it into hardware before every entry and stores it
/// back on every exit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VcpuContext {
    pub regs: GeneralRegisters,

    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,

    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub tr_base: u64,
}

impl Default for VcpuContext {
    fn default() -> Self {
        Self {
            regs: GeneralRegisters::default(),
            rip: 0,
            rsp: 0,
            rflags: 0x2,
            cr0: (Cr0Flags::PROTECTED_MODE_ENABLE
                | Cr0Flags::EXTENSION_TYPE
                | Cr0Flags::NUMERIC_ERROR)
                .bits(),
            cr3: 0,
            cr4: 0,
            efer: 0,
            gdtr_base: 0,
            gdtr_limit: 0,
            idtr_base: 0,
            idtr_limit: 0,
            tr_base: 0,
        }
    }
}

impl VcpuContext {
    /// A context in 64-bit mode walking the page tables rooted at `cr3`.
    pub fn long_mode(cr3: u64) -> Self {
        Self {
            cr0: (Cr0Flags::PROTECTED_MODE_ENABLE
                | Cr0Flags::EXTENSION_TYPE
                | Cr0Flags::NUMERIC_ERROR
                | Cr0Flags::WRITE_PROTECT
                | Cr0Flags::PAGING)
                .bits(),
            cr3,
            cr4: Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits(),
            efer: (EferFlags::LONG_MODE_ENABLE
                | EferFlags::LONG_MODE_ACTIVE
                | EferFlags::NO_EXECUTE_ENABLE)
                .bits(),
            ..Self::default()
        }
    }

    pub fn cr0_flags(&self) -> Cr0Flags {
        Cr0Flags::from_bits_truncate(self.cr0)
    }

    pub fn cr4_flags(&self) -> Cr4Flags {
        Cr4Flags::from_bits_truncate(self.cr4)
    }

    pub fn efer_flags(&self) -> EferFlags {
        EferFlags::from_bits_truncate(self.efer)
    }

    /// Whether guest-virtual addresses go through the guest page tables.
    pub fn paging_enabled(&self) -> bool {
        self.cr0_flags().contains(Cr0Flags::PAGING)
    }

    /// Number of guest paging levels, `0` when paging is off.
    pub fn paging_levels(&self) -> usize {
        if !self.paging_enabled() {
            0
        } else if self.efer_flags().contains(EferFlags::LONG_MODE_ACTIVE) {
            4
        } else if self.cr4_flags().contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION) {
            3
        } else {
            2
        }
    }

    /// Moves `RIP` past the trapping instruction.
    pub fn advance_rip(&mut self, instr_len: u32) {
        self.rip = self.rip.wrapping_add(instr_len as u64);
    }
}

impl Debug for VcpuContext {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("VcpuContext")
            .field("guest_regs", &self.regs)
            .field("rip", &self.rip)
            .field("rsp", &self.rsp)
            .field("rflags", &self.rflags)
            .field("cr0", &self.cr0_flags())
            .field("cr3", &self.cr3)
            .field("cr4", &self.cr4_flags())
            .field("efer", &self.efer_flags())
            .field("gdt_base", &self.gdtr_base)
            .field("gdt_limit", &self.gdtr_limit)
            .field("idt_base", &self.idtr_base)
            .field("idt_limit", &self.idtr_limit)
            .field("tr_base", &self.tr_base)
            .finish()
    }
}
