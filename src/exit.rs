//! VM-exit information as reported by the entry backend.

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;
use page_table_entry::MappingFlags;

use crate::mem::GuestPhysAddr;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    #[allow(non_camel_case_types)]
    /// VMX basic exit reasons. (SDM Vol. 3D, Appendix C)
    pub enum ExitReason {
        EXCEPTION_NMI = 0,
        EXTERNAL_INTERRUPT = 1,
        TRIPLE_FAULT = 2,
        INIT = 3,
        SIPI = 4,
        SMI = 5,
        OTHER_SMI = 6,
        INTERRUPT_WINDOW = 7,
        NMI_WINDOW = 8,
        TASK_SWITCH = 9,
        CPUID = 10,
        GETSEC = 11,
        HLT = 12,
        INVD = 13,
        INVLPG = 14,
        RDPMC = 15,
        RDTSC = 16,
        RSM = 17,
        VMCALL = 18,
        VMCLEAR = 19,
        VMLAUNCH = 20,
        VMPTRLD = 21,
        VMPTRST = 22,
        VMREAD = 23,
        VMRESUME = 24,
        VMWRITE = 25,
        VMOFF = 26,
        VMON = 27,
        CR_ACCESS = 28,
        DR_ACCESS = 29,
        IO_INSTRUCTION = 30,
        MSR_READ = 31,
        MSR_WRITE = 32,
        INVALID_GUEST_STATE = 33,
        MSR_LOAD_FAIL = 34,
        MWAIT_INSTRUCTION = 36,
        MONITOR_TRAP_FLAG = 37,
        MONITOR_INSTRUCTION = 39,
        PAUSE_INSTRUCTION = 40,
        MCE_DURING_VMENTRY = 41,
        TPR_BELOW_THRESHOLD = 43,
        APIC_ACCESS = 44,
        VIRTUALIZED_EOI = 45,
        GDTR_IDTR = 46,
        LDTR_TR = 47,
        EPT_VIOLATION = 48,
        EPT_MISCONFIG = 49,
        INVEPT = 50,
        RDTSCP = 51,
        PREEMPTION_TIMER = 52,
        INVVPID = 53,
        WBINVD = 54,
        XSETBV = 55,
        APIC_WRITE = 56,
        RDRAND = 57,
        INVPCID = 58,
        VMFUNC = 59,
        ENCLS = 60,
        RDSEED = 61,
        PML_FULL = 62,
        XSAVES = 63,
        XRSTORS = 64,
    }
}

impl ExitReason {
    /// Exits that can never be skipped over: an unclaimed one of these goes to
    /// the fault path instead of advancing the guest.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::TRIPLE_FAULT
                | Self::EXCEPTION_NMI
                | Self::EPT_VIOLATION
                | Self::EPT_MISCONFIG
                | Self::INVALID_GUEST_STATE
                | Self::MSR_LOAD_FAIL
                | Self::MCE_DURING_VMENTRY
                | Self::TASK_SWITCH
        )
    }
}

/// Width of a port or MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl TryFrom<usize> for AccessWidth {
    type Error = ();

    fn try_from(size: usize) -> Result<Self, ()> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            8 => Ok(Self::Qword),
            _ => Err(()),
        }
    }
}

impl AccessWidth {
    /// Size of the access in bytes.
    pub const fn size(self) -> usize {
        self as usize
    }

    /// Bit range covered by the access inside a 64-bit register.
    pub const fn bits_range(self) -> core::ops::Range<usize> {
        0..self.size() * 8
    }

    /// Mask covering the low `size()` bytes.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Qword => u64::MAX,
            _ => (1u64 << (self.size() * 8)) - 1,
        }
    }
}

/// Basic information about a VM exit.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    /// VM-entry failure (bit 31 of the exit reason field).
    pub entry_failure: bool,
    /// Basic exit reason.
    pub exit_reason: ExitReason,
    /// Length of the instruction that caused the exit.
    pub exit_instruction_length: u32,
    /// Exit qualification.
    pub exit_qualification: usize,
    /// Guest `RIP` at the time of the exit.
    pub guest_rip: usize,
    /// Faulting guest-physical address, for EPT violations.
    pub guest_physical_address: Option<GuestPhysAddr>,
    /// Raw VM-exit interruption information, for exceptions and interrupts.
    pub interruption_info: Option<u32>,
    /// MMIO access decoded by the entry backend, for EPT violations.
    pub mmio: Option<MmioAccess>,
}

impl ExitInfo {
    pub fn new(exit_reason: ExitReason, exit_instruction_length: u32, guest_rip: usize) -> Self {
        Self {
            entry_failure: false,
            exit_reason,
            exit_instruction_length,
            exit_qualification: 0,
            guest_rip,
            guest_physical_address: None,
            interruption_info: None,
            mmio: None,
        }
    }

    pub fn with_qualification(mut self, qualification: usize) -> Self {
        self.exit_qualification = qualification;
        self
    }

    pub fn with_guest_paddr(mut self, gpa: GuestPhysAddr) -> Self {
        self.guest_physical_address = Some(gpa);
        self
    }

    pub fn with_interruption(mut self, info: u32) -> Self {
        self.interruption_info = Some(info);
        self
    }

    pub fn with_mmio(mut self, mmio: MmioAccess) -> Self {
        self.mmio = Some(mmio);
        self
    }

    pub fn with_entry_failure(mut self) -> Self {
        self.entry_failure = true;
        self
    }

    /// I/O information, only meaningful for [`ExitReason::IO_INSTRUCTION`].
    pub fn io_info(&self) -> IoExitInfo {
        IoExitInfo::from_qualification(self.exit_qualification)
    }

    /// EPT violation information, only meaningful for [`ExitReason::EPT_VIOLATION`].
    pub fn ept_violation_info(&self) -> EptViolationInfo {
        EptViolationInfo::from_qualification(self.exit_qualification)
    }

    /// Interruption information for exceptions, NMIs and external interrupts.
    pub fn interrupt_info(&self) -> Option<InterruptInfo> {
        self.interruption_info.map(InterruptInfo::from_raw)
    }
}

/// Exit qualification for I/O instructions. (SDM Vol. 3C, Table 28-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExitInfo {
    pub access_size: u8,
    pub is_in: bool,
    pub is_string: bool,
    pub is_repeat: bool,
    pub port: u16,
}

impl IoExitInfo {
    pub fn from_qualification(qualification: usize) -> Self {
        Self {
            access_size: qualification.get_bits(0..3) as u8 + 1,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            port: qualification.get_bits(16..32) as u16,
        }
    }

    /// Encodes a simple (non-string, non-repeated) access back into a qualification.
    pub fn qualification(port: u16, width: AccessWidth, is_in: bool) -> usize {
        let mut q = 0usize;
        q.set_bits(0..3, width.size() - 1);
        q.set_bit(3, is_in);
        q.set_bits(16..32, port as usize);
        q
    }

    pub fn width(&self) -> Option<AccessWidth> {
        AccessWidth::try_from(self.access_size as usize).ok()
    }
}

/// Exit qualification for EPT violations. (SDM Vol. 3C, Table 28-7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationInfo {
    pub read: bool,
    pub write: bool,
    pub instruction: bool,
}

impl EptViolationInfo {
    pub fn from_qualification(qualification: usize) -> Self {
        Self {
            read: qualification.get_bit(0),
            write: qualification.get_bit(1),
            instruction: qualification.get_bit(2),
        }
    }

    pub fn access_flags(&self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        flags.set(MappingFlags::READ, self.read);
        flags.set(MappingFlags::WRITE, self.write);
        flags.set(MappingFlags::EXECUTE, self.instruction);
        flags
    }
}

/// VM-exit interruption information. (SDM Vol. 3C, Table 25-19)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    pub vector: u8,
    pub interruption_type: u8,
    pub valid: bool,
}

impl InterruptInfo {
    pub const NMI_TYPE: u8 = 2;

    pub fn from_raw(info: u32) -> Self {
        Self {
            vector: info.get_bits(0..8) as u8,
            interruption_type: info.get_bits(8..11) as u8,
            valid: info.get_bit(31),
        }
    }

    pub fn raw(vector: u8, interruption_type: u8) -> u32 {
        let mut info = 0u32;
        info.set_bits(0..8, vector as u32);
        info.set_bits(8..11, interruption_type as u32);
        info.set_bit(31, true);
        info
    }
}

/// A memory-mapped access decoded from the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    pub is_write: bool,
    pub width: AccessWidth,
    /// Value written by the guest.
    pub data: u64,
    /// General register receiving the value of a read.
    pub reg: u8,
}
