//! Nested hypercall dispatch: by opcode group in `rax`, then by opcode in `rbx`.

mod bf86_op;
mod domain_op;
mod event_op;
mod vcpu_op;

use alloc::sync::Arc;

use axerrno::{AxResult, ax_err};

pub use bf86_op::Bf86Op;
pub use domain_op::DomainOp;
pub use event_op::EventOp;
pub use vcpu_op::VcpuOp;

use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;
use crate::exit::ExitReason;
use crate::hyperkernel::GuestPod;
use crate::vcpu::VCpu;

/// Register-level contract shared with guest drivers.
pub mod abi {
    pub const SUCCESS: u64 = 0;
    pub const FAILURE: u64 = 0xFFFF_FFFF_FFFF_FFFE;
    pub const INVALID_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

    pub const DOMAIN_OP: u64 = 0xBF5C_0000_0000_0100;
    pub const VCPU_OP: u64 = 0xBF5C_0000_0000_0200;
    pub const EVENT_OP: u64 = 0xBF5C_0000_0000_0300;
    pub const BF86_OP: u64 = 0xBF86_0000_0000_0100;

    pub const DOMAIN_OP_CREATE_DOMAIN: u64 = 0x100;
    pub const DOMAIN_OP_DESTROY_DOMAIN: u64 = 0x101;
    pub const DOMAIN_OP_SHARE_PAGE_R: u64 = 0x110;
    pub const DOMAIN_OP_SHARE_PAGE_RW: u64 = 0x111;
    pub const DOMAIN_OP_SHARE_PAGE_RWE: u64 = 0x112;
    pub const DOMAIN_OP_ADD_E820_ENTRY: u64 = 0x114;
    pub const DOMAIN_OP_SET_ENTRY: u64 = 0x120;
    pub const DOMAIN_OP_SET_UART: u64 = 0x121;
    pub const DOMAIN_OP_SET_PT_UART: u64 = 0x122;
    pub const DOMAIN_OP_DUMP_UART: u64 = 0x123;
    pub const DOMAIN_OP_SET_NDVM: u64 = 0x130;

    pub const VCPU_OP_CREATE_VCPU: u64 = 0x100;
    pub const VCPU_OP_KILL_VCPU: u64 = 0x101;
    pub const VCPU_OP_DESTROY_VCPU: u64 = 0x102;
    pub const VCPU_OP_RUN_VCPU: u64 = 0x103;
    pub const VCPU_OP_YIELD: u64 = 0x104;

    pub const EVENT_OP_QUEUE_VECTOR: u64 = 0x100;
    pub const EVENT_OP_BROADCAST_VECTOR: u64 = 0x101;

    pub const BF86_OP_WRITE_CHAR: u64 = 0x100;
    pub const BF86_OP_HLT: u64 = 0x101;

    /// Codes a parent finds in `rax` when a child hands control back.
    pub const RUN_HLT: u64 = 1;
    pub const RUN_FAULT: u64 = 2;
    pub const RUN_RESUME_AFTER_INTERRUPT: u64 = 3;
    pub const RUN_YIELD: u64 = 4;
}

/// Argument block of the `share_page_*` hypercalls.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SharePageArgs {
    pub foreign_domainid: u64,
    pub self_gpa: u64,
    pub foreign_gpa: u64,
}

/// Argument block of `run_vcpu`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunVcpuArgs {
    pub vcpuid: u64,
    pub entry: u64,
    pub stack: u64,
}

unsafe impl GuestPod for SharePageArgs {}
unsafe impl GuestPod for RunVcpuArgs {}

/// Writes `value` to the result register and steps over the `VMCALL`.
fn complete<H: Hal>(cx: &mut ExitContext<'_, H>, value: u64) -> Result<bool, ExitError> {
    cx.set_result(value)?;
    cx.advance_rip()?;
    Ok(true)
}

/// Registers the group handlers for `VMCALL` exits of `vcpu`.
pub(crate) fn install<H: Hal>(vcpu: &mut VCpu<H>) -> AxResult {
    vcpu.add_fallback(ExitReason::VMCALL, Arc::new(UnknownGroup))?;
    vcpu.add_handler(ExitReason::VMCALL, Arc::new(Bf86Op))?;
    vcpu.add_handler(ExitReason::VMCALL, Arc::new(EventOp))?;
    vcpu.add_handler(ExitReason::VMCALL, Arc::new(VcpuOp))?;
    vcpu.add_handler(ExitReason::VMCALL, Arc::new(DomainOp))?;
    Ok(())
}

/// Claims every `VMCALL` no group recognised and fails it.
struct UnknownGroup;

impl<H: Hal> ExitHandler<H> for UnknownGroup {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let group = cx.regs()?.rax;
        debug!("[HK] vcpu {:#x}: unknown hypercall group {:#x}", cx.vcpu_id, group);
        ax_err!(Unsupported, "unknown hypercall group").map_err(ExitError::from)
    }
}
