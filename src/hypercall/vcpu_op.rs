use super::{RunVcpuArgs, abi, complete};
use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;
use crate::mem::GuestVirtAddr;

/// vCPU management group.
pub struct VcpuOp;

impl<H: Hal> ExitHandler<H> for VcpuOp {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let regs = *cx.regs()?;
        if regs.rax != abi::VCPU_OP {
            return Ok(false);
        }
        let caller = cx.vcpu_id;
        trace!(
            "[HK] vcpu {:#x}: vcpu_op {:#x} ({:#x}, {:#x})",
            caller, regs.rbx, regs.rcx, regs.rdx
        );

        let result = match regs.rbx {
            abi::VCPU_OP_CREATE_VCPU => cx.hk.create_vcpu(regs.rcx).unwrap_or_else(|err| {
                debug!("[HK] create_vcpu({:#x}) failed: {:?}", regs.rcx, err);
                abi::INVALID_ID
            }),
            abi::VCPU_OP_KILL_VCPU => {
                cx.hk.kill_vcpu(caller, regs.rcx)?;
                abi::SUCCESS
            }
            abi::VCPU_OP_DESTROY_VCPU => {
                cx.hk.destroy_vcpu(caller, regs.rcx)?;
                abi::SUCCESS
            }
            abi::VCPU_OP_RUN_VCPU => {
                let args: RunVcpuArgs = cx
                    .hk
                    .read_guest_obj(caller, GuestVirtAddr::from(regs.rcx as usize))?;
                let target = cx.hk.run_vcpu(caller, args.vcpuid, args.entry, args.stack)?;
                // The caller continues past the VMCALL once the child hands
                // control back, with the run return code in rax.
                cx.advance_rip()?;
                cx.transfer(target);
                return Ok(true);
            }
            abi::VCPU_OP_YIELD => {
                let parent = cx.hk.return_yield(caller, regs.rcx)?;
                cx.advance_rip()?;
                cx.transfer(parent);
                return Ok(true);
            }
            opcode => {
                return Err(ExitError::Protocol {
                    group: regs.rax,
                    opcode,
                });
            }
        };
        complete(cx, result)
    }
}
