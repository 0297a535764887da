use super::{abi, complete};
use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;

/// Legacy group used by 32-bit test guests.
pub struct Bf86Op;

impl<H: Hal> ExitHandler<H> for Bf86Op {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let regs = *cx.regs()?;
        if regs.rax != abi::BF86_OP {
            return Ok(false);
        }

        match regs.rbx {
            abi::BF86_OP_WRITE_CHAR => {
                let domain_id = cx.vcpu()?.domain_id();
                cx.hk.domain_mut_or_err(domain_id)?.uart_write(regs.rcx as u8);
                complete(cx, abi::SUCCESS)
            }
            abi::BF86_OP_HLT => {
                let parent = cx.hk.return_hlt(cx.vcpu_id)?;
                cx.advance_rip()?;
                cx.transfer(parent);
                Ok(true)
            }
            opcode => Err(ExitError::Protocol {
                group: regs.rax,
                opcode,
            }),
        }
    }
}
