use axerrno::ax_err_type;

use super::{abi, complete};
use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;

/// Interrupt delivery group.
pub struct EventOp;

impl<H: Hal> ExitHandler<H> for EventOp {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let regs = *cx.regs()?;
        if regs.rax != abi::EVENT_OP {
            return Ok(false);
        }
        let vector = u8::try_from(regs.rdx)
            .map_err(|_| ax_err_type!(InvalidInput, "vector out of range"));

        match regs.rbx {
            abi::EVENT_OP_QUEUE_VECTOR => {
                cx.hk.queue_external_interrupt(regs.rcx, vector?)?;
            }
            abi::EVENT_OP_BROADCAST_VECTOR => {
                let n = cx.hk.broadcast_vector(regs.rcx, vector?)?;
                trace!("[HK] vector {:#x} broadcast to {} vcpus", regs.rdx, n);
            }
            opcode => {
                return Err(ExitError::Protocol {
                    group: regs.rax,
                    opcode,
                });
            }
        }
        complete(cx, abi::SUCCESS)
    }
}
