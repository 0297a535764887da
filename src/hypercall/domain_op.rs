use alloc::vec;

use axerrno::ax_err_type;
use page_table_entry::MappingFlags;

use super::{SharePageArgs, abi, complete};
use crate::Hal;
use crate::dispatch::{ExitContext, ExitHandler};
use crate::domain::E820Entry;
use crate::error::ExitError;
use crate::mem::{GuestPhysAddr, GuestVirtAddr};

/// Domain management group.
pub struct DomainOp;

impl<H: Hal> ExitHandler<H> for DomainOp {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let regs = *cx.regs()?;
        if regs.rax != abi::DOMAIN_OP {
            return Ok(false);
        }
        let caller = cx.vcpu()?.domain_id();
        trace!(
            "[HK] vcpu {:#x}: domain_op {:#x} ({:#x}, {:#x})",
            cx.vcpu_id, regs.rbx, regs.rcx, regs.rdx
        );

        let result = match regs.rbx {
            abi::DOMAIN_OP_CREATE_DOMAIN => cx.hk.create_domain().unwrap_or_else(|err| {
                debug!("[HK] create_domain failed: {:?}", err);
                abi::INVALID_ID
            }),
            abi::DOMAIN_OP_DESTROY_DOMAIN => {
                cx.hk.destroy_domain(caller, regs.rcx)?;
                abi::SUCCESS
            }
            abi::DOMAIN_OP_SHARE_PAGE_R => share_page(cx, regs.rcx, MappingFlags::READ)?,
            abi::DOMAIN_OP_SHARE_PAGE_RW => {
                share_page(cx, regs.rcx, MappingFlags::READ | MappingFlags::WRITE)?
            }
            abi::DOMAIN_OP_SHARE_PAGE_RWE => share_page(
                cx,
                regs.rcx,
                MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE,
            )?,
            abi::DOMAIN_OP_ADD_E820_ENTRY => {
                let entry: E820Entry = cx
                    .hk
                    .read_guest_obj(cx.vcpu_id, GuestVirtAddr::from(regs.rdx as usize))?;
                cx.hk.add_e820_entry(caller, regs.rcx, entry)?;
                abi::SUCCESS
            }
            abi::DOMAIN_OP_SET_ENTRY => {
                cx.hk
                    .set_entry(caller, regs.rcx, GuestPhysAddr::from(regs.rdx as usize))?;
                abi::SUCCESS
            }
            abi::DOMAIN_OP_SET_UART => {
                cx.hk.set_uart(caller, regs.rcx, port_of(regs.rdx)?)?;
                abi::SUCCESS
            }
            abi::DOMAIN_OP_SET_PT_UART => {
                cx.hk.set_pt_uart(caller, regs.rcx, port_of(regs.rdx)?)?;
                abi::SUCCESS
            }
            abi::DOMAIN_OP_DUMP_UART => {
                let mut buf = vec![0u8; cx.hk.config().uart_buffer_size];
                let n = cx.hk.dump_uart(caller, regs.rcx, &mut buf)?;
                cx.hk.write_guest(
                    cx.vcpu_id,
                    GuestVirtAddr::from(regs.rdx as usize),
                    &buf[..n],
                )?;
                n as u64
            }
            abi::DOMAIN_OP_SET_NDVM => {
                cx.hk.set_ndvm(caller, regs.rcx)?;
                abi::SUCCESS
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

fn share_page<H: Hal>(
    cx: &mut ExitContext<'_, H>,
    args_gva: u64,
    flags: MappingFlags,
) -> Result<u64, ExitError> {
    let args: SharePageArgs = cx
        .hk
        .read_guest_obj(cx.vcpu_id, GuestVirtAddr::from(args_gva as usize))?;
    cx.hk.share_page(
        cx.vcpu_id,
        args.foreign_domainid,
        GuestPhysAddr::from(args.self_gpa as usize),
        GuestPhysAddr::from(args.foreign_gpa as usize),
        flags,
    )?;
    Ok(abi::SUCCESS)
}

fn port_of(value: u64) -> Result<u16, ExitError> {
    u16::try_from(value)
        .map_err(|_| ExitError::Guest(ax_err_type!(InvalidInput, "not an I/O port")))
}
