//! Local APIC register view, reachable as x2APIC MSRs or xAPIC MMIO.

use alloc::vec::Vec;

use axerrno::AxResult;
use bit_field::BitField;

use crate::dispatch::{ExitContext, ExitHandler};
use crate::error::ExitError;
use crate::exit::{AccessWidth, ExitReason};
use crate::{Hal, Hyperkernel, VCpuId};

pub const X2APIC_MSR_BASE: u32 = 0x800;
pub const X2APIC_MSR_END: u32 = 0x8FF;
pub const XAPIC_MMIO_BASE: usize = 0xFEE0_0000;
pub const XAPIC_MMIO_SIZE: usize = 0x1000;

/// Register numbers, i.e. `msr - 0x800` or `mmio_offset >> 4`.
mod reg {
    pub const ID: u32 = 0x02;
    pub const VERSION: u32 = 0x03;
    pub const TPR: u32 = 0x08;
    pub const PPR: u32 = 0x0A;
    pub const EOI: u32 = 0x0B;
    pub const LDR: u32 = 0x0D;
    pub const SVR: u32 = 0x0F;
    pub const ESR: u32 = 0x28;
    pub const ICR_LOW: u32 = 0x30;
    pub const ICR_HIGH: u32 = 0x31;
    pub const LVT_TIMER: u32 = 0x32;
    pub const TIMER_INITIAL: u32 = 0x38;
    pub const TIMER_CURRENT: u32 = 0x39;
    pub const TIMER_DIVIDE: u32 = 0x3E;
    pub const SELF_IPI: u32 = 0x3F;
}

const VERSION: u64 = 0x0005_0014;
const LVT_MASKED: u32 = 1 << 16;
const ESR_SEND_ILLEGAL_VECTOR: u32 = 1 << 5;

/// Software state of one local APIC. The timer vector is kept on the vCPU.
#[derive(Debug, Clone)]
pub struct LapicState {
    pub tpr: u32,
    pub ldr: u32,
    pub svr: u32,
    pub esr: u32,
    pub icr: u64,
    pub lvt_timer: u32,
    pub timer_initial: u32,
    pub timer_divide: u32,
}

impl Default for LapicState {
    fn default() -> Self {
        Self {
            tpr: 0,
            ldr: 0,
            svr: 0xFF,
            esr: 0,
            icr: 0,
            lvt_timer: LVT_MASKED,
            timer_initial: 0,
            timer_divide: 0,
        }
    }
}

/// Destination shorthand of an ICR write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Destination {
    Apic(u32),
    SelfOnly,
    All,
    AllButSelf,
}

/// Reads register `reg` of the local APIC of `vcpu_id`.
pub fn read<H: Hal>(hk: &Hyperkernel<H>, vcpu_id: VCpuId, reg: u32, x2apic: bool) -> AxResult<u64> {
    let vcpu = hk.vcpu_or_err(vcpu_id)?;
    let state = &vcpu.lapic;
    let value = match reg {
        reg::ID if x2apic => vcpu.apic_id() as u64,
        reg::ID => (vcpu.apic_id() as u64) << 24,
        reg::VERSION => VERSION,
        reg::TPR => state.tpr as u64,
        reg::PPR => state.tpr as u64 & 0xF0,
        reg::LDR => state.ldr as u64,
        reg::SVR => state.svr as u64,
        reg::ESR => state.esr as u64,
        reg::ICR_LOW if x2apic => state.icr,
        reg::ICR_LOW => state.icr.get_bits(0..32),
        reg::ICR_HIGH => state.icr.get_bits(32..64),
        reg::LVT_TIMER => (state.lvt_timer & !0xFF) as u64 | vcpu.timer_vector() as u64,
        reg::TIMER_INITIAL => state.timer_initial as u64,
        // No timer is armed here, the count has always run out.
        reg::TIMER_CURRENT => 0,
        reg::TIMER_DIVIDE => state.timer_divide as u64,
        _ => 0,
    };
    trace!("[HK] lapic {:#x}: read reg {:#x} = {:#x}", vcpu_id, reg, value);
    Ok(value)
}

/// Writes register `reg` of the local APIC of `vcpu_id`.
pub fn write<H: Hal>(
    hk: &mut Hyperkernel<H>,
    vcpu_id: VCpuId,
    reg: u32,
    value: u64,
    x2apic: bool,
) -> AxResult {
    trace!("[HK] lapic {:#x}: write reg {:#x} <- {:#x}", vcpu_id, reg, value);
    let vcpu = hk.vcpu_mut_or_err(vcpu_id)?;
    match reg {
        reg::TPR => vcpu.lapic.tpr = value as u32 & 0xFF,
        reg::EOI => {}
        reg::LDR if !x2apic => vcpu.lapic.ldr = value as u32,
        reg::SVR => vcpu.lapic.svr = value as u32,
        // Any write clears the accumulated errors.
        reg::ESR => vcpu.lapic.esr = 0,
        reg::ICR_HIGH if !x2apic => {
            vcpu.lapic.icr.set_bits(32..64, value & 0xFFFF_FFFF);
        }
        reg::ICR_LOW => {
            if x2apic {
                vcpu.lapic.icr = value;
            } else {
                vcpu.lapic.icr.set_bits(0..32, value & 0xFFFF_FFFF);
            }
            let icr = vcpu.lapic.icr;
            send_ipi(hk, vcpu_id, icr, x2apic)?;
        }
        reg::LVT_TIMER => {
            vcpu.lapic.lvt_timer = value as u32;
            vcpu.set_timer_vector(value as u8);
        }
        reg::TIMER_INITIAL => vcpu.lapic.timer_initial = value as u32,
        reg::TIMER_DIVIDE => vcpu.lapic.timer_divide = value as u32 & 0xB,
        reg::SELF_IPI if x2apic => {
            let vector = value as u8;
            deliver(hk, vcpu_id, vector)?;
        }
        _ => debug!("[HK] lapic {:#x}: write to read-only reg {:#x} ignored", vcpu_id, reg),
    }
    Ok(())
}

fn send_ipi<H: Hal>(hk: &mut Hyperkernel<H>, sender: VCpuId, icr: u64, x2apic: bool) -> AxResult {
    let vector = icr.get_bits(0..8) as u8;
    let delivery_mode = icr.get_bits(8..11);
    if delivery_mode != 0 {
        debug!(
            "[HK] vcpu {:#x}: ICR delivery mode {} not emulated",
            sender, delivery_mode
        );
        return Ok(());
    }
    let dest = match icr.get_bits(18..20) {
        0 if x2apic => Destination::Apic(icr.get_bits(32..64) as u32),
        0 => Destination::Apic(icr.get_bits(56..64) as u32),
        1 => Destination::SelfOnly,
        2 => Destination::All,
        _ => Destination::AllButSelf,
    };

    let (domain_id, sender_apic) = {
        let vcpu = hk.vcpu_or_err(sender)?;
        (vcpu.domain_id(), vcpu.apic_id())
    };
    let targets: Vec<VCpuId> = hk
        .vcpus_of(domain_id)
        .filter(|v| match dest {
            Destination::Apic(id) => v.apic_id() == id,
            Destination::SelfOnly => v.id() == sender,
            Destination::All => true,
            Destination::AllButSelf => v.apic_id() != sender_apic,
        })
        .map(|v| v.id())
        .collect();
    if targets.is_empty() {
        debug!("[HK] vcpu {:#x}: IPI {:?} has no target", sender, dest);
    }
    for target in targets {
        deliver(hk, target, vector)?;
    }
    Ok(())
}

fn deliver<H: Hal>(hk: &mut Hyperkernel<H>, target: VCpuId, vector: u8) -> AxResult {
    if hk.queue_external_interrupt(target, vector).is_err() {
        hk.vcpu_mut_or_err(target)?.lapic.esr |= ESR_SEND_ILLEGAL_VECTOR;
    }
    Ok(())
}

/// Exit handler for the local APIC of the trapping vCPU.
pub struct Lapic;

impl<H: Hal> ExitHandler<H> for Lapic {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        match cx.reason() {
            ExitReason::MSR_READ | ExitReason::MSR_WRITE => {
                let msr = cx.regs()?.rcx as u32;
                if !(X2APIC_MSR_BASE..=X2APIC_MSR_END).contains(&msr) {
                    return Ok(false);
                }
                let reg = msr - X2APIC_MSR_BASE;
                if cx.reason() == ExitReason::MSR_READ {
                    let value = read(cx.hk, cx.vcpu_id, reg, true)?;
                    cx.regs_mut()?.set_edx_eax(value);
                } else {
                    let value = cx.regs()?.get_edx_eax();
                    write(cx.hk, cx.vcpu_id, reg, value, true)?;
                }
            }
            ExitReason::EPT_VIOLATION => {
                let (gpa, mmio) = match (cx.exit.guest_physical_address, cx.exit.mmio) {
                    (Some(gpa), Some(mmio)) => (gpa.as_usize(), mmio),
                    _ => return Ok(false),
                };
                if !(XAPIC_MMIO_BASE..XAPIC_MMIO_BASE + XAPIC_MMIO_SIZE).contains(&gpa)
                    || mmio.width != AccessWidth::Dword
                {
                    return Ok(false);
                }
                let reg = ((gpa - XAPIC_MMIO_BASE) >> 4) as u32;
                if mmio.is_write {
                    write(cx.hk, cx.vcpu_id, reg, mmio.data & 0xFFFF_FFFF, false)?;
                } else {
                    let value = read(cx.hk, cx.vcpu_id, reg, false)?;
                    cx.regs_mut()?.set_reg_of_index(mmio.reg, value);
                }
            }
            _ => return Ok(false),
        }
        cx.advance_rip()?;
        Ok(true)
    }
}
