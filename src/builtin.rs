//! Handlers every vCPU gets at construction.

use alloc::sync::Arc;

use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use raw_cpuid::CpuIdResult;

use crate::Hal;
use crate::device::Lapic;
use crate::device::pci::{self, CONFIG_ADDRESS_PORT};
use crate::dispatch::{ExitContext, ExitHandler};
use crate::domain::{Domain, DomainKind};
use crate::error::ExitError;
use crate::exit::{AccessWidth, ExitReason, InterruptInfo};
use crate::hypercall::{self, abi};
use crate::vcpu::VCpu;

const QEMU_EXIT_PORT: u16 = 0x604;
const QEMU_EXIT_MAGIC: u64 = 0x2000;

const LEAF_FEATURE_INFO: u32 = 0x1;
const LEAF_STRUCTURED_EXTENDED_FEATURE_FLAGS_ENUMERATION: u32 = 0x7;
const LEAF_HYPERVISOR_INFO: u32 = 0x4000_0000;
const LEAF_HYPERVISOR_FEATURE: u32 = 0x4000_0001;
/// Side channel: subleaf 0 reports the APIC id and timer vector, subleaf 1
/// sets the timer vector.
pub const LEAF_HK_APIC: u32 = 0x4BF0_0011;
/// Side channel: an NDVM routes a host interrupt to one of its vectors.
pub const LEAF_HK_NDVM_ROUTE: u32 = 0x4BF0_0021;
const VENDOR_STR: &[u8; 12] = b"HyperKrnlExt";

/// UART line status register offset and the "transmitter empty" bits.
const UART_LSR: u16 = 5;
const UART_LSR_IDLE: u32 = 0x60;

/// Registers the built-in, hypercall and device handlers of `vcpu`.
///
/// Later registrations run first: device shims shadow the PCI latch, which
/// shadows the catch-all fallbacks.
pub(crate) fn install<H: Hal>(vcpu: &mut VCpu<H>, domain: &Domain<H>) -> AxResult {
    use ExitReason::*;

    vcpu.add_fallback(IO_INSTRUCTION, Arc::new(DefaultIo))?;
    vcpu.add_fallback(MSR_READ, Arc::new(DefaultMsr))?;
    vcpu.add_fallback(MSR_WRITE, Arc::new(DefaultMsr))?;
    hypercall::install(vcpu)?;

    vcpu.add_handler(CPUID, Arc::new(Cpuid))?;
    vcpu.add_handler(HLT, Arc::new(Hlt))?;
    vcpu.add_handler(EXTERNAL_INTERRUPT, Arc::new(ExternalInterrupt))?;
    vcpu.add_handler(EXCEPTION_NMI, Arc::new(Nmi))?;
    vcpu.add_handler(IO_INSTRUCTION, Arc::new(PciLatch))?;
    if vcpu.is_host() {
        vcpu.add_handler(IO_INSTRUCTION, Arc::new(QemuExit))?;
    }

    for device in domain.pci_devices() {
        vcpu.add_handler(IO_INSTRUCTION, device.clone())?;
    }
    if !domain.is_root() {
        let lapic = Arc::new(Lapic);
        vcpu.add_handler(MSR_READ, lapic.clone())?;
        vcpu.add_handler(MSR_WRITE, lapic.clone())?;
        vcpu.add_handler(EPT_VIOLATION, lapic)?;
        vcpu.add_handler(EPT_VIOLATION, domain.ioapic().clone())?;
    }
    Ok(())
}

struct Cpuid;

impl<H: Hal> ExitHandler<H> for Cpuid {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let regs = *cx.regs()?;
        let (leaf, subleaf) = (regs.rax as u32, regs.rcx as u32);

        let res = match (leaf, subleaf) {
            (LEAF_HK_APIC, 0) => {
                let vcpu = cx.vcpu()?;
                CpuIdResult {
                    eax: vcpu.apic_id(),
                    ebx: vcpu.timer_vector() as u32,
                    ecx: 0,
                    edx: 0,
                }
            }
            (LEAF_HK_APIC, 1) => {
                cx.vcpu_mut()?.set_timer_vector(regs.rbx as u8);
                return side_channel_done(cx);
            }
            (LEAF_HK_NDVM_ROUTE, 0) => {
                let domain_id = cx.vcpu()?.domain_id();
                let domain = cx.hk.domain_mut_or_err(domain_id)?;
                if domain.kind() != DomainKind::Ndvm {
                    return Err(ExitError::Guest(axerrno::ax_err_type!(
                        PermissionDenied,
                        "interrupt routes are reserved to NDVMs"
                    )));
                }
                domain.add_irq_route(regs.rbx as u8, regs.rdx as u8);
                return side_channel_done(cx);
            }
            (LEAF_FEATURE_INFO, _) => {
                const FEATURE_VMX: u32 = 1 << 5;
                const FEATURE_HYPERVISOR: u32 = 1 << 31;
                let mut res = H::cpuid(leaf, subleaf);
                res.ecx &= !FEATURE_VMX;
                res.ecx |= FEATURE_HYPERVISOR;
                res
            }
            (LEAF_STRUCTURED_EXTENDED_FEATURE_FLAGS_ENUMERATION, 0) => {
                let mut res = H::cpuid(leaf, subleaf);
                // Bit 05: WAITPKG.
                res.ecx.set_bit(5, false);
                // Bit 16: LA57, guest walks only handle four levels.
                res.ecx.set_bit(16, false);
                res
            }
            (LEAF_HYPERVISOR_INFO, _) => CpuIdResult {
                eax: LEAF_HYPERVISOR_FEATURE,
                ebx: vendor_word(0),
                ecx: vendor_word(1),
                edx: vendor_word(2),
            },
            (LEAF_HYPERVISOR_FEATURE, _) => CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            },
            _ => H::cpuid(leaf, subleaf),
        };

        trace!(
            "[HK] vcpu {:#x}: CPUID({:#x}, {:#x}): {:?}",
            cx.vcpu_id, leaf, subleaf, res
        );
        let regs = cx.regs_mut()?;
        regs.rax = res.eax as _;
        regs.rbx = res.ebx as _;
        regs.rcx = res.ecx as _;
        regs.rdx = res.edx as _;
        cx.advance_rip()?;
        Ok(true)
    }
}

fn vendor_word(index: usize) -> u32 {
    let bytes = &VENDOR_STR[index * 4..index * 4 + 4];
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn side_channel_done<H: Hal>(cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
    cx.set_result(abi::SUCCESS)?;
    cx.advance_rip()?;
    Ok(true)
}

struct Hlt;

impl<H: Hal> ExitHandler<H> for Hlt {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        if !cx.vcpu()?.is_host() {
            let parent = cx.hk.return_hlt(cx.vcpu_id)?;
            cx.transfer(parent);
        }
        cx.advance_rip()?;
        Ok(true)
    }
}

struct ExternalInterrupt;

impl<H: Hal> ExitHandler<H> for ExternalInterrupt {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let Some(info) = cx.exit.interrupt_info() else {
            return Ok(false);
        };
        trace!("[HK] vcpu {:#x}: host irq {:#x}", cx.vcpu_id, info.vector);
        H::handle_host_irq(info.vector);
        cx.hk.deliver_host_irq(info.vector);

        if !cx.vcpu()?.is_host() {
            let parent = cx.hk.return_resume_after_interrupt(cx.vcpu_id)?;
            cx.transfer(parent);
        }
        Ok(true)
    }
}

struct Nmi;

impl<H: Hal> ExitHandler<H> for Nmi {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        match cx.exit.interrupt_info() {
            Some(info) if info.interruption_type == InterruptInfo::NMI_TYPE => {
                debug!("[HK] vcpu {:#x}: NMI forwarded to the host", cx.vcpu_id);
                H::handle_host_irq(info.vector);
                Ok(true)
            }
            // Guest exceptions are fatal unless some other handler wants them.
            _ => Ok(false),
        }
    }
}

/// Latches the PCI config address written to `0xCF8`.
struct PciLatch;

impl<H: Hal> ExitHandler<H> for PciLatch {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        if cx.reason() != ExitReason::IO_INSTRUCTION {
            return Ok(false);
        }
        let io = cx.exit.io_info();
        if io.port != CONFIG_ADDRESS_PORT || io.width() != Some(AccessWidth::Dword) || io.is_string
        {
            return Ok(false);
        }

        let owns_hardware = cx.domain()?.owns_hardware();
        let vcpu = cx.vcpu_mut()?;
        if io.is_in {
            let latch = vcpu.pci_latch;
            vcpu.ctx_mut().regs.set_io_result(AccessWidth::Dword, latch);
        } else {
            let latch = vcpu.ctx().regs.io_operand(AccessWidth::Dword);
            vcpu.pci_latch = latch;
            if owns_hardware {
                H::port_write(CONFIG_ADDRESS_PORT, AccessWidth::Dword, latch);
            }
        }
        cx.advance_rip()?;
        Ok(true)
    }
}

/// Powers the machine off when a host vCPU writes the QEMU exit port.
struct QemuExit;

impl<H: Hal> ExitHandler<H> for QemuExit {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        if cx.reason() != ExitReason::IO_INSTRUCTION {
            return Ok(false);
        }
        let io = cx.exit.io_info();
        if io.port == QEMU_EXIT_PORT
            && !io.is_in
            && io.width() == Some(AccessWidth::Word)
            && cx.regs()?.rax == QEMU_EXIT_MAGIC
        {
            info!("[HK] vcpu {:#x}: system down", cx.vcpu_id);
            cx.shutdown();
            return Ok(true);
        }
        Ok(false)
    }
}

/// Port accesses nothing else claimed.
///
/// Root and NDVM domains reach the physical port, as does any domain on its
/// pass-through UART. The capture UART is emulated. Everything else reads as
/// all-ones and drops writes, which is what an empty bus answers.
struct DefaultIo;

impl<H: Hal> ExitHandler<H> for DefaultIo {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let io = cx.exit.io_info();
        let Some(width) = io.width() else {
            return ax_err!(InvalidInput, "bad I/O access size").map_err(ExitError::from);
        };
        if io.is_string {
            return Err(ExitError::Unclaimed(ExitReason::IO_INSTRUCTION));
        }

        let port = io.port;
        let domain = cx.domain()?;
        let domain_id = domain.id();
        let capture = domain
            .uart()
            .filter(|base| (*base..base.saturating_add(8)).contains(&port));
        let passthrough = domain.owns_hardware() || domain.is_pt_uart_port(port);

        if let Some(base) = capture {
            if io.is_in {
                let value = if port - base == UART_LSR { UART_LSR_IDLE } else { 0 };
                cx.regs_mut()?.set_io_result(width, value);
            } else if port == base {
                let byte = cx.regs()?.io_operand(AccessWidth::Byte) as u8;
                cx.hk.domain_mut_or_err(domain_id)?.uart_write(byte);
            }
        } else if passthrough {
            if pci::is_data_port(port) {
                // Another core may have moved the physical latch since.
                let latch = cx.vcpu()?.pci_latch;
                H::port_write(CONFIG_ADDRESS_PORT, AccessWidth::Dword, latch);
            }
            let regs = cx.regs_mut()?;
            if io.is_in {
                regs.set_io_result(width, H::port_read(port, width));
            } else {
                H::port_write(port, width, regs.io_operand(width));
            }
        } else if io.is_in {
            trace!("[HK] domain {}: read of absent port {:#x}", domain_id, port);
            cx.regs_mut()?.set_io_result(width, u32::MAX);
        } else {
            trace!("[HK] domain {}: write to absent port {:#x} dropped", domain_id, port);
        }
        cx.advance_rip()?;
        Ok(true)
    }
}

/// MSRs nothing else claimed read as zero and ignore writes.
struct DefaultMsr;

impl<H: Hal> ExitHandler<H> for DefaultMsr {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError> {
        let msr = cx.regs()?.rcx as u32;
        if cx.reason() == ExitReason::MSR_READ {
            debug!("[HK] vcpu {:#x}: rdmsr {:#x} -> 0", cx.vcpu_id, msr);
            cx.regs_mut()?.set_edx_eax(0);
        } else {
            debug!("[HK] vcpu {:#x}: wrmsr {:#x} ignored", cx.vcpu_id, msr);
        }
        cx.advance_rip()?;
        Ok(true)
    }
}
