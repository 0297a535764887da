//! Tests for the local APIC and IOAPIC shims.

use std::vec::Vec;

use super::mock::{self, TestHk};
use crate::device::IoApic;
use crate::exit::{AccessWidth, ExitReason, MmioAccess};
use crate::{AxError, Disposition, GuestPhysAddr, VCpuId};

const MSR_APIC_ID: u32 = 0x802;
const MSR_APIC_VERSION: u32 = 0x803;
const MSR_ESR: u32 = 0x828;
const MSR_ICR: u32 = 0x830;
const MSR_LVT_TIMER: u32 = 0x832;
const MSR_SELF_IPI: u32 = 0x83f;

fn rdmsr(hk: &mut TestHk, msr: u32) -> u64 {
    let id = mock::current(hk);
    hk.vcpu_mut(id).unwrap().ctx_mut().regs.rcx = msr as u64;
    hk.handle_exit(0, &mock::exit(ExitReason::MSR_READ, 2)).unwrap();
    hk.vcpu(id).unwrap().ctx().regs.get_edx_eax()
}

fn wrmsr(hk: &mut TestHk, msr: u32, value: u64) {
    let id = mock::current(hk);
    let regs = &mut hk.vcpu_mut(id).unwrap().ctx_mut().regs;
    regs.rcx = msr as u64;
    regs.set_edx_eax(value);
    hk.handle_exit(0, &mock::exit(ExitReason::MSR_WRITE, 2)).unwrap();
}

fn mmio(hk: &mut TestHk, gpa: usize, access: MmioAccess) -> Disposition {
    let exit = mock::exit(ExitReason::EPT_VIOLATION, 4)
        .with_guest_paddr(GuestPhysAddr::from(gpa))
        .with_mmio(access);
    hk.handle_exit(0, &exit).unwrap()
}

fn mmio_read(hk: &mut TestHk, gpa: usize) -> u64 {
    mmio(
        hk,
        gpa,
        MmioAccess {
            is_write: false,
            width: AccessWidth::Dword,
            data: 0,
            reg: 3,
        },
    );
    hk.vcpu(mock::current(hk)).unwrap().ctx().regs.rbx
}

fn mmio_write(hk: &mut TestHk, gpa: usize, data: u64) {
    mmio(
        hk,
        gpa,
        MmioAccess {
            is_write: true,
            width: AccessWidth::Dword,
            data,
            reg: 0,
        },
    );
}

fn pending(hk: &TestHk, id: VCpuId) -> Vec<u8> {
    hk.vcpu(id).unwrap().pending_interrupts().collect()
}

/// A domain with three vCPUs, the second of which is running on core 0.
fn three_vcpus() -> (TestHk, [VCpuId; 3]) {
    let mut hk = mock::hyperkernel();
    let domain = hk.create_domain().unwrap();
    let ids = [(); 3].map(|_| hk.create_vcpu(domain).unwrap());
    hk.run_vcpu(0, ids[1], mock::GUEST_ENTRY, 0).unwrap();
    (hk, ids)
}

#[test]
fn test_x2apic_identity() {
    let (mut hk, _) = three_vcpus();
    assert_eq!(rdmsr(&mut hk, MSR_APIC_ID), 1);
    assert_eq!(rdmsr(&mut hk, MSR_APIC_VERSION), 0x5_0014);
    // Outside the x2APIC range.
    assert_eq!(rdmsr(&mut hk, 0x10), 0);
}

#[test]
fn test_lvt_timer_sets_the_timer_vector() {
    let (mut hk, ids) = three_vcpus();
    wrmsr(&mut hk, MSR_LVT_TIMER, 0x2_0030);
    assert_eq!(hk.vcpu(ids[1]).unwrap().timer_vector(), 0x30);
    assert_eq!(rdmsr(&mut hk, MSR_LVT_TIMER), 0x2_0030);
}

#[test]
fn test_x2apic_ipis() {
    let (mut hk, ids) = three_vcpus();

    // Fixed delivery to APIC id 2.
    wrmsr(&mut hk, MSR_ICR, (2 << 32) | 0x45);
    assert_eq!(pending(&hk, ids[2]), [0x45]);

    wrmsr(&mut hk, MSR_SELF_IPI, 0x46);
    assert_eq!(pending(&hk, ids[1]), [0x46]);

    // All but self.
    wrmsr(&mut hk, MSR_ICR, (3 << 18) | 0x47);
    assert_eq!(pending(&hk, ids[0]), [0x47]);
    assert_eq!(pending(&hk, ids[1]), [0x46]);
    assert_eq!(pending(&hk, ids[2]), [0x45, 0x47]);

    // Non-fixed delivery modes (INIT here) are not emulated.
    wrmsr(&mut hk, MSR_ICR, (2 << 32) | (5 << 8));
    assert_eq!(pending(&hk, ids[2]), [0x45, 0x47]);
}

#[test]
fn test_illegal_ipi_vector_sets_esr() {
    let (mut hk, ids) = three_vcpus();
    wrmsr(&mut hk, MSR_ICR, (1 << 18) | 0x10);
    assert!(pending(&hk, ids[1]).is_empty());
    assert_eq!(rdmsr(&mut hk, MSR_ESR), 1 << 5);

    wrmsr(&mut hk, MSR_ESR, 0);
    assert_eq!(rdmsr(&mut hk, MSR_ESR), 0);
}

#[test]
fn test_xapic_mmio() {
    let (mut hk, ids) = three_vcpus();
    assert_eq!(mmio_read(&mut hk, 0xfee0_0020), 1 << 24);

    // ICR high then low, physical destination in bits 56..64.
    mmio_write(&mut hk, 0xfee0_0310, 0);
    mmio_write(&mut hk, 0xfee0_0300, 0x50);
    assert_eq!(pending(&hk, ids[0]), [0x50]);
    assert_eq!(hk.vcpu(ids[1]).unwrap().ctx().rip, mock::GUEST_ENTRY + 3 * 4);
}

#[test]
fn test_host_has_no_apic_shim() {
    let mut hk = mock::hyperkernel();
    assert_eq!(rdmsr(&mut hk, MSR_APIC_ID), 0);
}

#[test]
fn test_ioapic_registers() {
    let ioapic = IoApic::new();
    ioapic.mmio_write(0x00, 0x01);
    assert_eq!(ioapic.mmio_read(0x00), 0x01);
    assert_eq!(ioapic.mmio_read(0x10), 0x17_0011);

    // Every pin starts masked.
    assert_eq!(ioapic.route(0), None);
    assert_eq!(ioapic.route(24), None);

    ioapic.mmio_write(0x00, 0x10 + 2 * 4);
    ioapic.mmio_write(0x10, 0x33);
    ioapic.mmio_write(0x00, 0x10 + 2 * 4 + 1);
    ioapic.mmio_write(0x10, 2 << 24);
    assert_eq!(ioapic.redirection(4), Some((2 << 56) | 0x33));
    assert_eq!(ioapic.route(4), Some((0x33, 2)));
    assert_eq!(ioapic.mmio_read(0x10), 2 << 24);
}

#[test]
fn test_ioapic_routes_to_apic_id() {
    let (mut hk, ids) = three_vcpus();
    let domain = hk.vcpu(ids[0]).unwrap().domain_id();
    assert_eq!(hk.raise_irq(domain, 4), Err(AxError::BadState));

    // The guest programs pin 4 through the MMIO window.
    mmio_write(&mut hk, 0xfec0_0000, 0x18);
    mmio_write(&mut hk, 0xfec0_0010, 0x61);
    mmio_write(&mut hk, 0xfec0_0000, 0x19);
    mmio_write(&mut hk, 0xfec0_0010, 2 << 24);
    assert_eq!(mmio_read(&mut hk, 0xfec0_0010), 2 << 24);

    hk.raise_irq(domain, 4).unwrap();
    assert_eq!(pending(&hk, ids[2]), [0x61]);
}

#[test]
fn test_unaligned_mmio_is_fatal() {
    let (mut hk, ids) = three_vcpus();
    let ret = mmio(
        &mut hk,
        0xfee0_0020,
        MmioAccess {
            is_write: false,
            width: AccessWidth::Byte,
            data: 0,
            reg: 0,
        },
    );
    assert_eq!(ret, Disposition::Transfer(0));
    assert!(!hk.vcpu(ids[1]).unwrap().is_live());
}
