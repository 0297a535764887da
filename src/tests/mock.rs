//! A host HAL backed by the test process's own memory.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::vec::Vec;

use raw_cpuid::CpuIdResult;

use crate::device::pci::{CONFIG_ADDRESS_PORT, CONFIG_DATA_PORT, is_data_port};
use crate::exit::{AccessWidth, ExitInfo, ExitReason, IoExitInfo};
use crate::mem::{GuestVirtAddr, HostPhysAddr, HostVirtAddr, PAGE_SIZE};
use crate::{Disposition, DomainId, Hal, HkError, Hyperkernel, HyperkernelConfig, Shootdown, VCpuId};

pub struct MockState {
    pub cpu_count: usize,
    pub live_frames: usize,
    pub pci_latch: u32,
    /// Physical config space, keyed by dword-aligned config address.
    pub pci_config: BTreeMap<u32, u32>,
    pub ports: BTreeMap<u16, u32>,
    pub port_writes: Vec<(u16, u32)>,
    pub ipis: usize,
    pub ept_flushes: usize,
    /// Shootdown whose state is sampled on every EPT flush.
    pub watched: Option<Arc<Shootdown>>,
    pub flush_saw_pending: Vec<bool>,
    pub host_irqs: Vec<u8>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            live_frames: 0,
            pci_latch: 0,
            pci_config: BTreeMap::new(),
            ports: BTreeMap::new(),
            port_writes: Vec::new(),
            ipis: 0,
            ept_flushes: 0,
            watched: None,
            flush_saw_pending: Vec::new(),
            host_irqs: Vec::new(),
        }
    }
}

thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::default());
}

pub fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn frame_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

pub struct MockHal;

impl Hal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        let ptr = unsafe { alloc_zeroed(frame_layout()) };
        if ptr.is_null() {
            return None;
        }
        with_state(|s| s.live_frames += 1);
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        unsafe { dealloc(paddr.as_usize() as *mut u8, frame_layout()) };
        with_state(|s| s.live_frames -= 1);
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(vaddr.as_usize())
    }

    fn cpu_count() -> usize {
        with_state(|s| s.cpu_count)
    }

    fn current_cpu() -> usize {
        0
    }

    fn send_ipi_all_but_self(_vector: u8) {
        with_state(|s| s.ipis += 1);
    }

    fn flush_ept(_eptp: u64) {
        with_state(|s| {
            s.ept_flushes += 1;
            if let Some(shootdown) = &s.watched {
                s.flush_saw_pending.push(shootdown.is_pending());
            }
        });
    }

    fn handle_host_irq(vector: u8) {
        with_state(|s| s.host_irqs.push(vector));
    }

    fn port_read(port: u16, width: AccessWidth) -> u32 {
        with_state(|s| {
            let value = if is_data_port(port) {
                let dword = s
                    .pci_config
                    .get(&(s.pci_latch & !3))
                    .copied()
                    .unwrap_or(u32::MAX);
                dword >> ((port - CONFIG_DATA_PORT) * 8)
            } else if port == CONFIG_ADDRESS_PORT {
                s.pci_latch
            } else {
                s.ports.get(&port).copied().unwrap_or(u32::MAX)
            };
            (value as u64 & width.mask()) as u32
        })
    }

    fn port_write(port: u16, _width: AccessWidth, value: u32) {
        with_state(|s| {
            s.port_writes.push((port, value));
            if port == CONFIG_ADDRESS_PORT {
                s.pci_latch = value;
            } else {
                s.ports.insert(port, value);
            }
        })
    }

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        CpuIdResult {
            eax: leaf,
            ebx: subleaf,
            // VMX and WAITPKG/LA57 set, so tests can see them masked.
            ecx: (1 << 5) | (1 << 16),
            edx: 0,
        }
    }
}

pub type TestHk = Hyperkernel<MockHal>;

/// A hyperkernel with core 0 started.
pub fn hyperkernel() -> TestHk {
    hyperkernel_with(HyperkernelConfig::default())
}

pub fn hyperkernel_with(config: HyperkernelConfig) -> TestHk {
    init_logger();
    let mut hk = Hyperkernel::new(config);
    hk.start_core(0).unwrap();
    hk
}

pub const VMCALL_LEN: u32 = 3;
pub const GUEST_ENTRY: u64 = 0x10_0000;
pub const GUEST_STACK: u64 = 0x20_0000;

/// Creates a guest domain with one vCPU and runs it on core 0.
pub fn launch_guest(hk: &mut TestHk) -> (DomainId, VCpuId) {
    let domain = hk.create_domain().unwrap();
    let vcpu = hk.create_vcpu(domain).unwrap();
    let host = current(hk);
    hk.run_vcpu(host, vcpu, GUEST_ENTRY, GUEST_STACK).unwrap();
    (domain, vcpu)
}

pub fn exit(reason: ExitReason, len: u32) -> ExitInfo {
    ExitInfo::new(reason, len, 0)
}

pub fn io_exit(port: u16, width: AccessWidth, is_in: bool) -> ExitInfo {
    exit(ExitReason::IO_INSTRUCTION, 1).with_qualification(IoExitInfo::qualification(port, width, is_in))
}

/// Current vCPU of core 0.
pub fn current(hk: &TestHk) -> VCpuId {
    hk.current_vcpu(0).unwrap()
}

/// Issues a hypercall from the current vCPU of core 0.
pub fn hypercall(
    hk: &mut TestHk,
    group: u64,
    opcode: u64,
    rcx: u64,
    rdx: u64,
) -> Result<Disposition, HkError> {
    let id = current(hk);
    let regs = &mut hk.vcpu_mut(id).unwrap().ctx_mut().regs;
    regs.rax = group;
    regs.rbx = opcode;
    regs.rcx = rcx;
    regs.rdx = rdx;
    hk.handle_exit(0, &exit(ExitReason::VMCALL, VMCALL_LEN))
}

/// `rax` of vCPU `id`.
pub fn rax(hk: &TestHk, id: VCpuId) -> u64 {
    hk.vcpu(id).unwrap().ctx().regs.rax
}

/// Port I/O from the current vCPU of core 0, returning `rax` afterwards.
pub fn port_io(hk: &mut TestHk, port: u16, width: AccessWidth, is_in: bool, value: u64) -> u64 {
    let id = current(hk);
    hk.vcpu_mut(id).unwrap().ctx_mut().regs.rax = value;
    hk.handle_exit(0, &io_exit(port, width, is_in)).unwrap();
    rax(hk, id)
}

/// Host memory standing in for guest RAM. Paging is off in every test
/// guest, and the host vCPUs see host memory 1:1, so on the host side a
/// buffer's address is also its guest-virtual address.
pub fn host_gva<T>(obj: &T) -> u64 {
    obj as *const T as u64
}

pub fn gva(addr: u64) -> GuestVirtAddr {
    GuestVirtAddr::from(addr as usize)
}
