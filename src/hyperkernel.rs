use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use axerrno::{AxResult, ax_err, ax_err_type};
use page_table_entry::MappingFlags;
use page_table_multiarch::PageSize;

use crate::builtin;
use crate::config::HyperkernelConfig;
use crate::context::VcpuContext;
use crate::device::PciDevice;
use crate::dispatch::{Disposition, ExitContext};
use crate::domain::{DescriptorTables, Domain, DomainKind, E820Entry};
use crate::error::{ExitError, HkError};
use crate::exit::{ExitInfo, ExitReason};
use crate::fault;
use crate::hypercall::abi;
use crate::mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, PAGE_SIZE, page_offset};
use crate::page_table::{GuestPageTable, GuestPageWalkInfo};
use crate::percpu::CoreState;
use crate::shootdown::Shootdown;
use crate::vcpu::{VCpu, VCpuState};
use crate::{DomainId, Hal, VCpuId};

/// Id of the privileged root domain.
pub const ROOT_DOMAIN: DomainId = 0;

/// Runs a vCPU context on the hardware until its next VM exit.
pub trait GuestEntry {
    /// Enters `vcpu`, injecting `event` first if there is one.
    fn enter(
        &mut self,
        vcpu: VCpuId,
        ctx: &mut VcpuContext,
        event: Option<u8>,
    ) -> AxResult<ExitInfo>;
}

/// Plain data that can be copied in and out of guest memory.
///
/// # Safety
///
/// Every bit pattern must be a valid value of the type.
pub unsafe trait GuestPod: Copy + Default {}

unsafe impl GuestPod for u64 {}
unsafe impl GuestPod for E820Entry {}

/// The registry of all domains and vCPUs, and the exit loop driving them.
pub struct Hyperkernel<H: Hal> {
    config: HyperkernelConfig,
    domains: BTreeMap<DomainId, Domain<H>>,
    vcpus: BTreeMap<VCpuId, VCpu<H>>,
    next_domain_id: DomainId,
    next_vcpu_id: VCpuId,
    cores: BTreeMap<usize, CoreState>,
    shootdown: Arc<Shootdown>,
}

impl<H: Hal> Hyperkernel<H> {
    pub fn new(config: HyperkernelConfig) -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(ROOT_DOMAIN, Domain::new_root(&config));
        info!("[HK] hyperkernel initialized: {:x?}", config);
        Self {
            next_domain_id: ROOT_DOMAIN + 1,
            next_vcpu_id: config.guest_vcpuid_base,
            config,
            domains,
            vcpus: BTreeMap::new(),
            cores: BTreeMap::new(),
            shootdown: Arc::new(Shootdown::new()),
        }
    }

    pub fn config(&self) -> &HyperkernelConfig {
        &self.config
    }

    /// Shootdown state to hand to the IPI handler of every core.
    pub fn shootdown(&self) -> &Arc<Shootdown> {
        &self.shootdown
    }

    /// Creates the host vCPU of core `cpu` and makes it current there.
    pub fn start_core(&mut self, cpu: usize) -> AxResult<VCpuId> {
        let id = cpu as VCpuId;
        if self.cores.contains_key(&cpu) {
            return ax_err!(AlreadyExists, "core already started");
        }
        if id >= self.config.guest_vcpuid_base {
            return ax_err!(InvalidInput, "core id collides with guest vcpu ids");
        }
        self.ensure_vcpu_capacity()?;

        let mut vcpu = VCpu::new(id, ROOT_DOMAIN, true, cpu as u32, VcpuContext::default());
        builtin::install(&mut vcpu, self.domain_or_err(ROOT_DOMAIN)?)?;
        vcpu.transition_state(&[VCpuState::Created], VCpuState::Running)?;
        self.vcpus.insert(id, vcpu);
        self.cores.insert(cpu, CoreState::new(cpu, id));
        info!("[HK] core {} started with host vcpu {:#x}", cpu, id);
        Ok(id)
    }

    /// vCPU that core `cpu` enters next.
    pub fn current_vcpu(&self, cpu: usize) -> Option<VCpuId> {
        self.cores.get(&cpu).map(|core| core.current)
    }

    pub fn core(&self, cpu: usize) -> Option<&CoreState> {
        self.cores.get(&cpu)
    }

    pub fn domain(&self, id: DomainId) -> Option<&Domain<H>> {
        self.domains.get(&id)
    }

    pub fn domain_mut(&mut self, id: DomainId) -> Option<&mut Domain<H>> {
        self.domains.get_mut(&id)
    }

    pub fn domain_or_err(&self, id: DomainId) -> AxResult<&Domain<H>> {
        self.domains
            .get(&id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such domain"))
    }

    pub fn domain_mut_or_err(&mut self, id: DomainId) -> AxResult<&mut Domain<H>> {
        self.domains
            .get_mut(&id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such domain"))
    }

    pub fn vcpu(&self, id: VCpuId) -> Option<&VCpu<H>> {
        self.vcpus.get(&id)
    }

    pub fn vcpu_mut(&mut self, id: VCpuId) -> Option<&mut VCpu<H>> {
        self.vcpus.get_mut(&id)
    }

    pub fn vcpu_or_err(&self, id: VCpuId) -> AxResult<&VCpu<H>> {
        self.vcpus
            .get(&id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such vcpu"))
    }

    pub fn vcpu_mut_or_err(&mut self, id: VCpuId) -> AxResult<&mut VCpu<H>> {
        self.vcpus
            .get_mut(&id)
            .ok_or_else(|| ax_err_type!(NotFound, "no such vcpu"))
    }

    /// All vCPUs bound to `domain_id`, in id order.
    pub fn vcpus_of(&self, domain_id: DomainId) -> impl Iterator<Item = &VCpu<H>> + '_ {
        self.vcpus
            .values()
            .filter(move |vcpu| vcpu.domain_id() == domain_id)
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }
}

// domain lifecycle
impl<H: Hal> Hyperkernel<H> {
    /// Creates an empty guest domain and returns its fresh id.
    pub fn create_domain(&mut self) -> AxResult<DomainId> {
        if self.domains.len() >= self.config.max_domains {
            return ax_err!(NoMemory, "domain limit reached");
        }
        let id = self.next_domain_id;
        let domain = Domain::new_guest(id, &self.config)?;
        self.next_domain_id += 1;
        self.domains.insert(id, domain);
        info!("[HK] domain {} created", id);
        Ok(id)
    }

    /// Tears down domain `id` together with its vCPUs and mappings.
    pub fn destroy_domain(&mut self, caller: DomainId, id: DomainId) -> AxResult {
        if id == caller {
            return ax_err!(PermissionDenied, "a domain cannot destroy itself");
        }
        if id == ROOT_DOMAIN {
            return ax_err!(PermissionDenied, "the root domain cannot be destroyed");
        }
        self.domain_or_err(id)?;
        if self.vcpus_of(id).any(|vcpu| vcpu.is_live()) {
            return ax_err!(BadState, "domain still has running vcpus");
        }
        if self
            .vcpus
            .values()
            .filter_map(|vcpu| vcpu.parent())
            .any(|parent| self.vcpu(parent).is_some_and(|p| p.domain_id() == id))
        {
            return ax_err!(BadState, "a vcpu of the domain is still a parent");
        }

        let vcpus: Vec<VCpuId> = self.vcpus_of(id).map(|vcpu| vcpu.id()).collect();
        for vcpu in vcpus {
            self.vcpus.remove(&vcpu);
        }
        self.domains.remove(&id);
        info!("[HK] domain {} destroyed", id);
        Ok(())
    }

    /// Looks up domain `id` for a configuration change by `caller`.
    fn foreign_domain_mut(&mut self, caller: DomainId, id: DomainId) -> AxResult<&mut Domain<H>> {
        if id == caller {
            return ax_err!(PermissionDenied, "operation not permitted on the caller's domain");
        }
        self.domain_mut_or_err(id)
    }

    pub fn add_e820_entry(&mut self, caller: DomainId, id: DomainId, entry: E820Entry) -> AxResult {
        self.foreign_domain_mut(caller, id)?.add_e820_entry(entry)
    }

    pub fn set_entry(&mut self, caller: DomainId, id: DomainId, gpa: GuestPhysAddr) -> AxResult {
        self.foreign_domain_mut(caller, id)?.set_entry(gpa);
        Ok(())
    }

    pub fn set_uart(&mut self, caller: DomainId, id: DomainId, port: u16) -> AxResult {
        self.foreign_domain_mut(caller, id)?.set_uart(port);
        Ok(())
    }

    pub fn set_pt_uart(&mut self, caller: DomainId, id: DomainId, port: u16) -> AxResult {
        self.foreign_domain_mut(caller, id)?.set_pt_uart(port);
        Ok(())
    }

    pub fn dump_uart(&mut self, caller: DomainId, id: DomainId, buf: &mut [u8]) -> AxResult<usize> {
        Ok(self.foreign_domain_mut(caller, id)?.dump_uart(buf))
    }

    pub fn set_ndvm(&mut self, caller: DomainId, id: DomainId) -> AxResult {
        self.foreign_domain_mut(caller, id)?.set_ndvm()?;
        info!("[HK] domain {} is now an NDVM", id);
        Ok(())
    }

    /// Adds an emulated PCI function to `domain_id`.
    ///
    /// Only possible while none of the domain's vCPUs has run yet, since its
    /// handler joins their chains.
    pub fn add_pci_device(&mut self, domain_id: DomainId, device: PciDevice) -> AxResult<Arc<PciDevice>> {
        if self
            .vcpus_of(domain_id)
            .any(|vcpu| vcpu.state() != VCpuState::Created)
        {
            return ax_err!(BadState, "domain already has running vcpus");
        }
        let device = Arc::new(device);
        self.domain_mut_or_err(domain_id)?
            .add_pci_device(device.clone())?;
        for vcpu in self.vcpus.values_mut() {
            if vcpu.domain_id() == domain_id {
                vcpu.add_handler(ExitReason::IO_INSTRUCTION, device.clone())?;
            }
        }
        debug!("[HK] domain {}: emulating pci {:?}", domain_id, device.bdf());
        Ok(device)
    }
}

// vcpu lifecycle
impl<H: Hal> Hyperkernel<H> {
    fn ensure_vcpu_capacity(&self) -> AxResult {
        if self.vcpus.len() >= self.config.max_vcpus {
            return ax_err!(NoMemory, "vcpu limit reached");
        }
        Ok(())
    }

    /// Creates a vCPU bound to guest domain `domain_id`.
    pub fn create_vcpu(&mut self, domain_id: DomainId) -> AxResult<VCpuId> {
        self.ensure_vcpu_capacity()?;
        if self.domain_or_err(domain_id)?.is_root() {
            return ax_err!(InvalidInput, "root vcpus are created per core");
        }
        let apic_id = self.domain_mut_or_err(domain_id)?.allocate_apic_id();
        let domain = self.domain_or_err(domain_id)?;

        let mut ctx = VcpuContext::default();
        if let Some(base) = domain.descriptor_gpa() {
            let base = base.as_usize() as u64;
            ctx.gdtr_base = base + DescriptorTables::<H>::GDT_OFFSET as u64;
            ctx.gdtr_limit = DescriptorTables::<H>::GDT_LIMIT;
            ctx.idtr_base = base + DescriptorTables::<H>::IDT_OFFSET as u64;
            ctx.idtr_limit = DescriptorTables::<H>::IDT_LIMIT;
            ctx.tr_base = base + DescriptorTables::<H>::TSS_OFFSET as u64;
        }
        if let Some(entry) = domain.entry() {
            ctx.rip = entry.as_usize() as u64;
        }

        let id = self.next_vcpu_id;
        let mut vcpu = VCpu::new(id, domain_id, false, apic_id, ctx);
        builtin::install(&mut vcpu, domain)?;

        self.next_vcpu_id += 1;
        self.vcpus.insert(id, vcpu);
        info!("[HK] vcpu {:#x} created in domain {}", id, domain_id);
        Ok(id)
    }

    /// Kills vCPU `id`. If it holds a core it unwinds to its parent on its next exit.
    pub fn kill_vcpu(&mut self, caller: VCpuId, id: VCpuId) -> AxResult {
        if id == caller {
            return ax_err!(PermissionDenied, "a vcpu cannot kill itself");
        }
        let vcpu = self.vcpu_mut_or_err(id)?;
        if vcpu.is_host() {
            return ax_err!(PermissionDenied, "host vcpus cannot be killed");
        }
        vcpu.kill();
        Ok(())
    }

    /// Removes vCPU `id` from the registry.
    pub fn destroy_vcpu(&mut self, caller: VCpuId, id: VCpuId) -> AxResult {
        if id == caller {
            return ax_err!(PermissionDenied, "a vcpu cannot destroy itself");
        }
        let vcpu = self.vcpu_or_err(id)?;
        if vcpu.is_host() {
            return ax_err!(PermissionDenied, "host vcpus cannot be destroyed");
        }
        if vcpu.is_live() {
            return ax_err!(BadState, "vcpu is still running");
        }
        if self.is_parent(id) {
            return ax_err!(BadState, "vcpu is still the parent of a running vcpu");
        }
        self.vcpus.remove(&id);
        info!("[HK] vcpu {:#x} destroyed", id);
        Ok(())
    }

    /// Launches `id` as a child of `caller` on the caller's core.
    ///
    /// A fresh vCPU starts at `entry` (or its domain's entry point when
    /// `entry` is zero) with stack `stack`. A stopped vCPU resumes where it
    /// handed control back and ignores both.
    pub fn run_vcpu(&mut self, caller: VCpuId, id: VCpuId, entry: u64, stack: u64) -> AxResult<VCpuId> {
        if id == caller {
            return ax_err!(PermissionDenied, "a vcpu cannot run itself");
        }
        if self.vcpu_or_err(caller)?.state() != VCpuState::Running {
            return ax_err!(BadState, "caller is not running");
        }
        let target = self.vcpu_or_err(id)?;
        if target.is_host() {
            return ax_err!(PermissionDenied, "host vcpus are not launched");
        }
        let domain_entry = self
            .domain(target.domain_id())
            .and_then(|domain| domain.entry());

        let target = self.vcpu_mut_or_err(id)?;
        let fresh = target.state() == VCpuState::Created;
        target.transition_state(&[VCpuState::Created, VCpuState::Stopped], VCpuState::Running)?;
        if fresh {
            let ctx = target.ctx_mut();
            ctx.rip = match (entry, domain_entry) {
                (0, Some(gpa)) => gpa.as_usize() as u64,
                _ => entry,
            };
            ctx.rsp = stack;
        }
        target.set_parent(Some(caller));

        self.vcpu_mut_or_err(caller)?
            .transition_state(&[VCpuState::Running], VCpuState::ParentSuspended)?;
        self.switch_core(caller, id);
        info!("[HK] vcpu {:#x} runs vcpu {:#x}", caller, id);
        Ok(id)
    }

    pub fn return_hlt(&mut self, child: VCpuId) -> AxResult<VCpuId> {
        self.return_to_parent(child, abi::RUN_HLT, 0, false)
    }

    pub fn return_fault(&mut self, child: VCpuId) -> AxResult<VCpuId> {
        self.return_to_parent(child, abi::RUN_FAULT, abi::FAILURE, true)
    }

    pub fn return_resume_after_interrupt(&mut self, child: VCpuId) -> AxResult<VCpuId> {
        self.return_to_parent(child, abi::RUN_RESUME_AFTER_INTERRUPT, 0, false)
    }

    pub fn return_yield(&mut self, child: VCpuId, usec: u64) -> AxResult<VCpuId> {
        self.return_to_parent(child, abi::RUN_YIELD, usec, false)
    }

    /// Hands `child`'s core back to its parent with `code` in `rax` and `arg`
    /// in `rdx`, returning the vCPU that now holds the core.
    ///
    /// The parent is resolved by id here. A parent killed while it waited is
    /// unwound as well, its own parent receiving a fault. Nothing changes
    /// unless a live ancestor is found.
    fn return_to_parent(&mut self, child: VCpuId, code: u64, arg: u64, kill: bool) -> AxResult<VCpuId> {
        let vcpu = self.vcpu_or_err(child)?;
        if vcpu.is_host() {
            return ax_err!(BadState, "host vcpus have no parent");
        }
        let mut parent = vcpu
            .parent()
            .ok_or_else(|| ax_err_type!(BadState, "vcpu has no parent"))?;
        let (mut code, mut arg) = (code, arg);
        let mut unwound = Vec::new();
        loop {
            let target = self.vcpu_or_err(parent)?;
            match target.state() {
                VCpuState::Killed => {
                    let next = target
                        .parent()
                        .ok_or_else(|| ax_err_type!(NotFound, "killed parent has no parent"))?;
                    warn!("[HK] vcpu {:#x} was killed while waiting, unwinding", parent);
                    unwound.push(parent);
                    (code, arg) = (abi::RUN_FAULT, abi::FAILURE);
                    parent = next;
                }
                VCpuState::ParentSuspended => break,
                state => {
                    warn!("[HK] parent {:#x} of vcpu {:#x} is {:?}", parent, child, state);
                    return ax_err!(BadState, "parent is not waiting for its child");
                }
            }
        }

        let vcpu = self.vcpu_mut_or_err(child)?;
        if kill {
            vcpu.kill();
        } else {
            vcpu.transition_state(&[VCpuState::Running], VCpuState::Stopped)?;
        }
        vcpu.set_parent(None);
        for id in unwound {
            self.vcpu_mut_or_err(id)?.set_parent(None);
        }
        let target = self.vcpu_mut_or_err(parent)?;
        target.transition_state(&[VCpuState::ParentSuspended], VCpuState::Running)?;
        let regs = &mut target.ctx_mut().regs;
        regs.rax = code;
        regs.rdx = arg;

        self.switch_core(child, parent);
        debug!(
            "[HK] vcpu {:#x} returned to {:#x}: code {}, arg {:#x}",
            child, parent, code, arg
        );
        Ok(parent)
    }

    /// Whether some vCPU would hand its core back to `id`.
    fn is_parent(&self, id: VCpuId) -> bool {
        self.vcpus.values().any(|vcpu| vcpu.parent() == Some(id))
    }

    fn switch_core(&mut self, from: VCpuId, to: VCpuId) {
        for core in self.cores.values_mut().filter(|core| core.current == from) {
            core.current = to;
        }
    }
}

// memory
impl<H: Hal> Hyperkernel<H> {
    pub fn map_gpa(
        &mut self,
        domain_id: DomainId,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: PageSize,
        flags: MappingFlags,
    ) -> AxResult {
        self.update_translation(domain_id, |domain| domain.map(gpa, hpa, size, flags))
    }

    /// Unmaps `gpa`, returning the host page that backed it.
    pub fn unmap_gpa(&mut self, domain_id: DomainId, gpa: GuestPhysAddr) -> AxResult<HostPhysAddr> {
        self.update_translation(domain_id, |domain| domain.unmap(gpa))
            .map(|(hpa, _)| hpa)
    }

    /// Applies `f` to the translation of `domain_id`.
    ///
    /// While the domain has a vCPU holding a core, the change is made under
    /// a shootdown. Cached translations are flushed before the other cores
    /// are released.
    fn update_translation<T>(
        &mut self,
        domain_id: DomainId,
        f: impl FnOnce(&mut Domain<H>) -> AxResult<T>,
    ) -> AxResult<T> {
        let live = self.vcpus_of(domain_id).any(|vcpu| vcpu.is_live());
        let spin_limit = self.config.shootdown_spin_limit;
        let shootdown = self.shootdown.clone();
        let domain = self.domain_mut_or_err(domain_id)?;
        if !live {
            return f(domain);
        }

        shootdown.initiate::<H, _>(spin_limit, || {
            let ret = f(&mut *domain);
            if let Some(eptp) = domain.eptp() {
                H::flush_ept(eptp);
            }
            ret
        })?
    }

    /// Maps the page backing `self_gpa` of the caller's domain at
    /// `foreign_gpa` of domain `foreign`.
    pub fn share_page(
        &mut self,
        caller: VCpuId,
        foreign: DomainId,
        self_gpa: GuestPhysAddr,
        foreign_gpa: GuestPhysAddr,
        flags: MappingFlags,
    ) -> AxResult {
        let self_domain = self.vcpu_or_err(caller)?.domain_id();
        if foreign == self_domain {
            return ax_err!(PermissionDenied, "a domain cannot share a page with itself");
        }
        if foreign == ROOT_DOMAIN {
            return ax_err!(PermissionDenied, "the root domain is identity mapped");
        }
        self.domain_or_err(foreign)?;

        let (hpa, held) = self.domain_or_err(self_domain)?.translate(self_gpa)?;
        if !held.contains(flags) {
            return ax_err!(PermissionDenied, "cannot share more rights than held");
        }
        let hpa = HostPhysAddr::from(hpa.as_usize() - page_offset(hpa.as_usize()));
        self.map_gpa(foreign, foreign_gpa, hpa, PageSize::Size4K, flags)?;
        debug!(
            "[HK] domain {} shared {:?} with domain {} at {:?} ({:?})",
            self_domain, self_gpa, foreign, foreign_gpa, flags
        );
        Ok(())
    }

    /// Translates `gva` through the current page tables of `vcpu_id`.
    pub fn translate_gva(&self, vcpu_id: VCpuId, gva: GuestVirtAddr) -> AxResult<GuestPhysAddr> {
        let vcpu = self.vcpu_or_err(vcpu_id)?;
        let ctx = vcpu.ctx();
        if !ctx.paging_enabled() {
            return Ok(GuestPhysAddr::from(gva.as_usize()));
        }

        let domain = self.domain_or_err(vcpu.domain_id())?;
        let info = GuestPageWalkInfo::from_context(ctx);
        let translate = |gpa: GuestPhysAddr| domain.translate(gpa).ok().map(|(hpa, _)| hpa);
        let pt = GuestPageTable::<H>::construct(&info, &translate);
        pt.query(gva).map(|(gpa, _, _)| gpa).map_err(|err| {
            debug!("[HK] vcpu {:#x}: cannot translate {:?}: {:?}", vcpu_id, gva, err);
            ax_err_type!(BadAddress, "guest virtual address not mapped")
        })
    }

    /// Visits the host memory behind `len` bytes at `gva`, one page at a time.
    fn for_each_guest_chunk(
        &self,
        vcpu_id: VCpuId,
        gva: GuestVirtAddr,
        len: usize,
        access: MappingFlags,
        mut f: impl FnMut(*mut u8, core::ops::Range<usize>),
    ) -> AxResult {
        let domain = self.domain_or_err(self.vcpu_or_err(vcpu_id)?.domain_id())?;
        let mut done = 0;
        while done < len {
            let addr = gva.as_usize().wrapping_add(done);
            let chunk = (len - done).min(PAGE_SIZE - page_offset(addr));
            let gpa = self.translate_gva(vcpu_id, GuestVirtAddr::from(addr))?;
            let (hpa, held) = domain.translate(gpa)?;
            if !held.contains(access) {
                return ax_err!(PermissionDenied, "guest buffer lacks access rights");
            }
            let ptr = H::phys_to_virt(hpa).as_usize() as *mut u8;
            f(ptr, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Copies guest memory at `gva` into `buf`.
    pub fn read_guest(&self, vcpu_id: VCpuId, gva: GuestVirtAddr, buf: &mut [u8]) -> AxResult {
        self.for_each_guest_chunk(vcpu_id, gva, buf.len(), MappingFlags::READ, |src, range| {
            let dst = &mut buf[range];
            unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
        })
    }

    /// Copies `buf` into guest memory at `gva`.
    pub fn write_guest(&self, vcpu_id: VCpuId, gva: GuestVirtAddr, buf: &[u8]) -> AxResult {
        self.for_each_guest_chunk(vcpu_id, gva, buf.len(), MappingFlags::WRITE, |dst, range| {
            let src = &buf[range];
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
        })
    }

    /// Copies a guest argument block into host memory.
    pub fn read_guest_obj<T: GuestPod>(&self, vcpu_id: VCpuId, gva: GuestVirtAddr) -> AxResult<T> {
        let mut obj = T::default();
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(&mut obj as *mut T as *mut u8, size_of::<T>())
        };
        self.read_guest(vcpu_id, gva, bytes)?;
        Ok(obj)
    }
}

// interrupts
impl<H: Hal> Hyperkernel<H> {
    /// Marks `vector` pending on `vcpu_id`; it is injected on the next entry.
    pub fn queue_external_interrupt(&mut self, vcpu_id: VCpuId, vector: u8) -> AxResult {
        if vector < 32 {
            return ax_err!(InvalidInput, "vectors below 32 are exceptions");
        }
        let vcpu = self.vcpu_mut_or_err(vcpu_id)?;
        if vcpu.state() == VCpuState::Killed {
            return ax_err!(BadState, "vcpu is killed");
        }
        trace!("[HK] vcpu {:#x}: vector {:#x} pending", vcpu_id, vector);
        vcpu.queue_interrupt(vector);
        Ok(())
    }

    /// Queues `vector` on every live-able vCPU of `domain_id`.
    pub fn broadcast_vector(&mut self, domain_id: DomainId, vector: u8) -> AxResult<usize> {
        self.domain_or_err(domain_id)?;
        let targets: Vec<VCpuId> = self
            .vcpus_of(domain_id)
            .filter(|vcpu| vcpu.state() != VCpuState::Killed)
            .map(|vcpu| vcpu.id())
            .collect();
        for &target in &targets {
            self.queue_external_interrupt(target, vector)?;
        }
        Ok(targets.len())
    }

    /// Raises IOAPIC pin `pin` of `domain_id`.
    pub fn raise_irq(&mut self, domain_id: DomainId, pin: usize) -> AxResult {
        let (vector, dest) = self
            .domain_or_err(domain_id)?
            .ioapic()
            .route(pin)
            .ok_or_else(|| ax_err_type!(BadState, "ioapic pin is masked"))?;
        let target = self
            .vcpus_of(domain_id)
            .find(|vcpu| vcpu.apic_id() == dest)
            .map(|vcpu| vcpu.id())
            .ok_or_else(|| ax_err_type!(NotFound, "no vcpu with the destination apic id"))?;
        self.queue_external_interrupt(target, vector)
    }

    /// Forwards host interrupt `host_irq` to every NDVM routing it, returning
    /// how many domains received it.
    pub fn deliver_host_irq(&mut self, host_irq: u8) -> usize {
        let targets: Vec<(VCpuId, u8)> = self
            .domains
            .values()
            .filter(|domain| domain.kind() == DomainKind::Ndvm)
            .filter_map(|domain| {
                let vector = domain.irq_route(host_irq)?;
                let vcpu = self
                    .vcpus_of(domain.id())
                    .find(|vcpu| vcpu.state() != VCpuState::Killed)?;
                Some((vcpu.id(), vector))
            })
            .collect();
        targets
            .into_iter()
            .filter(|&(vcpu, vector)| self.queue_external_interrupt(vcpu, vector).is_ok())
            .count()
    }
}

// exit loop
impl<H: Hal> Hyperkernel<H> {
    /// Logs the state of `vcpu_id` for post-mortem analysis.
    pub fn dump_fault_diagnostics(&self, vcpu_id: VCpuId) {
        fault::dump(self, vcpu_id);
    }

    /// Dispatches one exit of the vCPU current on core `cpu`.
    pub fn handle_exit(&mut self, cpu: usize, exit: &ExitInfo) -> Result<Disposition, HkError> {
        let vcpu_id = self.current_vcpu(cpu).ok_or(HkError::NoCurrentVcpu(cpu))?;
        let reason = exit.exit_reason;
        trace!(
            "[HK] core {} vcpu {:#x}: exit {:?} @ {:#x}",
            cpu, vcpu_id, reason, exit.guest_rip
        );

        if exit.entry_failure {
            return fault::handle(self, vcpu_id, reason);
        }
        let vcpu = self.vcpu(vcpu_id).ok_or(HkError::Orphaned(vcpu_id))?;
        let chain = vcpu.handlers().chain(reason);
        #[cfg(feature = "tracing")]
        let regs_before = vcpu.ctx().regs;

        let mut cx = ExitContext::new(self, cpu, vcpu_id, exit);
        let mut claimed = false;
        for handler in chain {
            match handler.handle(&mut cx) {
                Ok(true) => {
                    claimed = true;
                    break;
                }
                Ok(false) => {}
                Err(ExitError::Guest(err)) => {
                    debug!("[HK] vcpu {:#x}: {:?} failed: {:?}", vcpu_id, reason, err);
                    if let Ok(vcpu) = cx.vcpu_mut() {
                        vcpu.ctx_mut().regs.rax = abi::FAILURE;
                        vcpu.ctx_mut().advance_rip(exit.exit_instruction_length);
                    }
                    claimed = true;
                    break;
                }
                Err(ExitError::Protocol { group, opcode }) => {
                    error!(
                        "[HK] vcpu {:#x}: unknown opcode {:#x} in group {:#x}",
                        vcpu_id, opcode, group
                    );
                    return Err(HkError::ProtocolViolation {
                        vcpu: vcpu_id,
                        group,
                        opcode,
                    });
                }
                Err(ExitError::Unclaimed(_)) => break,
            }
        }
        let disposition = cx.disposition();

        if !claimed {
            if reason.is_fatal() {
                return fault::handle(self, vcpu_id, reason);
            }
            warn!(
                "[HK] vcpu {:#x}: unclaimed {:?} @ {:#x}, skipped",
                vcpu_id, reason, exit.guest_rip
            );
            if let Some(vcpu) = self.vcpu_mut(vcpu_id) {
                vcpu.ctx_mut().advance_rip(exit.exit_instruction_length);
            }
        }

        #[cfg(feature = "tracing")]
        if let Some(vcpu) = self.vcpu(vcpu_id) {
            let diff = crate::regs::GeneralRegistersDiff::new(regs_before, vcpu.ctx().regs);
            if !diff.is_same() {
                trace!("[HK] vcpu {:#x}: {:?}", vcpu_id, diff);
            }
        }

        if disposition == Disposition::Resume
            && self
                .vcpu(vcpu_id)
                .is_some_and(|vcpu| vcpu.state() == VCpuState::Killed)
        {
            return fault::unwind(self, vcpu_id);
        }
        Ok(disposition)
    }

    /// Runs core `cpu` until a host vCPU shuts the system down or an
    /// unrecoverable error occurs.
    ///
    /// A guest vCPU that cannot be entered is handled like a fatal exit.
    pub fn run<E: GuestEntry>(&mut self, cpu: usize, entry: &mut E) -> Result<(), HkError> {
        loop {
            let vcpu_id = self.current_vcpu(cpu).ok_or(HkError::NoCurrentVcpu(cpu))?;
            let vcpu = self
                .vcpus
                .get_mut(&vcpu_id)
                .ok_or(HkError::Orphaned(vcpu_id))?;
            let is_host = vcpu.is_host();
            let event = vcpu.take_pending_interrupt();
            let exit = match entry.enter(vcpu_id, vcpu.ctx_mut(), event) {
                Ok(exit) => exit,
                Err(err) if is_host => return Err(HkError::Entry(err)),
                Err(err) => {
                    warn!("[HK] vcpu {:#x}: entry failed: {:?}", vcpu_id, err);
                    fault::handle(self, vcpu_id, ExitReason::INVALID_GUEST_STATE)?;
                    continue;
                }
            };
            if self.handle_exit(cpu, &exit)? == Disposition::Shutdown {
                info!("[HK] core {} leaves the run loop", cpu);
                return Ok(());
            }
        }
    }
}
