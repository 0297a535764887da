use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;

use axerrno::{AxResult, ax_err};

use crate::context::VcpuContext;
use crate::device::lapic::LapicState;
use crate::dispatch::{ExitHandler, HandlerTable};
use crate::exit::ExitReason;
use crate::{DomainId, Hal, VCpuId};

/// Lifecycle state of a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VCpuState {
    /// Built, handlers may still be registered, never entered.
    Created,
    /// Executing guest code, or current on its core.
    Running,
    /// Waiting for a child vCPU to hand control back.
    ParentSuspended,
    /// Handed control back to its parent and may be run again.
    Stopped,
    /// Terminal. Nothing resumes a killed vCPU.
    Killed,
}

/// One virtual processor bound to a domain.
pub struct VCpu<H: Hal> {
    id: VCpuId,
    domain_id: DomainId,
    is_host: bool,
    state: VCpuState,
    /// Resume target, looked up in the registry on every use.
    parent: Option<VCpuId>,
    ctx: VcpuContext,
    handlers: HandlerTable<H>,
    apic_id: u32,
    timer_vector: u8,
    pending: VecDeque<u8>,
    /// Last value written to the PCI address-select port.
    pub(crate) pci_latch: u32,
    pub(crate) lapic: LapicState,
}

impl<H: Hal> VCpu<H> {
    pub(crate) fn new(
        id: VCpuId,
        domain_id: DomainId,
        is_host: bool,
        apic_id: u32,
        ctx: VcpuContext,
    ) -> Self {
        Self {
            id,
            domain_id,
            is_host,
            state: VCpuState::Created,
            parent: None,
            ctx,
            handlers: HandlerTable::default(),
            apic_id,
            timer_vector: 0,
            pending: VecDeque::new(),
            pci_latch: 0,
            lapic: LapicState::default(),
        }
    }

    pub const fn id(&self) -> VCpuId {
        self.id
    }

    pub const fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    /// Host vCPUs are the roots of the resume chain.
    pub const fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn state(&self) -> VCpuState {
        self.state
    }

    pub fn parent(&self) -> Option<VCpuId> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Option<VCpuId>) {
        self.parent = parent;
    }

    pub fn ctx(&self) -> &VcpuContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut VcpuContext {
        &mut self.ctx
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn timer_vector(&self) -> u8 {
        self.timer_vector
    }

    pub fn set_timer_vector(&mut self, vector: u8) {
        self.timer_vector = vector;
    }

    /// Moves the vCPU from one of `from` to `to`.
    ///
    /// [`VCpuState::Killed`] is never left, whatever `from` says.
    pub fn transition_state(&mut self, from: &[VCpuState], to: VCpuState) -> AxResult {
        if self.state == VCpuState::Killed || !from.contains(&self.state) {
            return ax_err!(
                BadState,
                format!(
                    "vcpu {:#x} is {:?}, expected one of {:?}",
                    self.id, self.state, from
                )
            );
        }
        trace!("[HK] vcpu {:#x}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    pub(crate) fn kill(&mut self) {
        if self.state != VCpuState::Killed {
            debug!("[HK] vcpu {:#x} killed in state {:?}", self.id, self.state);
            self.state = VCpuState::Killed;
        }
    }

    /// Whether this vCPU still holds a core, directly or through a child.
    pub fn is_live(&self) -> bool {
        matches!(self.state, VCpuState::Running | VCpuState::ParentSuspended)
    }

    /// Registers `handler` so it runs before every handler already
    /// registered for `reason`. Only allowed before the vCPU first runs.
    pub fn add_handler(&mut self, reason: ExitReason, handler: Arc<dyn ExitHandler<H>>) -> AxResult {
        self.ensure_registrable()?;
        self.handlers.push_front(reason, handler);
        Ok(())
    }

    /// Registers `handler` behind every handler already registered for `reason`.
    pub fn add_fallback(
        &mut self,
        reason: ExitReason,
        handler: Arc<dyn ExitHandler<H>>,
    ) -> AxResult {
        self.ensure_registrable()?;
        self.handlers.push_back(reason, handler);
        Ok(())
    }

    pub fn handlers(&self) -> &HandlerTable<H> {
        &self.handlers
    }

    fn ensure_registrable(&self) -> AxResult {
        if self.state != VCpuState::Created {
            return ax_err!(BadState, "exit handlers are fixed once a vcpu has run");
        }
        Ok(())
    }

    pub(crate) fn queue_interrupt(&mut self, vector: u8) {
        self.pending.push_back(vector);
    }

    pub(crate) fn take_pending_interrupt(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }

    pub fn pending_interrupts(&self) -> impl Iterator<Item = u8> + '_ {
        self.pending.iter().copied()
    }
}
