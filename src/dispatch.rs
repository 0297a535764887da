//! Per-vCPU exit handler chains.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err_type};

use crate::domain::Domain;
use crate::error::ExitError;
use crate::exit::{ExitInfo, ExitReason};
use crate::regs::GeneralRegisters;
use crate::vcpu::VCpu;
use crate::{Hal, Hyperkernel, VCpuId};

/// Where a core continues after an exit has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Re-enter the vCPU that trapped.
    Resume,
    /// Enter another vCPU on this core.
    Transfer(VCpuId),
    /// Leave the run loop.
    Shutdown,
}

/// A delegate registered for one exit reason.
///
/// `Ok(true)` claims the exit and stops the walk of the chain, `Ok(false)`
/// hands it to the next handler.
pub trait ExitHandler<H: Hal> {
    fn handle(&self, cx: &mut ExitContext<'_, H>) -> Result<bool, ExitError>;
}

/// Mutable view of the trapped state handed to every handler of a chain.
pub struct ExitContext<'a, H: Hal> {
    pub hk: &'a mut Hyperkernel<H>,
    pub cpu: usize,
    pub vcpu_id: VCpuId,
    pub exit: &'a ExitInfo,
    disposition: Disposition,
}

impl<'a, H: Hal> ExitContext<'a, H> {
    pub(crate) fn new(
        hk: &'a mut Hyperkernel<H>,
        cpu: usize,
        vcpu_id: VCpuId,
        exit: &'a ExitInfo,
    ) -> Self {
        Self {
            hk,
            cpu,
            vcpu_id,
            exit,
            disposition: Disposition::Resume,
        }
    }

    pub fn reason(&self) -> ExitReason {
        self.exit.exit_reason
    }

    pub fn vcpu(&self) -> AxResult<&VCpu<H>> {
        self.hk
            .vcpu(self.vcpu_id)
            .ok_or_else(|| ax_err_type!(NotFound, "trapping vcpu is gone"))
    }

    pub fn vcpu_mut(&mut self) -> AxResult<&mut VCpu<H>> {
        self.hk
            .vcpu_mut(self.vcpu_id)
            .ok_or_else(|| ax_err_type!(NotFound, "trapping vcpu is gone"))
    }

    pub fn regs(&self) -> AxResult<&GeneralRegisters> {
        Ok(&self.vcpu()?.ctx().regs)
    }

    pub fn regs_mut(&mut self) -> AxResult<&mut GeneralRegisters> {
        Ok(&mut self.vcpu_mut()?.ctx_mut().regs)
    }

    /// Domain owning the trapping vCPU.
    pub fn domain(&self) -> AxResult<&Domain<H>> {
        let domain_id = self.vcpu()?.domain_id();
        self.hk
            .domain(domain_id)
            .ok_or_else(|| ax_err_type!(NotFound, "trapping vcpu has no domain"))
    }

    /// Moves the guest past the trapping instruction.
    pub fn advance_rip(&mut self) -> AxResult {
        let len = self.exit.exit_instruction_length;
        self.vcpu_mut()?.ctx_mut().advance_rip(len);
        Ok(())
    }

    /// Writes the guest-visible result register.
    pub fn set_result(&mut self, value: u64) -> AxResult {
        self.regs_mut()?.rax = value;
        Ok(())
    }

    /// Continues on `vcpu` once the chain finishes.
    pub fn transfer(&mut self, vcpu: VCpuId) {
        self.disposition = Disposition::Transfer(vcpu);
    }

    pub fn shutdown(&mut self) {
        self.disposition = Disposition::Shutdown;
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }
}

/// Handler chains of one vCPU, keyed by exit reason.
pub struct HandlerTable<H: Hal> {
    chains: BTreeMap<ExitReason, VecDeque<Arc<dyn ExitHandler<H>>>>,
}

impl<H: Hal> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            chains: BTreeMap::new(),
        }
    }
}

impl<H: Hal> HandlerTable<H> {
    /// Registers `handler` in front of every handler already present, so it
    /// gets the first chance to claim `reason`.
    pub fn push_front(&mut self, reason: ExitReason, handler: Arc<dyn ExitHandler<H>>) {
        self.chains.entry(reason).or_default().push_front(handler);
    }

    /// Registers `handler` behind every handler already present.
    pub fn push_back(&mut self, reason: ExitReason, handler: Arc<dyn ExitHandler<H>>) {
        self.chains.entry(reason).or_default().push_back(handler);
    }

    /// Snapshot of the chain for `reason`, in walk order.
    pub fn chain(&self, reason: ExitReason) -> Vec<Arc<dyn ExitHandler<H>>> {
        self.chains
            .get(&reason)
            .map(|chain| chain.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, reason: ExitReason) -> usize {
        self.chains.get(&reason).map_or(0, |chain| chain.len())
    }
}
