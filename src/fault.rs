//! The one-way path taken by a vCPU that cannot continue.

use crate::dispatch::Disposition;
use crate::error::HkError;
use crate::exit::ExitReason;
use crate::{Hal, Hyperkernel, VCpuId};

/// Logs the full architectural state of `vcpu_id`.
pub fn dump<H: Hal>(hk: &Hyperkernel<H>, vcpu_id: VCpuId) {
    let Some(vcpu) = hk.vcpu(vcpu_id) else {
        error!("[HK] fault dump: vcpu {:#x} does not exist", vcpu_id);
        return;
    };
    error!(
        "[HK] vcpu {:#x} (domain {}, state {:?}, parent {:x?})",
        vcpu_id,
        vcpu.domain_id(),
        vcpu.state(),
        vcpu.parent()
    );
    error!("{:#x?}", vcpu.ctx());
    if let Some(domain) = hk.domain(vcpu.domain_id()) {
        error!(
            "[HK] domain {}: {:?}, {} EPT mappings, eptp {:x?}",
            domain.id(),
            domain.kind(),
            domain.mapping_count(),
            domain.eptp()
        );
    }
}

/// Kills `vcpu_id` and hands its core back to the parent with a fault code.
///
/// A host vCPU has nobody to unwind to, so its fault stops the core.
pub fn handle<H: Hal>(
    hk: &mut Hyperkernel<H>,
    vcpu_id: VCpuId,
    reason: ExitReason,
) -> Result<Disposition, HkError> {
    error!("[HK] vcpu {:#x}: fatal exit {:?}", vcpu_id, reason);
    dump(hk, vcpu_id);

    if hk.vcpu(vcpu_id).is_none_or(|vcpu| vcpu.is_host()) {
        return Err(HkError::HostFault {
            vcpu: vcpu_id,
            reason,
        });
    }
    unwind(hk, vcpu_id)
}

/// Returns a killed, or about to be killed, vCPU's core to its parent.
pub(crate) fn unwind<H: Hal>(
    hk: &mut Hyperkernel<H>,
    vcpu_id: VCpuId,
) -> Result<Disposition, HkError> {
    match hk.return_fault(vcpu_id) {
        Ok(parent) => Ok(Disposition::Transfer(parent)),
        Err(err) => {
            error!("[HK] vcpu {:#x}: cannot unwind: {:?}", vcpu_id, err);
            Err(HkError::Orphaned(vcpu_id))
        }
    }
}
