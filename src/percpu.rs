use crate::VCpuId;

/// Per-core state of the hyperkernel.
///
/// Each physical core runs exactly one vCPU at a time. It starts with its
/// host vCPU and moves down the resume chain as children are launched.
#[derive(Debug, Clone)]
pub struct CoreState {
    /// Id of the physical core.
    pub cpu_id: usize,
    /// Root of the resume chain on this core.
    pub host_vcpu: VCpuId,
    /// vCPU entered on the next resume.
    pub current: VCpuId,
}

impl CoreState {
    pub fn new(cpu_id: usize, host_vcpu: VCpuId) -> Self {
        Self {
            cpu_id,
            host_vcpu,
            current: host_vcpu,
        }
    }

    /// Whether the core is back on its host vCPU.
    pub fn in_host(&self) -> bool {
        self.current == self.host_vcpu
    }
}
