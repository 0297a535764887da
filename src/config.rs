use crate::mem::GuestPhysAddr;

/// Static limits and layout of a [`Hyperkernel`](crate::Hyperkernel).
#[derive(Debug, Clone)]
pub struct HyperkernelConfig {
    /// Upper bound of live domains, the root domain included.
    pub max_domains: usize,
    /// Upper bound of live vCPUs, host vCPUs included.
    pub max_vcpus: usize,
    /// First id handed out to a guest vCPU. Ids below it belong to host vCPUs,
    /// which take the id of the core they run on.
    pub guest_vcpuid_base: u64,
    /// How many polling rounds a shootdown initiator waits for the other
    /// cores before giving up. `None` waits forever.
    pub shootdown_spin_limit: Option<usize>,
    /// Guest-physical base of the GDT, IDT and TSS pages of every guest domain.
    pub descriptor_gpa: GuestPhysAddr,
    /// Capacity of the per-domain UART capture buffer.
    pub uart_buffer_size: usize,
}

impl Default for HyperkernelConfig {
    fn default() -> Self {
        Self {
            max_domains: 64,
            max_vcpus: 256,
            guest_vcpuid_base: 0x10000,
            shootdown_spin_limit: None,
            descriptor_gpa: GuestPhysAddr::from(0x1000),
            uart_buffer_size: 0x4000,
        }
    }
}
