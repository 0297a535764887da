use raw_cpuid::CpuIdResult;

use crate::exit::AccessWidth;
use crate::mem::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the underlying host kernel must implement.
///
/// Every call is a static function: the hyperkernel never owns the HAL, it
/// is selected by the type parameter `H` of [`Hyperkernel`](crate::Hyperkernel).
pub trait Hal: Sized + 'static {
    /// Allocates a zeroed 4K frame and returns its host physical address.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocates a frame returned by [`Hal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Converts a host virtual address to a host physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Number of physical cores taking part in cross-core protocols.
    fn cpu_count() -> usize;

    /// Id of the physical core executing the caller.
    fn current_cpu() -> usize;

    /// Sends `vector` to every core except the current one.
    fn send_ipi_all_but_self(vector: u8);

    /// Invalidates cached translations derived from the EPT pointed to by
    /// `eptp` on every core. Called while the other cores are parked.
    fn flush_ept(eptp: u64);

    /// Dispatches an interrupt that arrived while a guest was running to the host.
    fn handle_host_irq(vector: u8) {
        trace!("[HK] host irq {:#x} left to the host kernel", vector);
    }

    /// Reads a physical I/O port.
    fn port_read(port: u16, width: AccessWidth) -> u32 {
        cfg_if::cfg_if! {
            if #[cfg(feature = "vmx")] {
                unsafe { crate::portio::port_read(port, width) }
            } else {
                let _ = (port, width);
                u32::MAX
            }
        }
    }

    /// Writes a physical I/O port.
    fn port_write(port: u16, width: AccessWidth, value: u32) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "vmx")] {
                unsafe { crate::portio::port_write(port, width, value) }
            } else {
                let _ = (port, width, value);
            }
        }
    }

    /// Executes `CPUID` on the host.
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        raw_cpuid::cpuid!(leaf, subleaf)
    }
}
