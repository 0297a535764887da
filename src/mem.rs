use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};
use memory_addr::{def_usize_addr, def_usize_addr_formatter};

use crate::Hal;

pub use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

def_usize_addr! {
    /// Host virtual address.
    pub type HostVirtAddr;
    /// Host physical address.
    pub type HostPhysAddr;
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    HostVirtAddr = "HVA:{}";
    HostPhysAddr = "HPA:{}";
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}

/// Offset of `addr` inside its 4K page.
pub(crate) const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// A 4K-sized physical memory page, it will deallocate the page
/// automatically on drop.
///
/// Frames back the second-level translation tables and the descriptor
/// tables of every domain.
#[derive(Debug)]
pub struct PhysFrame<H: Hal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: Hal> PhysFrame<H> {
    /// Allocate a [`PhysFrame`].
    pub fn alloc() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    /// Allocate a [`PhysFrame`] and fill it with zeros.
    pub fn alloc_zero() -> AxResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Get the starting physical address of the frame.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    /// Get a mutable pointer to the frame.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_usize() as *mut u8
    }

    /// Fill the frame with a byte.
    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }

    /// View the frame as an array of 64-bit words.
    pub fn as_u64_slice_mut(&mut self) -> &mut [u64] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.as_mut_ptr() as *mut u64,
                PAGE_SIZE / core::mem::size_of::<u64>(),
            )
        }
    }
}

impl<H: Hal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        trace!("[HK] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}
