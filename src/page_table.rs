//! Read-only walks of guest page tables.
use core::marker::PhantomData;

use bitflags::bitflags;
use page_table_entry::{GenericPTE, MappingFlags, x86_64::X64PTE};
use page_table_multiarch::{PageSize, PagingError, PagingResult};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use crate::Hal;
use crate::context::VcpuContext;
use crate::mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};

const ENTRY_COUNT: usize = 512;
const PAE_ROOT_ENTRY_COUNT: usize = 4;
const PHYS_ADDR_MASK: usize = 0x000f_ffff_ffff_f000;
/// In PAE mode CR3 holds a 32-byte aligned PDPT address.
const PAE_CR3_MASK: usize = 0xffff_ffe0;

/// Index into the table at `level` (1 = PT, 4 = PML4) for `vaddr`.
const fn table_index(vaddr: usize, level: usize) -> usize {
    (vaddr >> (12 + 9 * (level - 1))) & (ENTRY_COUNT - 1)
}

bitflags! {
    /// Kind of access the walk is performed for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WalkAccess: u8 {
        const USER = 1 << 0;
        const WRITE = 1 << 1;
        const FETCH = 1 << 2;
    }
}

/// Paging mode of a vCPU, as needed to walk its tables.
#[derive(Debug, Clone)]
pub struct GuestPageWalkInfo {
    pub cr3: usize,
    /// 0 with paging off, 2 for 32-bit, 3 for PAE, 4 for long mode.
    pub level: usize,
    /// Index bits per level.
    pub width: u32,
    pub access: WalkAccess,
    pub pse: bool,
    pub wp: bool,
    pub nxe: bool,
    pub smap: bool,
    pub smep: bool,
}

impl GuestPageWalkInfo {
    /// Walk parameters for a supervisor data read in the given context.
    pub fn from_context(ctx: &VcpuContext) -> Self {
        let level = ctx.paging_levels();
        let cr4 = ctx.cr4_flags();
        Self {
            cr3: ctx.cr3 as usize,
            level,
            width: if level == 2 { 10 } else { 9 },
            access: WalkAccess::empty(),
            pse: level != 2 || cr4.contains(Cr4Flags::PAGE_SIZE_EXTENSION),
            wp: ctx.cr0_flags().contains(Cr0Flags::WRITE_PROTECT),
            nxe: ctx.efer_flags().contains(EferFlags::NO_EXECUTE_ENABLE),
            smap: cr4.contains(Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION),
            smep: cr4.contains(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION),
        }
    }
}

/// Maps a guest-physical table address to the host frame holding it.
pub type GpaTranslator<'a> = &'a dyn Fn(GuestPhysAddr) -> Option<HostPhysAddr>;

/// A read-only view of a guest's 64-bit page tables.
///
/// Every table the walk touches is first translated from guest-physical to
/// host-physical memory through the owning domain, so a guest can never make
/// the walk read memory outside of its own address space.
pub struct GuestPageTable64<'a, PTE: GenericPTE, H: Hal> {
    root: GuestPhysAddr,
    levels: usize,
    translate: GpaTranslator<'a>,
    _phantom: PhantomData<(PTE, H)>,
}

/// Guest page tables in x86_64 format.
pub type GuestPageTable<'a, H> = GuestPageTable64<'a, X64PTE, H>;

impl<'a, PTE: GenericPTE, H: Hal> GuestPageTable64<'a, PTE, H> {
    pub fn construct(info: &GuestPageWalkInfo, translate: GpaTranslator<'a>) -> Self {
        Self {
            root: GuestPhysAddr::from(match info.level {
                3 => info.cr3 & PAE_CR3_MASK,
                _ => info.cr3 & PHYS_ADDR_MASK,
            }),
            levels: info.level,
            translate,
            _phantom: PhantomData,
        }
    }

    /// Guest-physical address of the top-level table.
    pub fn root_paddr(&self) -> GuestPhysAddr {
        self.root
    }

    /// Translates `vaddr`, returning the guest-physical address it maps
    /// to together with the leaf's flags and page size.
    pub fn query(
        &self,
        vaddr: GuestVirtAddr,
    ) -> PagingResult<(GuestPhysAddr, MappingFlags, PageSize)> {
        let (entry, size) = self.leaf(vaddr)?;
        if !entry.is_present() {
            debug!("[HK] guest walk {:?}: leaf not present", vaddr);
            return Err(PagingError::NotMapped);
        }
        let gpa = entry.paddr().as_usize() + size.align_offset(vaddr.as_usize());
        Ok((GuestPhysAddr::from(gpa), entry.flags(), size))
    }

    fn table(&self, gpa: GuestPhysAddr, entries: usize) -> PagingResult<&'a [PTE]> {
        let Some(hpa) = (self.translate)(gpa) else {
            warn!("[HK] guest walk: table {:?} is outside the domain", gpa);
            return Err(PagingError::NotMapped);
        };
        let ptr = H::phys_to_virt(hpa).as_usize() as *const PTE;
        Ok(unsafe { core::slice::from_raw_parts(ptr, entries) })
    }

    fn leaf(&self, gva: GuestVirtAddr) -> PagingResult<(&'a PTE, PageSize)> {
        let vaddr = gva.as_usize();
        let (mut level, root_entries) = match self.levels {
            // The PDPT has four entries, the level-3 index of a 32-bit address.
            3 => (3, PAE_ROOT_ENTRY_COUNT),
            4 => (4, ENTRY_COUNT),
            _ => return Err(PagingError::NotMapped),
        };
        let mut table = self.table(self.root, root_entries)?;
        loop {
            let entry = table
                .get(table_index(vaddr, level))
                .ok_or(PagingError::NotMapped)?;
            let huge = entry.is_present() && entry.is_huge();
            match level {
                1 => return Ok((entry, PageSize::Size4K)),
                2 if huge => return Ok((entry, PageSize::Size2M)),
                3 if huge && self.levels == 4 => return Ok((entry, PageSize::Size1G)),
                _ if !entry.is_present() => return Err(PagingError::NotMapped),
                _ => {}
            }
            table = self.table(GuestPhysAddr::from(entry.paddr().as_usize()), ENTRY_COUNT)?;
            level -= 1;
        }
    }
}
