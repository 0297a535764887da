//! Second-level address translation (Intel EPT) for guest domains.

use alloc::vec::Vec;
use core::fmt;

use axerrno::{AxResult, ax_err};
use bitflags::bitflags;
use page_table_entry::MappingFlags;
use page_table_multiarch::PageSize;

use crate::Hal;
use crate::mem::{GuestPhysAddr, HostPhysAddr, PhysFrame};

const ENTRY_COUNT: usize = 512;

bitflags! {
    /// EPT entry bits. (SDM Vol. 3C, Section 29.3.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ =            1 << 0;
        const WRITE =           1 << 1;
        const EXECUTE =         1 << 2;
        const MEM_TYPE_WB =     6 << 3;
        const IGNORE_PAT =      1 << 6;
        const HUGE_PAGE =       1 << 7;
        const ACCESSED =        1 << 8;
        const DIRTY =           1 << 9;
        const EXECUTE_FOR_USER = 1 << 10;
    }
}

impl From<MappingFlags> for EptFlags {
    fn from(f: MappingFlags) -> Self {
        let mut ret = Self::empty();
        if f.contains(MappingFlags::READ) {
            ret |= Self::READ;
        }
        if f.contains(MappingFlags::WRITE) {
            ret |= Self::WRITE;
        }
        if f.contains(MappingFlags::EXECUTE) {
            ret |= Self::EXECUTE;
        }
        if !f.contains(MappingFlags::DEVICE) {
            ret |= Self::MEM_TYPE_WB;
        }
        ret
    }
}

impl From<EptFlags> for MappingFlags {
    fn from(f: EptFlags) -> Self {
        let mut ret = MappingFlags::empty();
        if f.contains(EptFlags::READ) {
            ret |= Self::READ;
        }
        if f.contains(EptFlags::WRITE) {
            ret |= Self::WRITE;
        }
        if f.contains(EptFlags::EXECUTE) {
            ret |= Self::EXECUTE;
        }
        if !f.contains(EptFlags::MEM_TYPE_WB) {
            ret |= Self::DEVICE;
        }
        ret
    }
}

/// A single EPT paging-structure entry.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000; // bits 12..52
    const PRESENT_MASK: u64 = 0b111;

    fn new_page(paddr: HostPhysAddr, flags: MappingFlags, is_huge: bool) -> Self {
        let mut flags = EptFlags::from(flags);
        if is_huge {
            flags |= EptFlags::HUGE_PAGE;
        }
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }

    fn new_table(paddr: HostPhysAddr) -> Self {
        let flags = EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE;
        Self(flags.bits() | (paddr.as_usize() as u64 & Self::PHYS_ADDR_MASK))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn paddr(&self) -> HostPhysAddr {
        HostPhysAddr::from((self.0 & Self::PHYS_ADDR_MASK) as usize)
    }

    pub fn flags(&self) -> MappingFlags {
        EptFlags::from_bits_truncate(self.0).into()
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.0 & Self::PRESENT_MASK != 0
    }

    pub fn is_huge(&self) -> bool {
        EptFlags::from_bits_truncate(self.0).contains(EptFlags::HUGE_PAGE)
    }

    fn clear(&mut self) {
        self.0 = 0
    }
}

impl fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EptEntry")
            .field("raw", &self.0)
            .field("paddr", &self.paddr())
            .field("flags", &EptFlags::from_bits_truncate(self.0))
            .finish()
    }
}

const fn table_index(gpa: usize, level: usize) -> usize {
    (gpa >> (12 + 9 * (level - 1))) & (ENTRY_COUNT - 1)
}

const fn level_of(size: PageSize) -> usize {
    match size {
        PageSize::Size4K => 1,
        PageSize::Size2M => 2,
        PageSize::Size1G => 3,
    }
}

const fn size_of_level(level: usize) -> PageSize {
    match level {
        3 => PageSize::Size1G,
        2 => PageSize::Size2M,
        _ => PageSize::Size4K,
    }
}

/// A 4-level extended page table.
///
/// Every GPA resolves to at most one leaf: mapping over an existing leaf, or
/// a huge leaf over a populated sub-table, is rejected. Intermediate tables
/// are owned here and released when the table is dropped.
pub struct ExtendedPageTable<H: Hal> {
    root: PhysFrame<H>,
    intrm_tables: Vec<PhysFrame<H>>,
    mapped: usize,
}

impl<H: Hal> ExtendedPageTable<H> {
    pub fn try_new() -> AxResult<Self> {
        Ok(Self {
            root: PhysFrame::alloc_zero()?,
            intrm_tables: Vec::new(),
            mapped: 0,
        })
    }

    pub fn root_paddr(&self) -> HostPhysAddr {
        self.root.start_paddr()
    }

    /// EPT pointer: write-back paging structures, 4-level walk.
    pub fn eptp(&self) -> u64 {
        const MEM_TYPE_WB: u64 = 6;
        const WALK_LENGTH_4: u64 = 3 << 3;
        self.root_paddr().as_usize() as u64 | WALK_LENGTH_4 | MEM_TYPE_WB
    }

    /// Number of leaf mappings currently installed.
    pub fn mapping_count(&self) -> usize {
        self.mapped
    }

    /// Maps `gpa` to `hpa` with a single leaf of `size`.
    pub fn map(
        &mut self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: PageSize,
        flags: MappingFlags,
    ) -> AxResult {
        if !size.is_aligned(gpa.as_usize()) || !size.is_aligned(hpa.as_usize()) {
            return ax_err!(InvalidInput, "EPT mapping is not aligned to its page size");
        }
        if !flags.contains(MappingFlags::READ) {
            // Write or execute without read is an EPT misconfiguration.
            return ax_err!(InvalidInput, "EPT mapping must be readable");
        }
        let entry = self.get_entry_mut_or_create(gpa.as_usize(), size)?;
        if !entry.is_unused() {
            return ax_err!(AlreadyExists, "GPA is already mapped");
        }
        *entry = EptEntry::new_page(hpa, flags, size != PageSize::Size4K);
        self.mapped += 1;
        trace!("[HK] EPT map {:?} -> {:?} {:?} {:?}", gpa, hpa, size, flags);
        Ok(())
    }

    /// Removes the leaf covering `gpa`, returning what it pointed to.
    pub fn unmap(&mut self, gpa: GuestPhysAddr) -> AxResult<(HostPhysAddr, PageSize)> {
        let (entry, size) = self.get_entry_mut(gpa.as_usize())?;
        let paddr = entry.paddr();
        entry.clear();
        self.mapped -= 1;
        trace!("[HK] EPT unmap {:?} ({:?})", gpa, size);
        Ok((paddr, size))
    }

    /// Translates `gpa`, including its offset inside the leaf.
    pub fn translate(&self, gpa: GuestPhysAddr) -> AxResult<(HostPhysAddr, MappingFlags, PageSize)> {
        let (entry, size) = self.get_entry_mut(gpa.as_usize())?;
        let off = size.align_offset(gpa.as_usize());
        Ok((entry.paddr() + off, entry.flags(), size))
    }
}

// private implements
impl<H: Hal> ExtendedPageTable<H> {
    fn table_of<'a>(paddr: HostPhysAddr) -> &'a mut [EptEntry] {
        let ptr = H::phys_to_virt(paddr).as_usize() as *mut EptEntry;
        unsafe { core::slice::from_raw_parts_mut(ptr, ENTRY_COUNT) }
    }

    fn get_entry_mut<'a>(&self, gpa: usize) -> AxResult<(&'a mut EptEntry, PageSize)> {
        let mut table = Self::table_of(self.root_paddr());
        for level in (1..=4).rev() {
            let entry = &mut table[table_index(gpa, level)];
            if !entry.is_present() {
                return ax_err!(NotFound, "GPA is not mapped");
            }
            if level == 1 || (level <= 3 && entry.is_huge()) {
                return Ok((entry, size_of_level(level)));
            }
            table = Self::table_of(entry.paddr());
        }
        unreachable!()
    }

    fn get_entry_mut_or_create<'a>(
        &mut self,
        gpa: usize,
        size: PageSize,
    ) -> AxResult<&'a mut EptEntry> {
        let target = level_of(size);
        let mut table = Self::table_of(self.root_paddr());
        for level in (target + 1..=4).rev() {
            let entry = &mut table[table_index(gpa, level)];
            if entry.is_unused() {
                let frame = PhysFrame::<H>::alloc_zero()?;
                *entry = EptEntry::new_table(frame.start_paddr());
                self.intrm_tables.push(frame);
            } else if entry.is_huge() {
                return ax_err!(AlreadyExists, "GPA is covered by a huge page");
            }
            table = Self::table_of(entry.paddr());
        }
        Ok(&mut table[table_index(gpa, target)])
    }
}
