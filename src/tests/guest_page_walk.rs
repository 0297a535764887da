//! Tests for guest page table walks.

use page_table_entry::MappingFlags;
use page_table_multiarch::{PageSize, PagingError};

use super::mock::{self, MockHal};
use crate::AxError;
use crate::context::VcpuContext;
use crate::mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, PhysFrame};
use crate::page_table::{GuestPageTable, GuestPageWalkInfo};

const PRESENT_RW: u64 = 0b11;
const HUGE: u64 = 1 << 7;
const NO_EXECUTE: u64 = 1 << 63;

const GVA: usize = 0x0000_7f12_3456_7abc;

fn index(gva: usize, level: usize) -> usize {
    (gva >> (12 + 9 * (level - 1))) & 511
}

fn frame() -> PhysFrame<MockHal> {
    PhysFrame::alloc_zero().unwrap()
}

fn addr(frame: &PhysFrame<MockHal>) -> u64 {
    frame.start_paddr().as_usize() as u64
}

fn identity(gpa: GuestPhysAddr) -> Option<HostPhysAddr> {
    Some(HostPhysAddr::from(gpa.as_usize()))
}

/// Four levels of tables mapping `GVA` to a 4K data page.
struct Tables {
    p4: PhysFrame<MockHal>,
    p3: PhysFrame<MockHal>,
    p2: PhysFrame<MockHal>,
    p1: PhysFrame<MockHal>,
    data: PhysFrame<MockHal>,
}

impl Tables {
    fn new() -> Self {
        let mut t = Self {
            p4: frame(),
            p3: frame(),
            p2: frame(),
            p1: frame(),
            data: frame(),
        };
        let (p3, p2, p1, data) = (addr(&t.p3), addr(&t.p2), addr(&t.p1), addr(&t.data));
        t.p4.as_u64_slice_mut()[index(GVA, 4)] = p3 | PRESENT_RW;
        t.p3.as_u64_slice_mut()[index(GVA, 3)] = p2 | PRESENT_RW;
        t.p2.as_u64_slice_mut()[index(GVA, 2)] = p1 | PRESENT_RW;
        t.p1.as_u64_slice_mut()[index(GVA, 1)] = data | PRESENT_RW | NO_EXECUTE;
        t
    }

    fn info(&self) -> GuestPageWalkInfo {
        GuestPageWalkInfo::from_context(&VcpuContext::long_mode(addr(&self.p4)))
    }
}

#[test]
fn test_guest_page_walk_info_from_long_mode() {
    let info = GuestPageWalkInfo::from_context(&VcpuContext::long_mode(0x12345000));

    assert_eq!(info.cr3, 0x12345000);
    assert_eq!(info.level, 4);
    assert_eq!(info.width, 9);
    assert!(info.pse);
    assert!(info.wp);
    assert!(info.nxe);
    assert!(info.access.is_empty());
    assert!(!info.smap);
    assert!(!info.smep);

    let debug_str = alloc::format!("{:?}", info);
    assert!(debug_str.contains("GuestPageWalkInfo"));
    assert!(debug_str.contains("cr3"));
}

#[test]
fn test_guest_page_walk_info_paging_disabled() {
    let info = GuestPageWalkInfo::from_context(&VcpuContext::default());
    assert_eq!(info.level, 0);
}

#[test]
fn test_guest_page_walk_4k() {
    let tables = Tables::new();
    let info = tables.info();
    let pt = GuestPageTable::<MockHal>::construct(&info, &identity);
    assert_eq!(pt.root_paddr().as_usize() as u64, addr(&tables.p4));

    let (gpa, flags, size) = pt.query(GuestVirtAddr::from(GVA)).unwrap();
    assert_eq!(gpa.as_usize() as u64, addr(&tables.data) + 0xabc);
    assert!(flags.contains(MappingFlags::READ | MappingFlags::WRITE));
    assert!(!flags.contains(MappingFlags::EXECUTE));
    assert_eq!(size, PageSize::Size4K);
}

#[test]
fn test_guest_page_walk_2m() {
    let mut tables = Tables::new();
    let huge_base = 0x4000_0000u64;
    tables.p2.as_u64_slice_mut()[index(GVA, 2)] = huge_base | PRESENT_RW | HUGE;

    let info = tables.info();
    let pt = GuestPageTable::<MockHal>::construct(&info, &identity);
    let (gpa, _, size) = pt.query(GuestVirtAddr::from(GVA)).unwrap();
    assert_eq!(gpa.as_usize() as u64, huge_base + (GVA as u64 & 0x1f_ffff));
    assert_eq!(size, PageSize::Size2M);
}

#[test]
fn test_guest_page_walk_not_present() {
    let mut tables = Tables::new();
    tables.p1.as_u64_slice_mut()[index(GVA, 1)] = 0;

    let info = tables.info();
    let pt = GuestPageTable::<MockHal>::construct(&info, &identity);
    assert!(matches!(
        pt.query(GuestVirtAddr::from(GVA)),
        Err(PagingError::NotMapped)
    ));
    // A sibling page under a missing PDPT entry.
    assert!(pt.query(GuestVirtAddr::from(GVA ^ (1 << 30))).is_err());
}

#[test]
fn test_guest_page_walk_table_outside_domain() {
    let tables = Tables::new();
    let info = tables.info();
    let refuse = |_: GuestPhysAddr| None;
    let pt = GuestPageTable::<MockHal>::construct(&info, &refuse);
    assert!(pt.query(GuestVirtAddr::from(GVA)).is_err());
}

#[test]
fn test_guest_page_walk_32bit_unsupported() {
    let tables = Tables::new();
    let mut info = tables.info();
    info.level = 2;
    let pt = GuestPageTable::<MockHal>::construct(&info, &identity);
    assert!(pt.query(GuestVirtAddr::from(GVA)).is_err());
}

/// The guest tables live in guest-physical memory, reached through the EPT.
#[test]
fn test_translate_gva_through_domain() {
    const P4_GPA: usize = 0x10_0000;
    const DATA_GPA: usize = 0x20_0000;

    let mut hk = mock::hyperkernel();
    let domain = hk.create_domain().unwrap();
    let vcpu = hk.create_vcpu(domain).unwrap();

    let mut frames = [frame(), frame(), frame(), frame()];
    let data = [frame(), frame()];
    for (i, f) in frames.iter().enumerate() {
        hk.map_gpa(
            domain,
            GuestPhysAddr::from(P4_GPA + i * 0x1000),
            f.start_paddr(),
            PageSize::Size4K,
            MappingFlags::READ | MappingFlags::WRITE,
        )
        .unwrap();
    }
    for (i, f) in data.iter().enumerate() {
        hk.map_gpa(
            domain,
            GuestPhysAddr::from(DATA_GPA + i * 0x1000),
            f.start_paddr(),
            PageSize::Size4K,
            MappingFlags::READ | MappingFlags::WRITE,
        )
        .unwrap();
    }

    // Two consecutive virtual pages at GVA's page, backed by the two data frames.
    let page = GVA & !0xfff;
    for level in (2..=4).rev() {
        let next = (P4_GPA + (5 - level) * 0x1000) as u64;
        frames[4 - level].as_u64_slice_mut()[index(page, level)] = next | PRESENT_RW;
    }
    for i in 0..2 {
        frames[3].as_u64_slice_mut()[index(page + i * 0x1000, 1)] =
            (DATA_GPA + i * 0x1000) as u64 | PRESENT_RW;
    }
    *hk.vcpu_mut(vcpu).unwrap().ctx_mut() = VcpuContext::long_mode(P4_GPA as u64);

    let gpa = hk.translate_gva(vcpu, GuestVirtAddr::from(GVA)).unwrap();
    assert_eq!(gpa.as_usize(), DATA_GPA + 0xabc);

    // A buffer straddling both pages.
    let gva = GuestVirtAddr::from(page + 0xffc);
    hk.write_guest(vcpu, gva, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let mut buf = [0u8; 8];
    hk.read_guest(vcpu, gva, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    let head = unsafe { *data[0].as_mut_ptr().add(0xffc) };
    let tail = unsafe { *data[1].as_mut_ptr() };
    assert_eq!((head, tail), (1, 5));

    assert_eq!(
        hk.translate_gva(vcpu, GuestVirtAddr::from(GVA ^ (1 << 39))),
        Err(AxError::BadAddress)
    );
}

#[test]
fn test_guest_page_walk_pae() {
    const PAE_GVA: usize = 0x4080_1abc;
    const PDPT_GPA: u64 = 0x1000;
    const PD_GPA: u64 = 0x2000;
    const PT_GPA: u64 = 0x3000;
    const DATA_GPA: u64 = 0x4000;
    let mut frames = [frame(), frame(), frame()];
    let hpas: std::vec::Vec<u64> = frames.iter().map(addr).collect();
    let translate = |gpa: GuestPhysAddr| {
        let page = gpa.as_usize() as u64 & !0xfff;
        let i = (page / 0x1000).checked_sub(1)? as usize;
        let hpa = *hpas.get(i)?;
        Some(HostPhysAddr::from((hpa + (gpa.as_usize() as u64 & 0xfff)) as usize))
    };

    // A 32-byte aligned PDPT in the middle of a page.
    frames[0].as_u64_slice_mut()[4 + index(PAE_GVA, 3)] = PD_GPA | 1;
    frames[1].as_u64_slice_mut()[index(PAE_GVA, 2)] = PT_GPA | PRESENT_RW;
    frames[2].as_u64_slice_mut()[index(PAE_GVA, 1)] = DATA_GPA | PRESENT_RW;

    let mut info = GuestPageWalkInfo::from_context(&VcpuContext::long_mode(0));
    info.cr3 = PDPT_GPA as usize + 0x20;
    info.level = 3;
    let walk = GuestPageTable::<MockHal>::construct(&info, &translate);
    assert_eq!(walk.root_paddr().as_usize() as u64, PDPT_GPA + 0x20);

    let (gpa, _, size) = walk.query(GuestVirtAddr::from(PAE_GVA)).unwrap();
    assert_eq!(gpa.as_usize() as u64, DATA_GPA + 0xabc);
    assert_eq!(size, PageSize::Size4K);

    // Beyond the four PDPT entries.
    assert!(matches!(
        walk.query(GuestVirtAddr::from(PAE_GVA + (4 << 30))),
        Err(PagingError::NotMapped)
    ));
}
