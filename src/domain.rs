use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use numeric_enum_macro::numeric_enum;
use page_table_entry::MappingFlags;
use page_table_multiarch::PageSize;

use crate::config::HyperkernelConfig;
use crate::device::{IoApic, PciDevice};
use crate::ept::ExtendedPageTable;
use crate::mem::{GuestPhysAddr, HostPhysAddr, PAGE_SIZE, PhysFrame};
use crate::{DomainId, Hal};

/// What a domain is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// The privileged host, identity-mapped and owning all hardware.
    Root,
    /// An isolated sub-domain behind its own EPT.
    Guest,
    /// A guest granted direct access to physical devices.
    Ndvm,
}

numeric_enum! {
    #[repr(u64)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum E820Type {
        Ram = 1,
        Reserved = 2,
        Acpi = 3,
        Nvs = 4,
        Unusable = 5,
    }
}

/// One entry of a domain's physical memory map, as laid out in guest memory.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct E820Entry {
    pub base: u64,
    pub size: u64,
    pub ty: u64,
}

impl E820Entry {
    pub fn new(base: u64, size: u64, ty: E820Type) -> Self {
        Self {
            base,
            size,
            ty: ty as u64,
        }
    }

    pub fn kind(&self) -> Option<E820Type> {
        E820Type::try_from(self.ty).ok()
    }
}

/// Flat 64-bit GDT, empty IDT and TSS backing a guest's first entry.
pub struct DescriptorTables<H: Hal> {
    gdt: PhysFrame<H>,
    idt: PhysFrame<H>,
    tss: PhysFrame<H>,
}

impl<H: Hal> DescriptorTables<H> {
    pub const GDT_OFFSET: usize = 0;
    pub const IDT_OFFSET: usize = PAGE_SIZE;
    pub const TSS_OFFSET: usize = 2 * PAGE_SIZE;

    pub const CODE_SELECTOR: u16 = 0x08;
    pub const DATA_SELECTOR: u16 = 0x10;
    pub const TSS_SELECTOR: u16 = 0x18;
    /// Null, code, data and a two-slot TSS descriptor.
    pub const GDT_LIMIT: u16 = 5 * 8 - 1;
    pub const IDT_LIMIT: u16 = (PAGE_SIZE - 1) as u16;

    const CODE64: u64 = 0x00af_9b00_0000_ffff;
    const DATA: u64 = 0x00cf_9300_0000_ffff;
    const TSS_LIMIT: u64 = 0x67;
    const TSS_AVAILABLE: u64 = 0x9;
    const IOMAP_BASE_OFFSET: usize = 102;

    fn new(base: GuestPhysAddr) -> AxResult<Self> {
        let mut gdt = PhysFrame::alloc_zero()?;
        let idt = PhysFrame::alloc_zero()?;
        let tss = PhysFrame::alloc_zero()?;

        let tss_base = (base.as_usize() + Self::TSS_OFFSET) as u64;
        let (tss_low, tss_high) = Self::tss_descriptor(tss_base);
        let table = gdt.as_u64_slice_mut();
        table[1] = Self::CODE64;
        table[2] = Self::DATA;
        table[3] = tss_low;
        table[4] = tss_high;

        // No I/O permission bitmap.
        unsafe {
            tss.as_mut_ptr()
                .add(Self::IOMAP_BASE_OFFSET)
                .cast::<u16>()
                .write_unaligned(Self::TSS_LIMIT as u16 + 1);
        }
        Ok(Self { gdt, idt, tss })
    }

    fn tss_descriptor(base: u64) -> (u64, u64) {
        let mut low = 0u64;
        low.set_bits(0..16, Self::TSS_LIMIT);
        low.set_bits(16..40, base.get_bits(0..24));
        low.set_bits(40..44, Self::TSS_AVAILABLE);
        low.set_bit(47, true);
        low.set_bits(56..64, base.get_bits(24..32));
        (low, base.get_bits(32..64))
    }

    fn frames(&self) -> [(usize, HostPhysAddr); 3] {
        [
            (Self::GDT_OFFSET, self.gdt.start_paddr()),
            (Self::IDT_OFFSET, self.idt.start_paddr()),
            (Self::TSS_OFFSET, self.tss.start_paddr()),
        ]
    }
}

/// An isolated guest address space and the resources attached to it.
pub struct Domain<H: Hal> {
    id: DomainId,
    kind: DomainKind,
    /// `None` for the root domain, which sees host memory 1:1.
    ept: Option<ExtendedPageTable<H>>,
    e820: Vec<E820Entry>,
    descriptors: Option<DescriptorTables<H>>,
    descriptor_gpa: GuestPhysAddr,
    entry: Option<GuestPhysAddr>,
    uart: Option<u16>,
    pt_uart: Option<u16>,
    uart_buffer: VecDeque<u8>,
    uart_capacity: usize,
    irq_routes: BTreeMap<u8, u8>,
    pci_devices: Vec<Arc<PciDevice>>,
    ioapic: Arc<IoApic>,
    /// Never reused, so IPIs and IOAPIC routes keep naming one vCPU.
    next_apic_id: u32,
}

impl<H: Hal> Domain<H> {
    pub(crate) fn new_root(config: &HyperkernelConfig) -> Self {
        Self::with_parts(0, DomainKind::Root, None, None, config)
    }

    /// Builds a guest domain with its descriptor pages already mapped.
    pub(crate) fn new_guest(id: DomainId, config: &HyperkernelConfig) -> AxResult<Self> {
        let mut ept = ExtendedPageTable::try_new()?;
        let descriptors = DescriptorTables::new(config.descriptor_gpa)?;
        for (offset, hpa) in descriptors.frames() {
            ept.map(
                config.descriptor_gpa + offset,
                hpa,
                PageSize::Size4K,
                MappingFlags::READ | MappingFlags::WRITE,
            )?;
        }
        Ok(Self::with_parts(
            id,
            DomainKind::Guest,
            Some(ept),
            Some(descriptors),
            config,
        ))
    }

    fn with_parts(
        id: DomainId,
        kind: DomainKind,
        ept: Option<ExtendedPageTable<H>>,
        descriptors: Option<DescriptorTables<H>>,
        config: &HyperkernelConfig,
    ) -> Self {
        Self {
            id,
            kind,
            ept,
            e820: Vec::new(),
            descriptors,
            descriptor_gpa: config.descriptor_gpa,
            entry: None,
            uart: None,
            pt_uart: None,
            uart_buffer: VecDeque::new(),
            uart_capacity: config.uart_buffer_size,
            irq_routes: BTreeMap::new(),
            pci_devices: Vec::new(),
            ioapic: Arc::new(IoApic::new()),
            next_apic_id: 0,
        }
    }

    pub const fn id(&self) -> DomainId {
        self.id
    }

    pub const fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        self.kind == DomainKind::Root
    }

    /// Whether port accesses of this domain may reach physical hardware.
    pub fn owns_hardware(&self) -> bool {
        self.kind != DomainKind::Guest
    }

    pub(crate) fn set_ndvm(&mut self) -> AxResult {
        match self.kind {
            DomainKind::Root => ax_err!(InvalidInput, "the root domain cannot become an NDVM"),
            _ => {
                self.kind = DomainKind::Ndvm;
                Ok(())
            }
        }
    }

    pub(crate) fn allocate_apic_id(&mut self) -> u32 {
        let id = self.next_apic_id;
        self.next_apic_id += 1;
        id
    }

    /// EPT pointer to load for vCPUs of this domain.
    pub fn eptp(&self) -> Option<u64> {
        self.ept.as_ref().map(|ept| ept.eptp())
    }

    pub fn map(
        &mut self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: PageSize,
        flags: MappingFlags,
    ) -> AxResult {
        match self.ept.as_mut() {
            Some(ept) => ept.map(gpa, hpa, size, flags),
            None => ax_err!(Unsupported, "the root domain is identity mapped"),
        }
    }

    pub fn unmap(&mut self, gpa: GuestPhysAddr) -> AxResult<(HostPhysAddr, PageSize)> {
        match self.ept.as_mut() {
            Some(ept) => ept.unmap(gpa),
            None => ax_err!(Unsupported, "the root domain is identity mapped"),
        }
    }

    /// Resolves `gpa` to host memory and the rights the domain holds on it.
    pub fn translate(&self, gpa: GuestPhysAddr) -> AxResult<(HostPhysAddr, MappingFlags)> {
        match self.ept.as_ref() {
            Some(ept) => ept.translate(gpa).map(|(hpa, flags, _)| (hpa, flags)),
            None => Ok((
                HostPhysAddr::from(gpa.as_usize()),
                MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE,
            )),
        }
    }

    /// Number of leaf mappings in the EPT, zero for the root domain.
    pub fn mapping_count(&self) -> usize {
        self.ept.as_ref().map_or(0, |ept| ept.mapping_count())
    }

    /// Guest-physical address of the descriptor pages, if the domain has any.
    pub fn descriptor_gpa(&self) -> Option<GuestPhysAddr> {
        self.descriptors.as_ref().map(|_| self.descriptor_gpa)
    }

    pub(crate) fn add_e820_entry(&mut self, entry: E820Entry) -> AxResult {
        if entry.kind().is_none() || entry.size == 0 {
            return ax_err!(InvalidInput, "malformed e820 entry");
        }
        debug!("[HK] domain {}: e820 {:x?}", self.id, entry);
        self.e820.push(entry);
        Ok(())
    }

    pub fn e820(&self) -> &[E820Entry] {
        &self.e820
    }

    pub(crate) fn set_entry(&mut self, gpa: GuestPhysAddr) {
        self.entry = Some(gpa);
    }

    pub fn entry(&self) -> Option<GuestPhysAddr> {
        self.entry
    }

    pub(crate) fn set_uart(&mut self, port: u16) {
        self.uart = Some(port);
    }

    /// Port whose writes are captured into the UART buffer.
    pub fn uart(&self) -> Option<u16> {
        self.uart
    }

    pub(crate) fn set_pt_uart(&mut self, port: u16) {
        self.pt_uart = Some(port);
    }

    /// Port passed straight through to the physical UART.
    pub fn pt_uart(&self) -> Option<u16> {
        self.pt_uart
    }

    /// Whether `port` is one of the eight registers of the pass-through UART.
    pub fn is_pt_uart_port(&self, port: u16) -> bool {
        self.pt_uart
            .is_some_and(|base| (base..base.saturating_add(8)).contains(&port))
    }

    /// Appends to the capture buffer, dropping the oldest byte once full.
    pub(crate) fn uart_write(&mut self, byte: u8) {
        if self.uart_capacity == 0 {
            return;
        }
        if self.uart_buffer.len() == self.uart_capacity {
            self.uart_buffer.pop_front();
        }
        self.uart_buffer.push_back(byte);
    }

    /// Copies the captured output into `buf`, returning the number of bytes.
    pub fn dump_uart(&self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.uart_buffer.len());
        for (dst, src) in buf.iter_mut().zip(self.uart_buffer.iter()) {
            *dst = *src;
        }
        n
    }

    pub fn uart_capacity(&self) -> usize {
        self.uart_capacity
    }

    pub(crate) fn add_irq_route(&mut self, host_irq: u8, vector: u8) {
        debug!(
            "[HK] domain {}: host irq {:#x} -> vector {:#x}",
            self.id, host_irq, vector
        );
        self.irq_routes.insert(host_irq, vector);
    }

    pub fn irq_route(&self, host_irq: u8) -> Option<u8> {
        self.irq_routes.get(&host_irq).copied()
    }

    pub(crate) fn add_pci_device(&mut self, device: Arc<PciDevice>) -> AxResult {
        if self.pci_devices.iter().any(|d| d.bdf() == device.bdf()) {
            return ax_err!(AlreadyExists, "pci function already emulated");
        }
        self.pci_devices.push(device);
        Ok(())
    }

    pub fn pci_devices(&self) -> &[Arc<PciDevice>] {
        &self.pci_devices
    }

    pub fn ioapic(&self) -> &Arc<IoApic> {
        &self.ioapic
    }
}
