//! Minimal device shims: PCI config space, local APIC and IOAPIC.

pub mod ioapic;
pub mod lapic;
pub mod pci;

pub use ioapic::IoApic;
pub use lapic::{Lapic, LapicState};
pub use pci::{Bdf, PciDevice};
