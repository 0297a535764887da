//! Tests for the PCI configuration space proxy.

use super::mock::{self, MockHal, port_io};
use crate::device::pci::{CONFIG_ADDRESS_PORT, CONFIG_DATA_PORT};
use crate::device::{Bdf, PciDevice};
use crate::exit::AccessWidth::{Byte, Dword, Word};
use crate::{AxError, Hyperkernel, HyperkernelConfig, ROOT_DOMAIN};

const NIC: Bdf = Bdf::new(0, 3, 0);

fn nic() -> PciDevice {
    PciDevice::new(NIC, 0x8086, 0x100e, 0x02_0000)
        .with_bar(0, 0x2_0000)
        .with_interrupt_pin(1)
}

#[test]
fn test_bdf_address() {
    let bdf = Bdf::new(2, 31, 7);
    let address = bdf.address(0x3d);
    assert_eq!(address, 0x8002_ff3c);
    assert_eq!(Bdf::from_address(address), Some(bdf));
    assert_eq!(Bdf::from_address(address & !(1 << 31)), None);
}

#[test]
fn test_config_space_registers() {
    let dev = nic();
    assert_eq!(dev.read(0x00, Dword), 0x100e_8086);
    assert_eq!(dev.read(0x02, Word), 0x100e);
    assert_eq!(dev.read(0x0b, Byte), 0x02);
    assert_eq!(dev.read(0x3d, Byte), 1);

    // Read-only identity.
    dev.write(0x00, Dword, 0xffff_ffff);
    assert_eq!(dev.read(0x00, Dword), 0x100e_8086);

    // Only the writable command bits stick.
    dev.write(0x04, Word, 0xffff);
    assert_eq!(dev.read(0x04, Word), 0x0547);

    dev.write(0x3c, Byte, 0x0b);
    assert_eq!(dev.read(0x3c, Word), 0x010b);
}

#[test]
fn test_guest_sees_emulated_function() {
    let mut hk = mock::hyperkernel();
    let domain = hk.create_domain().unwrap();
    let vcpu = hk.create_vcpu(domain).unwrap();
    hk.add_pci_device(domain, nic()).unwrap();
    hk.run_vcpu(0, vcpu, mock::GUEST_ENTRY, 0).unwrap();

    port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, false, NIC.address(0) as u64);
    assert_eq!(port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, true, 0), NIC.address(0) as u64);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT, Dword, true, 0), 0x100e_8086);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT + 2, Byte, true, 0), 0x0e);

    // BAR sizing.
    port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, false, NIC.address(0x10) as u64);
    port_io(&mut hk, CONFIG_DATA_PORT, Dword, false, 0xffff_ffff);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT, Dword, true, 0), 0xfffe_0000);

    // A guest never reaches the physical latch.
    assert!(mock::with_state(|s| s.port_writes.is_empty()));

    // Functions the domain does not emulate are absent.
    port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, false, Bdf::new(0, 5, 0).address(0) as u64);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT, Dword, true, 0), 0xffff_ffff);
}

#[test]
fn test_host_passes_through_to_hardware() {
    let mut hk = mock::hyperkernel();
    let other = Bdf::new(0, 5, 0);
    mock::with_state(|s| {
        s.pci_config.insert(other.address(0), 0x1234_5678);
    });

    port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, false, other.address(0) as u64);
    assert_eq!(mock::with_state(|s| s.pci_latch), other.address(0));

    // Someone else moved the physical latch in between.
    mock::with_state(|s| s.pci_latch = 0);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT, Dword, true, 0), 0x1234_5678);
    assert_eq!(mock::with_state(|s| s.pci_latch), other.address(0));
}

#[test]
fn test_emulated_function_shadows_hardware() {
    // Host vCPUs pick up the root domain's functions when their core starts.
    mock::init_logger();
    let mut hk = Hyperkernel::<MockHal>::new(HyperkernelConfig::default());
    hk.add_pci_device(ROOT_DOMAIN, nic()).unwrap();
    hk.start_core(0).unwrap();
    mock::with_state(|s| {
        s.pci_config.insert(NIC.address(0), 0xdead_beef);
    });

    port_io(&mut hk, CONFIG_ADDRESS_PORT, Dword, false, NIC.address(0) as u64);
    assert_eq!(port_io(&mut hk, CONFIG_DATA_PORT, Dword, true, 0), 0x100e_8086);
}

#[test]
fn test_add_pci_device_rules() {
    let mut hk = mock::hyperkernel();
    let domain = hk.create_domain().unwrap();
    hk.add_pci_device(domain, nic()).unwrap();
    assert_eq!(
        hk.add_pci_device(domain, nic()).err(),
        Some(AxError::AlreadyExists)
    );

    let vcpu = hk.create_vcpu(domain).unwrap();
    hk.run_vcpu(0, vcpu, mock::GUEST_ENTRY, 0).unwrap();
    let late = PciDevice::new(Bdf::new(0, 4, 0), 0x1af4, 0x1000, 0);
    assert_eq!(hk.add_pci_device(domain, late).err(), Some(AxError::BadState));
    assert_eq!(hk.domain(domain).unwrap().pci_devices().len(), 1);
}
