//! Unit tests for the hyperkernel, run against a HAL backed by process memory.

mod mock;

mod apic;
mod general_registers;
mod guest_page_walk;
mod pci;
