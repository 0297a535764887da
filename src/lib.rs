#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod builtin;
mod config;
mod context;
mod dispatch;
mod domain;
mod ept;
mod error;
mod exit;
mod fault;
mod hal;
mod hyperkernel;
mod mem;
mod page_table;
mod percpu;
#[cfg(feature = "vmx")]
mod portio;
mod regs;
mod shootdown;
mod vcpu;

pub mod device;
pub mod hypercall;

#[cfg(test)]
mod tests;

/// Identity of a domain. `0` is the root domain.
pub type DomainId = u64;
/// Identity of a vCPU. Host vCPUs share the id of their core.
pub type VCpuId = u64;

pub use builtin::{LEAF_HK_APIC, LEAF_HK_NDVM_ROUTE};
pub use config::HyperkernelConfig;
pub use context::VcpuContext;
pub use dispatch::{Disposition, ExitContext, ExitHandler, HandlerTable};
pub use domain::{DescriptorTables, Domain, DomainKind, E820Entry, E820Type};
pub use ept::{EptEntry, EptFlags, ExtendedPageTable};
pub use error::{ExitError, HkError};
pub use exit::{
    AccessWidth, EptViolationInfo, ExitInfo, ExitReason, InterruptInfo, IoExitInfo, MmioAccess,
};
pub use hal::Hal;
pub use hyperkernel::{GuestEntry, GuestPod, Hyperkernel, ROOT_DOMAIN};
pub use mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr, PhysFrame};
pub use page_table::{GuestPageTable, GuestPageTable64, GuestPageWalkInfo, WalkAccess};
pub use percpu::CoreState;
pub use regs::{GeneralRegisters, GeneralRegistersDiff};
pub use shootdown::{SHOOTDOWN_VECTOR, Shootdown};
pub use vcpu::{VCpu, VCpuState};

pub use axerrno::{AxError, AxResult};
pub use page_table_entry::MappingFlags;
pub use page_table_multiarch::PageSize;
