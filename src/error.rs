use core::fmt;

use axerrno::AxError;

use crate::VCpuId;
use crate::exit::ExitReason;

/// Outcome of an exit handler that did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitError {
    /// The guest asked for something invalid. The dispatcher writes the
    /// failure sentinel into the result register and resumes the guest.
    Guest(AxError),
    /// An unknown opcode inside a recognised hypercall group.
    Protocol { group: u64, opcode: u64 },
    /// The handler gives the exit back to the dispatcher as unclaimed.
    Unclaimed(ExitReason),
}

impl From<AxError> for ExitError {
    fn from(err: AxError) -> Self {
        Self::Guest(err)
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Guest(err) => write!(f, "guest error: {:?}", err),
            Self::Protocol { group, opcode } => {
                write!(f, "unknown opcode {:#x} in group {:#x}", opcode, group)
            }
            Self::Unclaimed(reason) => write!(f, "unclaimed exit {:?}", reason),
        }
    }
}

/// Conditions that stop a core's run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HkError {
    /// A guest driver emitted an opcode no handler knows.
    ProtocolViolation {
        vcpu: VCpuId,
        group: u64,
        opcode: u64,
    },
    /// A host vCPU hit a fatal exit; there is nothing to unwind to.
    HostFault { vcpu: VCpuId, reason: ExitReason },
    /// A guest vCPU lost its parent while control was being handed back.
    Orphaned(VCpuId),
    /// The core has not been started.
    NoCurrentVcpu(usize),
    /// The guest entry backend failed.
    Entry(AxError),
}

impl fmt::Display for HkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ProtocolViolation {
                vcpu,
                group,
                opcode,
            } => write!(
                f,
                "vcpu {:#x}: protocol violation, opcode {:#x} in group {:#x}",
                vcpu, opcode, group
            ),
            Self::HostFault { vcpu, reason } => {
                write!(f, "host vcpu {:#x} faulted: {:?}", vcpu, reason)
            }
            Self::Orphaned(vcpu) => write!(f, "vcpu {:#x} has no parent to return to", vcpu),
            Self::NoCurrentVcpu(cpu) => write!(f, "core {} is not running a vcpu", cpu),
            Self::Entry(err) => write!(f, "guest entry failed: {:?}", err),
        }
    }
}
