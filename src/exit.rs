use memory_addr::VirtAddr;

use crate::esr::{ExitCode, TrapSyndrome};

#[allow(unused_imports)] // used in doc
use crate::handle_exit;

/// Everything the world switch captured about one guest exit.
///
/// An exit record is built once per exit and consumed by [`handle_exit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    /// The raw exit code, including the SError-pending flag.
    pub exit_code: ExitCode,
    /// The raw `ESR_EL2` value.
    pub esr: u32,
    /// `FAR_EL2`, for watchpoints and aborts.
    pub fault_addr: Option<VirtAddr>,
}

impl ExitRecord {
    pub const fn new(exit_code: ExitCode, esr: u32) -> Self {
        Self {
            exit_code,
            esr,
            fault_addr: None,
        }
    }

    /// A trap exit with the given syndrome.
    pub const fn trap(esr: u32) -> Self {
        Self::new(ExitCode::TRAP, esr)
    }

    pub fn with_fault_addr(mut self, fault_addr: VirtAddr) -> Self {
        self.fault_addr = Some(fault_addr);
        self
    }

    pub const fn syndrome(&self) -> TrapSyndrome {
        TrapSyndrome::new(self.esr)
    }
}

/// The reason reported to the managing process when the vcpu stops running
/// the guest.
///
/// This mirrors the `exit_reason` field of `struct kvm_run`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AxTrapExitReason {
    /// A debug exception (software step, breakpoint, BRK/BKPT or
    /// watchpoint). Corresponds to `KVM_EXIT_DEBUG`.
    Debug {
        /// The raw syndrome of the debug exception.
        hsr: u32,
        /// The faulting address, only reported for watchpoints.
        far: Option<VirtAddr>,
    },
    /// The vcpu could not be run because EL2 went away.
    /// Corresponds to `KVM_EXIT_FAIL_ENTRY`.
    FailEntry {
        /// Architecture related entry failure reason, the raw exit code.
        hardware_entry_failure_reason: u64,
    },
    /// The vcpu powered itself off through PSCI. It may be resumed later.
    CpuDown,
    /// The guest asked for the whole system to be powered off.
    SystemDown,
    /// The guest asked for the whole system to be reset.
    SystemReset,
    /// The world switch handed over an exit code nobody understands.
    /// Corresponds to `KVM_EXIT_INTERNAL_ERROR`.
    InternalError {
        /// The unrecognized exit code.
        exit_code: u32,
    },
}

/// What to do after one exit has been handled.
///
/// Unrecoverable errors are not an outcome: they travel as the `Err` side of
/// [`axerrno::AxResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Re-enter the guest; nothing is visible to the managing process.
    Resume,
    /// Stop and report to the managing process.
    Exit(AxTrapExitReason),
}

impl ExitOutcome {
    pub const fn is_resume(&self) -> bool {
        matches!(self, Self::Resume)
    }
}
