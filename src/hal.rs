use axerrno::{ax_err, AxResult};

use crate::emulate;
use crate::esr::TrapSyndrome;
use crate::exit::{ExitOutcome, ExitRecord};
use crate::vcpu::{FaultKind, VCpuContext};

/// The interfaces which the surrounding hypervisor must implement for the
/// exit handlers.
///
/// Every method works on the vcpu whose exit is being handled; none of them
/// may touch another vcpu's registers.
pub trait AxTrapHal {
    /// Delivers a guest-visible fault on the next guest entry.
    ///
    /// Injection never advances the PC. The default marks the fault pending
    /// in the vcpu context.
    fn inject_fault(&self, vcpu: &mut VCpuContext, kind: FaultKind) {
        vcpu.pend_fault(kind);
    }

    /// Services a PSCI (firmware / power management) call.
    ///
    /// # Parameters
    ///
    /// * `vcpu` - The calling vcpu. The function ID is in `x0` and the
    ///   arguments in `x1`..`x3`.
    ///
    /// # Returns
    ///
    /// * `None` - The call is not recognized. The caller injects an
    ///   undefined instruction.
    /// * `Some(outcome)` - The call was serviced and its result written to
    ///   `x0`. `outcome` is passed on unchanged, e.g.
    ///   [`crate::AxTrapExitReason::SystemDown`] for `SYSTEM_OFF`.
    fn psci_call(&self, vcpu: &mut VCpuContext) -> Option<ExitOutcome>;

    /// Advances the PC past the trapped instruction.
    fn skip_instr(&self, vcpu: &mut VCpuContext, is_32bit_instr: bool) {
        emulate::skip_instr(vcpu, is_32bit_instr);
    }

    /// Whether the trapped instruction passed its condition code check.
    fn condition_valid(&self, vcpu: &VCpuContext, syndrome: TrapSyndrome) -> bool {
        emulate::condition_valid(vcpu, syndrome)
    }

    /// Gives up the physical CPU for a while without blocking (WFE).
    fn vcpu_on_spin(&self, vcpu: &mut VCpuContext);

    /// Blocks the calling thread until the vcpu has a pending interrupt or
    /// [`crate::VCpuRequest::Unhalt`] is raised (WFI).
    ///
    /// # Parameters
    ///
    /// * `vcpu` - The vcpu executing WFI. It is in
    ///   [`crate::VCpuState::Blocked`] for the duration of the call.
    ///
    /// # Returns
    ///
    /// Nothing. Returning means the vcpu may run again; a spurious wakeup is
    /// harmless since the guest re-executes its wait loop.
    fn vcpu_block(&self, vcpu: &mut VCpuContext);

    /// Handles a trapped coprocessor or system register access
    /// (CP14, CP15 and MSR/MRS classes).
    fn handle_sys_reg(&self, vcpu: &mut VCpuContext, record: &ExitRecord) -> AxResult<ExitOutcome>;

    /// Handles a stage-2 instruction or data abort from the guest.
    fn handle_guest_abort(
        &self,
        vcpu: &mut VCpuContext,
        record: &ExitRecord,
    ) -> AxResult<ExitOutcome>;

    /// Performs a TLB maintenance operation on behalf of a paravirtualized
    /// guest hypervisor.
    ///
    /// # Parameters
    ///
    /// * `vcpu` - The vcpu running the guest hypervisor.
    /// * `op` - The paravirtualized TLBI operation number.
    /// * `arg` - The content of the register operand.
    ///
    /// # Returns
    ///
    /// * `AxResult` - `Ok(())` once the maintenance is done. An error stops
    ///   the vcpu; the default returns [`axerrno::AxError::Unsupported`].
    fn nested_tlbi(&self, _vcpu: &mut VCpuContext, op: u8, _arg: u64) -> AxResult {
        ax_err!(Unsupported, format!("paravirtualized TLBI {} not supported", op))
    }
}
