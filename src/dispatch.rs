use axerrno::AxResult;
use log::error;

use crate::arch_vcpu::AxArchVCpu;
use crate::esr::ExitKind;
use crate::exit::{AxTrapExitReason, ExitOutcome, ExitRecord};
use crate::hal::AxTrapHal;
use crate::handlers::exit_handler_for;
use crate::vcpu::{FaultKind, VCpuContext};

/// Handles one guest exit.
///
/// Returns [`ExitOutcome::Resume`] to re-enter the guest,
/// [`ExitOutcome::Exit`] to report to the managing process, and an error
/// when the exit cannot be handled at all. Every exit is classified on its
/// own; nothing is remembered between calls.
pub fn handle_exit<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    record: &ExitRecord,
) -> AxResult<ExitOutcome> {
    let exit_code = record.exit_code;

    if exit_code.serror_pending() {
        let syndrome = record.syndrome();

        // HVC/SMC already have an adjusted PC, which must be undone so that
        // the call is replayed after the SError has been taken.
        if syndrome.exception_class().is_privileged_call() {
            vcpu.set_pc(vcpu.pc().wrapping_sub(syndrome.instr_len()));
        }

        hal.inject_fault(vcpu, FaultKind::AsynchronousExternalAbort);
        return Ok(ExitOutcome::Resume);
    }

    match exit_code.kind() {
        ExitKind::Irq => Ok(ExitOutcome::Resume),
        ExitKind::El1Serror => {
            hal.inject_fault(vcpu, FaultKind::AsynchronousExternalAbort);
            Ok(ExitOutcome::Resume)
        }
        ExitKind::Trap => {
            let syndrome = record.syndrome();

            // Instructions that fail their condition code check may still
            // trap; they are no-ops.
            if !hal.condition_valid(vcpu, syndrome) {
                hal.skip_instr(vcpu, syndrome.il_is_32bit());
                return Ok(ExitOutcome::Resume);
            }

            exit_handler_for(syndrome).handle(vcpu, hal, record)
        }
        // EL2 has been reset to the hyp-stub, e.g. by a reboot racing with
        // this vcpu.
        ExitKind::HypGone => Ok(ExitOutcome::Exit(AxTrapExitReason::FailEntry {
            hardware_entry_failure_reason: exit_code.code() as u64,
        })),
        ExitKind::Unknown(code) => {
            error!("vcpu[{}] unsupported exception type: {:#x}", vcpu.id(), code);
            Ok(ExitOutcome::Exit(AxTrapExitReason::InternalError {
                exit_code: code,
            }))
        }
    }
}

/// Runs the vcpu until an exit has to be reported to the managing process.
///
/// Exits are handled one at a time, in the order they occur.
pub fn run_vcpu<A: AxArchVCpu, H: AxTrapHal>(
    arch_vcpu: &mut A,
    vcpu: &mut VCpuContext,
    hal: &H,
) -> AxResult<AxTrapExitReason> {
    loop {
        let record = arch_vcpu.run(vcpu)?;
        match handle_exit(vcpu, hal, &record)? {
            ExitOutcome::Resume => continue,
            ExitOutcome::Exit(reason) => return Ok(reason),
        }
    }
}
