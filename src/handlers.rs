//! Per exception class handlers and the table that selects them.

use axerrno::{ax_err, AxResult};
use log::{error, trace, warn};

use crate::esr::{ExceptionClass, TrapSyndrome, ESR_ELX_EC_MAX};
use crate::exit::{AxTrapExitReason, ExitOutcome, ExitRecord};
use crate::hal::AxTrapHal;
use crate::nested::{self, inject_nested_sync, should_forward_to_nested, NestedTrap};
use crate::pv;
use crate::vcpu::{
    El2SysReg, FaultKind, VCpuContext, VCpuRequest, VCpuState, PSR_MODE_EL1H, PSR_MODE_EL2H,
    PSR_MODE_EL2T, PSR_MODE_MASK,
};

/// Identity of the handler in charge of an exception class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitHandler {
    /// Classes we do not expect: the guest gets an undefined instruction.
    UnknownEc,
    Wfx,
    /// CP14, CP15 and AArch64 MSR/MRS traps, handled by the hypervisor.
    SysReg,
    Hvc,
    Smc,
    Eret,
    /// Stage-2 instruction and data aborts, handled by the hypervisor.
    GuestAbort,
    GuestDebug,
    FpAsimd,
}

const fn handler_for(ec: ExceptionClass) -> ExitHandler {
    match ec {
        ExceptionClass::Wfx => ExitHandler::Wfx,
        ExceptionClass::Cp15_32
        | ExceptionClass::Cp15_64
        | ExceptionClass::Cp14Mr
        | ExceptionClass::Cp14Ls
        | ExceptionClass::Cp14_64
        | ExceptionClass::Sys64 => ExitHandler::SysReg,
        ExceptionClass::Hvc32 | ExceptionClass::Hvc64 => ExitHandler::Hvc,
        ExceptionClass::Smc32 | ExceptionClass::Smc64 => ExitHandler::Smc,
        ExceptionClass::Eret => ExitHandler::Eret,
        ExceptionClass::IabtLow | ExceptionClass::DabtLow => ExitHandler::GuestAbort,
        ExceptionClass::SoftstpLow
        | ExceptionClass::WatchptLow
        | ExceptionClass::BreakptLow
        | ExceptionClass::Bkpt32
        | ExceptionClass::Brk64 => ExitHandler::GuestDebug,
        ExceptionClass::FpAsimd => ExitHandler::FpAsimd,
        _ => ExitHandler::UnknownEc,
    }
}

const fn build_exit_handlers() -> [ExitHandler; ESR_ELX_EC_MAX + 1] {
    let mut table = [ExitHandler::UnknownEc; ESR_ELX_EC_MAX + 1];
    let mut ec = 0;
    while ec <= ESR_ELX_EC_MAX {
        table[ec] = handler_for(ExceptionClass::from_code(ec as u8));
        ec += 1;
    }
    table
}

/// Exception class code to handler, built at compile time and never written.
static ARM_EXIT_HANDLERS: [ExitHandler; ESR_ELX_EC_MAX + 1] = build_exit_handlers();

/// Looks up the handler for the exception class of `syndrome`.
pub fn exit_handler_for(syndrome: TrapSyndrome) -> ExitHandler {
    ARM_EXIT_HANDLERS
        .get(syndrome.ec_code() as usize)
        .copied()
        .unwrap_or(ExitHandler::UnknownEc)
}

impl ExitHandler {
    /// Runs this handler for a trap exit.
    pub fn handle<H: AxTrapHal>(
        self,
        vcpu: &mut VCpuContext,
        hal: &H,
        record: &ExitRecord,
    ) -> AxResult<ExitOutcome> {
        match self {
            Self::UnknownEc => Ok(handle_unknown_ec(vcpu, hal, record)),
            Self::Wfx => handle_wfx(vcpu, hal, record),
            Self::SysReg => hal.handle_sys_reg(vcpu, record),
            Self::Hvc => handle_hvc(vcpu, hal, record),
            Self::Smc => Ok(handle_smc(vcpu, hal, record)),
            Self::Eret => Ok(handle_eret(vcpu, hal, record)),
            Self::GuestAbort => hal.handle_guest_abort(vcpu, record),
            Self::GuestDebug => handle_guest_debug(record),
            Self::FpAsimd => Ok(handle_fpasimd(vcpu, hal, record)),
        }
    }
}

fn inject_undefined<H: AxTrapHal>(vcpu: &mut VCpuContext, hal: &H) -> ExitOutcome {
    hal.inject_fault(vcpu, FaultKind::UndefinedInstruction);
    ExitOutcome::Resume
}

fn trace_privileged_call(vcpu: &VCpuContext, syndrome: TrapSyndrome) {
    trace!(
        "vcpu[{}] {}: pc={:#x} x0={:#x} imm={:#x}",
        vcpu.id(),
        syndrome.exception_class().name(),
        vcpu.pc(),
        vcpu.gpr(0),
        syndrome.hvc_imm()
    );
}

fn handle_hvc<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    record: &ExitRecord,
) -> AxResult<ExitOutcome> {
    let syndrome = record.syndrome();
    trace_privileged_call(vcpu, syndrome);
    vcpu.stat_mut().hvc_exit_stat += 1;

    if vcpu.nested_virt_in_use() {
        if should_forward_to_nested(vcpu, NestedTrap::Hvc) {
            return Ok(inject_nested_sync(vcpu, syndrome));
        }
        if let Some(outcome) = pv::handle_hvc_nested(vcpu, hal, syndrome)? {
            return Ok(outcome);
        }
    }

    // The PC already points past the HVC.
    match hal.psci_call(vcpu) {
        Some(outcome) => Ok(outcome),
        None => Ok(inject_undefined(vcpu, hal)),
    }
}

fn handle_smc<H: AxTrapHal>(vcpu: &mut VCpuContext, hal: &H, record: &ExitRecord) -> ExitOutcome {
    let syndrome = record.syndrome();
    trace_privileged_call(vcpu, syndrome);
    vcpu.stat_mut().hvc_exit_stat += 1;

    if should_forward_to_nested(vcpu, NestedTrap::Smc) {
        return inject_nested_sync(vcpu, syndrome);
    }

    // Only `SMC #0` is defined.
    if syndrome.hvc_imm() != 0 {
        return inject_undefined(vcpu, hal);
    }

    // A trapped SMC leaves the PC on the instruction itself. Nothing to skip
    // when the call is rejected: the undefined exception returns to it.
    match hal.psci_call(vcpu) {
        Some(outcome) => {
            hal.skip_instr(vcpu, syndrome.il_is_32bit());
            outcome
        }
        None => inject_undefined(vcpu, hal),
    }
}

/// WFE yields the physical CPU and comes back when the scheduler decides
/// to. WFI blocks until an interrupt is pending for the vcpu or someone
/// raises [`VCpuRequest::Unhalt`].
fn handle_wfx<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    record: &ExitRecord,
) -> AxResult<ExitOutcome> {
    let syndrome = record.syndrome();
    let is_wfe = syndrome.wfx_is_wfe();

    if vcpu.nested_virt_in_use() {
        if let Some(outcome) = nested::handle_wfx_nested(vcpu, syndrome)? {
            return Ok(outcome);
        }
    }

    if is_wfe {
        trace!("vcpu[{}] WFE at {:#x}", vcpu.id(), vcpu.pc());
        vcpu.stat_mut().wfe_exit_stat += 1;
        hal.vcpu_on_spin(vcpu);
    } else {
        trace!("vcpu[{}] WFI at {:#x}", vcpu.id(), vcpu.pc());
        vcpu.stat_mut().wfi_exit_stat += 1;
        vcpu.transition_state(VCpuState::Running, VCpuState::Blocked)?;
        hal.vcpu_block(vcpu);
        vcpu.transition_state(VCpuState::Blocked, VCpuState::Running)?;
        vcpu.requests().clear(VCpuRequest::Unhalt);
    }

    hal.skip_instr(vcpu, syndrome.il_is_32bit());
    Ok(ExitOutcome::Resume)
}

/// All debug exceptions are reported to the managing process, which decides
/// whether the guest or the host debugger owns them.
fn handle_guest_debug(record: &ExitRecord) -> AxResult<ExitOutcome> {
    let hsr = record.esr;
    let far = match record.syndrome().exception_class() {
        ExceptionClass::WatchptLow => record.fault_addr,
        ExceptionClass::SoftstpLow
        | ExceptionClass::BreakptLow
        | ExceptionClass::Bkpt32
        | ExceptionClass::Brk64 => None,
        other => {
            error!("handle_guest_debug: un-handled case hsr: {:#010x} ({})", hsr, other);
            return ax_err!(InvalidData, "debug exit with a non-debug exception class");
        }
    };
    Ok(ExitOutcome::Exit(AxTrapExitReason::Debug { hsr, far }))
}

fn handle_unknown_ec<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    record: &ExitRecord,
) -> ExitOutcome {
    let syndrome = record.syndrome();
    warn!(
        "vcpu[{}] unknown exception class: hsr: {:#010x} -- {}",
        vcpu.id(),
        syndrome.raw(),
        syndrome.exception_class()
    );
    inject_undefined(vcpu, hal)
}

/// FP/ASIMD traps only reach us when the guest hypervisor asked for them or
/// when guests get no FP/ASIMD at all.
fn handle_fpasimd<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    record: &ExitRecord,
) -> ExitOutcome {
    if should_forward_to_nested(vcpu, NestedTrap::FpAsimd) {
        return inject_nested_sync(vcpu, record.syndrome());
    }
    inject_undefined(vcpu, hal)
}

fn handle_eret<H: AxTrapHal>(vcpu: &mut VCpuContext, hal: &H, record: &ExitRecord) -> ExitOutcome {
    trace!(
        "vcpu[{}] nested eret: elr_el2={:#x} spsr_el2={:#x}",
        vcpu.id(),
        vcpu.sys_reg(El2SysReg::ElrEl2),
        vcpu.sys_reg(El2SysReg::SpsrEl2)
    );

    if !vcpu.nested_virt_in_use() {
        warn!("vcpu[{}] ERET trapped without nested virtualization", vcpu.id());
        return inject_undefined(vcpu, hal);
    }

    if should_forward_to_nested(vcpu, NestedTrap::Eret) {
        return inject_nested_sync(vcpu, record.syndrome());
    }

    emulate_eret(vcpu)
}

/// Performs an exception return from the virtual EL2.
///
/// The vcpu is always in virtual EL2 here, since ERET only traps while the
/// guest hypervisor runs.
pub(crate) fn emulate_eret(vcpu: &mut VCpuContext) -> ExitOutcome {
    vcpu.set_pc(vcpu.sys_reg(El2SysReg::ElrEl2));
    vcpu.set_pstate(vcpu.sys_reg(El2SysReg::SpsrEl2));

    // A VHE guest hypervisor returning to itself has an EL1 target in its
    // SPSR_EL2, recorded when it took an exception to itself. It never left
    // the virtual EL2, so put it back there.
    if vcpu.mode_el1() && vcpu.el2_e2h_is_set() && vcpu.el2_tge_is_set() {
        let mode = if vcpu.mode() == PSR_MODE_EL1H {
            PSR_MODE_EL2H
        } else {
            PSR_MODE_EL2T
        };
        vcpu.set_pstate((vcpu.pstate() & !PSR_MODE_MASK) | mode);
    }

    ExitOutcome::Resume
}
