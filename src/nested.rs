//! Forwarding of traps to an emulated (nested) EL2.
//!
//! Whether a trap belongs to the guest hypervisor rather than to us is
//! decided in [`should_forward_to_nested`] only; the class handlers ask it and
//! then call [`inject_nested_sync`].

use axerrno::AxResult;
use log::trace;

use crate::esr::TrapSyndrome;
use crate::exit::ExitOutcome;
use crate::vcpu::{
    El2SysReg, VCpuContext, CPTR_EL2_TFP, HCR_NV, HCR_TSC, HCR_TWE, HCR_TWI, PSR_A_BIT, PSR_D_BIT,
    PSR_F_BIT, PSR_I_BIT, PSR_MODE_EL2H, PSR_MODE_EL2T,
};

/// Vector offsets from `VBAR_EL2`.
const VECTOR_CURRENT_SP0: u64 = 0x000;
const VECTOR_CURRENT_SPX: u64 = 0x200;
const VECTOR_LOWER_AARCH64: u64 = 0x400;
const VECTOR_LOWER_AARCH32: u64 = 0x600;

/// The kinds of traps a guest hypervisor may have asked to see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NestedTrap {
    /// HVC executed by the nested guest.
    Hvc,
    /// SMC, trapped by the virtual `HCR_EL2.TSC`.
    Smc,
    /// FP/ASIMD access, trapped by the virtual `CPTR_EL2.TFP`.
    FpAsimd,
    /// ERET executed in virtual EL2 while the virtual `HCR_EL2.NV` is set.
    Eret,
    /// WFI or WFE, trapped by the virtual `HCR_EL2.TWI`/`TWE`.
    Wfx { is_wfe: bool },
}

/// Whether the virtual `HCR_EL2.NV` asks for EL2 instructions to trap.
pub fn forward_nv_traps(vcpu: &VCpuContext) -> bool {
    vcpu.nested_virt_in_use() && vcpu.sys_reg(El2SysReg::HcrEl2) & HCR_NV != 0
}

/// Decides whether `trap` must be delivered to the guest hypervisor instead
/// of being handled here.
pub fn should_forward_to_nested(vcpu: &VCpuContext, trap: NestedTrap) -> bool {
    if !vcpu.nested_virt_in_use() {
        return false;
    }

    let hcr = vcpu.sys_reg(El2SysReg::HcrEl2);
    match trap {
        // With paravirtualization the HVC may encode an EL2 instruction and
        // must be decoded first.
        NestedTrap::Hvc => !vcpu.config().nested_pv,
        NestedTrap::Smc => forward_nv_traps(vcpu) && hcr & HCR_TSC != 0,
        NestedTrap::FpAsimd => vcpu.sys_reg(El2SysReg::CptrEl2) & CPTR_EL2_TFP != 0,
        NestedTrap::Eret => forward_nv_traps(vcpu),
        NestedTrap::Wfx { is_wfe } => {
            let control = if is_wfe { HCR_TWE } else { HCR_TWI };
            !vcpu.mode_el2() && hcr & control != 0
        }
    }
}

/// Delivers a synchronous exception to the virtual EL2, as if the guest
/// hypervisor had taken `syndrome` itself.
pub fn inject_nested_sync(vcpu: &mut VCpuContext, syndrome: TrapSyndrome) -> ExitOutcome {
    let pc = vcpu.pc();
    let pstate = vcpu.pstate();
    let offset = if vcpu.mode_el2() {
        if vcpu.mode() == PSR_MODE_EL2T {
            VECTOR_CURRENT_SP0
        } else {
            VECTOR_CURRENT_SPX
        }
    } else if vcpu.is_aarch32() {
        VECTOR_LOWER_AARCH32
    } else {
        VECTOR_LOWER_AARCH64
    };

    trace!(
        "vcpu[{}] inject nested sync: esr={:#x} pc={:#x} pstate={:#x}",
        vcpu.id(),
        syndrome.raw(),
        pc,
        pstate
    );

    vcpu.set_sys_reg(El2SysReg::ElrEl2, pc);
    vcpu.set_sys_reg(El2SysReg::SpsrEl2, pstate);
    vcpu.set_sys_reg(El2SysReg::EsrEl2, syndrome.raw() as u64);
    vcpu.set_pstate(PSR_MODE_EL2H | PSR_D_BIT | PSR_A_BIT | PSR_I_BIT | PSR_F_BIT);
    vcpu.set_pc(vcpu.sys_reg(El2SysReg::VbarEl2).wrapping_add(offset));

    ExitOutcome::Resume
}

/// Offers a WFx trap to the guest hypervisor.
///
/// Returns `Ok(None)` when the guest hypervisor did not ask for it.
pub fn handle_wfx_nested(
    vcpu: &mut VCpuContext,
    syndrome: TrapSyndrome,
) -> AxResult<Option<ExitOutcome>> {
    let trap = NestedTrap::Wfx {
        is_wfe: syndrome.wfx_is_wfe(),
    };
    if should_forward_to_nested(vcpu, trap) {
        Ok(Some(inject_nested_sync(vcpu, syndrome)))
    } else {
        Ok(None)
    }
}
