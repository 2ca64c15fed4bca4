//! Paravirtualized EL2 instructions.
//!
//! A paravirtualized guest hypervisor replaces its EL2 instructions with
//! `HVC #imm`, where the 16-bit immediate encodes the instruction:
//!
//! ```text
//!  15   13 12            5 4       0
//! +-------+---------------+---------+
//! | instr |  sysreg / op  |  gpreg  |
//! +-------+---------------+---------+
//! ```
//!
//! `instr` is one of `SMC` (0), `MRS` (1), `MSR` register (2), `MSR`
//! immediate (3), `ERET` (4), `TLBI` (5), `HVC` (6); 7 is reserved.

use axerrno::AxResult;
use log::trace;

use crate::esr::TrapSyndrome;
use crate::exit::ExitOutcome;
use crate::handlers::emulate_eret;
use crate::hal::AxTrapHal;
use crate::nested::inject_nested_sync;
use crate::vcpu::{El2SysReg, FaultKind, VCpuContext};

pub const PV_INSTR_SHIFT: u16 = 13;
pub const PV_PAYLOAD_MASK: u16 = (1 << PV_INSTR_SHIFT) - 1;

const SMC_PV: u16 = 0x0;
const MRS_PV: u16 = 0x1;
const MSR_REG_PV: u16 = 0x2;
const MSR_IMM_PV: u16 = 0x3;
const ERET_PV: u16 = 0x4;
const TLBI_PV: u16 = 0x5;
const HVC_PV: u16 = 0x6;

/// The only paravirtualized SMC: a PSCI call.
pub const SMC_PSCI: u16 = 0x1;

const MS_SYSREG_SHIFT: u16 = 5;
const MS_SYSREG_MASK: u16 = 0xff << MS_SYSREG_SHIFT;
const MS_GPREG_MASK: u16 = 0x1f;
const MS_IMM_MASK: u16 = 0x0f;
const TLBI_INSTR_SHIFT: u16 = 5;

/// A decoded paravirtualized EL2 instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PvInstr {
    Smc { payload: u16 },
    Mrs { sysreg: El2SysReg, rt: usize },
    MsrReg { sysreg: El2SysReg, rt: usize },
    MsrImm { sysreg: El2SysReg, imm: u64 },
    Eret,
    Tlbi { op: u8, rt: usize },
    Hvc,
}

impl PvInstr {
    /// Decodes an HVC immediate. Returns `None` for the reserved encoding and
    /// for unknown system registers.
    pub fn decode(imm: u16) -> Option<Self> {
        let payload = imm & PV_PAYLOAD_MASK;
        let rt = (payload & MS_GPREG_MASK) as usize;
        let sysreg =
            || El2SysReg::from_index(((payload & MS_SYSREG_MASK) >> MS_SYSREG_SHIFT) as u8);

        match imm >> PV_INSTR_SHIFT {
            SMC_PV => Some(Self::Smc { payload }),
            MRS_PV => Some(Self::Mrs {
                sysreg: sysreg()?,
                rt,
            }),
            MSR_REG_PV => Some(Self::MsrReg {
                sysreg: sysreg()?,
                rt,
            }),
            MSR_IMM_PV => Some(Self::MsrImm {
                sysreg: sysreg()?,
                imm: (payload & MS_IMM_MASK) as u64,
            }),
            ERET_PV => Some(Self::Eret),
            TLBI_PV => Some(Self::Tlbi {
                op: (payload >> TLBI_INSTR_SHIFT) as u8,
                rt,
            }),
            HVC_PV => Some(Self::Hvc),
            _ => None,
        }
    }

    /// Encodes this instruction into an HVC immediate.
    pub fn encode(self) -> u16 {
        let instr =
            |code: u16, payload: u16| (code << PV_INSTR_SHIFT) | (payload & PV_PAYLOAD_MASK);
        let ms = |sysreg: El2SysReg, low: u16| ((sysreg as u16) << MS_SYSREG_SHIFT) | low;

        match self {
            Self::Smc { payload } => instr(SMC_PV, payload),
            Self::Mrs { sysreg, rt } => instr(MRS_PV, ms(sysreg, rt as u16 & MS_GPREG_MASK)),
            Self::MsrReg { sysreg, rt } => instr(MSR_REG_PV, ms(sysreg, rt as u16 & MS_GPREG_MASK)),
            Self::MsrImm { sysreg, imm } => instr(MSR_IMM_PV, ms(sysreg, imm as u16 & MS_IMM_MASK)),
            Self::Eret => instr(ERET_PV, 0),
            Self::Tlbi { op, rt } => instr(
                TLBI_PV,
                ((op as u16) << TLBI_INSTR_SHIFT) | (rt as u16 & MS_GPREG_MASK),
            ),
            Self::Hvc => instr(HVC_PV, 0),
        }
    }
}

/// Handles an HVC of a paravirtualized nested guest.
///
/// Returns `Ok(None)` when the HVC does not carry a paravirtualized
/// instruction, so that the caller falls back to the ordinary HVC path.
pub fn handle_hvc_nested<H: AxTrapHal>(
    vcpu: &mut VCpuContext,
    hal: &H,
    syndrome: TrapSyndrome,
) -> AxResult<Option<ExitOutcome>> {
    // Only the guest hypervisor is paravirtualized; HVCs of its own guests
    // belong to it.
    if !vcpu.mode_el2() {
        return Ok(Some(inject_nested_sync(vcpu, syndrome)));
    }

    let Some(instr) = PvInstr::decode(syndrome.hvc_imm()) else {
        return Ok(None);
    };
    trace!("vcpu[{}] pv instruction {:?}", vcpu.id(), instr);

    let outcome = match instr {
        PvInstr::Smc { payload: SMC_PSCI } => match hal.psci_call(vcpu) {
            Some(outcome) => outcome,
            None => {
                hal.inject_fault(vcpu, FaultKind::UndefinedInstruction);
                ExitOutcome::Resume
            }
        },
        PvInstr::Smc { .. } => return Ok(None),
        PvInstr::Mrs { sysreg, rt } => {
            vcpu.set_gpr(rt, vcpu.sys_reg(sysreg));
            ExitOutcome::Resume
        }
        PvInstr::MsrReg { sysreg, rt } => {
            vcpu.set_sys_reg(sysreg, vcpu.gpr(rt));
            ExitOutcome::Resume
        }
        PvInstr::MsrImm { sysreg, imm } => {
            vcpu.set_sys_reg(sysreg, imm);
            ExitOutcome::Resume
        }
        PvInstr::Eret => emulate_eret(vcpu),
        PvInstr::Tlbi { op, rt } => {
            let arg = vcpu.gpr(rt);
            hal.nested_tlbi(vcpu, op, arg)?;
            ExitOutcome::Resume
        }
        PvInstr::Hvc => inject_nested_sync(vcpu, syndrome),
    };
    Ok(Some(outcome))
}
