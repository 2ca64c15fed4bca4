//! Instruction-skip and condition-check primitives.
//!
//! These are the default behaviours of [`AxTrapHal::skip_instr`] and
//! [`AxTrapHal::condition_valid`].

use crate::esr::TrapSyndrome;
use crate::vcpu::{VCpuContext, PSR_C_BIT, PSR_N_BIT, PSR_V_BIT, PSR_Z_BIT};

#[allow(unused_imports)] // used in doc
use crate::AxTrapHal;

/// Thumb state bit of an AArch32 PSTATE.
pub const PSR_AA32_T_BIT: u64 = 0x0000_0020;
/// `IT[7:0]`, split over PSTATE bits [15:10] and [26:25].
pub const PSR_AA32_IT_MASK: u64 = 0x0600_fc00;

/// Advances the PC past the trapped instruction and drops any exclusive
/// access in flight.
pub fn skip_instr(vcpu: &mut VCpuContext, is_32bit_instr: bool) {
    if vcpu.is_aarch32() {
        adjust_itstate(vcpu);
    }
    let len = if is_32bit_instr { 4 } else { 2 };
    vcpu.set_pc(vcpu.pc().wrapping_add(len));
    vcpu.set_exclusive_monitor(false);
}

/// Moves the Thumb IT block forward by one instruction.
fn adjust_itstate(vcpu: &mut VCpuContext) {
    let mut cpsr = vcpu.pstate();
    if cpsr & PSR_AA32_T_BIT == 0 || cpsr & PSR_AA32_IT_MASK == 0 {
        return;
    }

    let mut cond = (cpsr & 0xe000) >> 13;
    let mut itbits = (cpsr & 0x1c00) >> (10 - 2);
    itbits |= (cpsr & (0x3 << 25)) >> 25;

    if itbits & 0x7 == 0 {
        itbits = 0;
        cond = 0;
    } else {
        itbits = (itbits << 1) & 0x1f;
    }

    cpsr &= !PSR_AA32_IT_MASK;
    cpsr |= cond << 13;
    cpsr |= (itbits & 0x1c) << (10 - 2);
    cpsr |= (itbits & 0x3) << 25;
    vcpu.set_pstate(cpsr);
}

/// Whether a trapped instruction passed its condition code check.
///
/// A conditional AArch32 instruction whose condition fails is architecturally
/// a no-op, yet it may still trap to EL2.
pub fn condition_valid(vcpu: &VCpuContext, syndrome: TrapSyndrome) -> bool {
    if !vcpu.is_aarch32() {
        return true;
    }

    // Classes with either of the two top bits set are unconditional.
    if syndrome.ec_code() >> 4 != 0 {
        return true;
    }

    let cpsr = vcpu.pstate();
    let cond = if syndrome.cond_valid() {
        syndrome.cond()
    } else {
        // Thumb code without a valid COND field: look at the IT state.
        let it = ((cpsr >> 8) & 0xfc) | ((cpsr >> 25) & 0x3);
        if it == 0 {
            return true;
        }
        (it >> 4) as u8
    };

    condition_holds(cond, cpsr)
}

/// Evaluates the AArch32 condition `cond` against the NZCV flags of `cpsr`.
pub fn condition_holds(cond: u8, cpsr: u64) -> bool {
    let n = cpsr & PSR_N_BIT != 0;
    let z = cpsr & PSR_Z_BIT != 0;
    let c = cpsr & PSR_C_BIT != 0;
    let v = cpsr & PSR_V_BIT != 0;

    match cond & 0xf {
        0x0 => z,
        0x1 => !z,
        0x2 => c,
        0x3 => !c,
        0x4 => n,
        0x5 => !n,
        0x6 => v,
        0x7 => !v,
        0x8 => c && !z,
        0x9 => !c || z,
        0xa => n == v,
        0xb => n != v,
        0xc => !z && n == v,
        0xd => z || n != v,
        // AL, and the unconditional encoding space
        _ => true,
    }
}
