//! Decoding of the raw exit code and of the exception syndrome (`ESR_EL2`).

use core::fmt;

/// Bit in the raw exit code set by the world switch when an SError was
/// pending at the time the guest exited.
pub const ARM_EXIT_WITH_SERROR_BIT: u32 = 31;

/// The error code returned by the hyp-stub once EL2 has been reset.
pub const HVC_STUB_ERR: u32 = 0x0bad_ca11;

pub const ESR_ELX_EC_SHIFT: u32 = 26;
pub const ESR_ELX_EC_MASK: u32 = 0x3f << ESR_ELX_EC_SHIFT;
pub const ESR_ELX_EC_MAX: usize = 0x3f;
pub const ESR_ELX_IL: u32 = 1 << 25;
pub const ESR_ELX_ISS_MASK: u32 = ESR_ELX_IL - 1;
pub const ESR_ELX_CV: u32 = 1 << 24;
pub const ESR_ELX_COND_SHIFT: u32 = 20;
pub const ESR_ELX_COND_MASK: u32 = 0xf << ESR_ELX_COND_SHIFT;
pub const ESR_ELX_WFX_ISS_WFE: u32 = 1 << 0;
pub const ESR_ELX_HVC_IMM_MASK: u32 = 0xffff;

/// The exit code handed over by the world switch.
///
/// Bit [`ARM_EXIT_WITH_SERROR_BIT`] flags a pending SError, the other bits
/// carry the exception code (see [`ExitKind`]).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub u32);

/// The classified exception code of an [`ExitCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitKind {
    /// A physical interrupt, already serviced by the world switch.
    Irq,
    /// An SError taken while the guest was running.
    El1Serror,
    /// A synchronous trap described by the syndrome.
    Trap,
    /// EL2 was reset to the hyp-stub under our feet.
    HypGone,
    /// Anything the world switch is not supposed to hand us.
    Unknown(u32),
}

impl ExitCode {
    pub const IRQ: Self = Self(0);
    pub const EL1_SERROR: Self = Self(1);
    pub const TRAP: Self = Self(2);
    pub const HYP_GONE: Self = Self(HVC_STUB_ERR);

    /// Returns this exit code with the SError-pending flag set.
    pub const fn with_serror_pending(self) -> Self {
        Self(self.0 | (1 << ARM_EXIT_WITH_SERROR_BIT))
    }

    /// Whether an SError was pending when the guest exited.
    pub const fn serror_pending(self) -> bool {
        self.0 & (1 << ARM_EXIT_WITH_SERROR_BIT) != 0
    }

    /// The exception code with the SError-pending flag stripped.
    pub const fn code(self) -> u32 {
        self.0 & !(1 << ARM_EXIT_WITH_SERROR_BIT)
    }

    pub const fn kind(self) -> ExitKind {
        match self.code() {
            0 => ExitKind::Irq,
            1 => ExitKind::El1Serror,
            2 => ExitKind::Trap,
            HVC_STUB_ERR => ExitKind::HypGone,
            other => ExitKind::Unknown(other),
        }
    }
}

impl fmt::Debug for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitCode({:#x})", self.0)
    }
}

/// Exception classes of `ESR_ELx.EC`.
///
/// Codes not listed here are kept as [`ExceptionClass::Reserved`], so the
/// conversion from a 6-bit code is total.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionClass {
    Unknown,
    Wfx,
    Cp15_32,
    Cp15_64,
    Cp14Mr,
    Cp14Ls,
    FpAsimd,
    Cp10Id,
    Pac,
    Cp14_64,
    Ill,
    Svc32,
    Hvc32,
    Smc32,
    Svc64,
    Hvc64,
    Smc64,
    Sys64,
    Sve,
    Eret,
    ImpDef,
    IabtLow,
    IabtCur,
    PcAlign,
    DabtLow,
    DabtCur,
    SpAlign,
    FpExc32,
    FpExc64,
    Serror,
    BreakptLow,
    BreakptCur,
    SoftstpLow,
    SoftstpCur,
    WatchptLow,
    WatchptCur,
    Bkpt32,
    Vector32,
    Brk64,
    Reserved(u8),
}

impl ExceptionClass {
    /// Decodes a 6-bit exception class code. Bits above the sixth are ignored.
    pub const fn from_code(code: u8) -> Self {
        match code & ESR_ELX_EC_MAX as u8 {
            0x00 => Self::Unknown,
            0x01 => Self::Wfx,
            0x03 => Self::Cp15_32,
            0x04 => Self::Cp15_64,
            0x05 => Self::Cp14Mr,
            0x06 => Self::Cp14Ls,
            0x07 => Self::FpAsimd,
            0x08 => Self::Cp10Id,
            0x09 => Self::Pac,
            0x0c => Self::Cp14_64,
            0x0e => Self::Ill,
            0x11 => Self::Svc32,
            0x12 => Self::Hvc32,
            0x13 => Self::Smc32,
            0x15 => Self::Svc64,
            0x16 => Self::Hvc64,
            0x17 => Self::Smc64,
            0x18 => Self::Sys64,
            0x19 => Self::Sve,
            0x1a => Self::Eret,
            0x1f => Self::ImpDef,
            0x20 => Self::IabtLow,
            0x21 => Self::IabtCur,
            0x22 => Self::PcAlign,
            0x24 => Self::DabtLow,
            0x25 => Self::DabtCur,
            0x26 => Self::SpAlign,
            0x28 => Self::FpExc32,
            0x2c => Self::FpExc64,
            0x2f => Self::Serror,
            0x30 => Self::BreakptLow,
            0x31 => Self::BreakptCur,
            0x32 => Self::SoftstpLow,
            0x33 => Self::SoftstpCur,
            0x34 => Self::WatchptLow,
            0x35 => Self::WatchptCur,
            0x38 => Self::Bkpt32,
            0x3a => Self::Vector32,
            0x3c => Self::Brk64,
            other => Self::Reserved(other),
        }
    }

    /// The 6-bit code of this class.
    pub const fn code(self) -> u8 {
        match self {
            Self::Unknown => 0x00,
            Self::Wfx => 0x01,
            Self::Cp15_32 => 0x03,
            Self::Cp15_64 => 0x04,
            Self::Cp14Mr => 0x05,
            Self::Cp14Ls => 0x06,
            Self::FpAsimd => 0x07,
            Self::Cp10Id => 0x08,
            Self::Pac => 0x09,
            Self::Cp14_64 => 0x0c,
            Self::Ill => 0x0e,
            Self::Svc32 => 0x11,
            Self::Hvc32 => 0x12,
            Self::Smc32 => 0x13,
            Self::Svc64 => 0x15,
            Self::Hvc64 => 0x16,
            Self::Smc64 => 0x17,
            Self::Sys64 => 0x18,
            Self::Sve => 0x19,
            Self::Eret => 0x1a,
            Self::ImpDef => 0x1f,
            Self::IabtLow => 0x20,
            Self::IabtCur => 0x21,
            Self::PcAlign => 0x22,
            Self::DabtLow => 0x24,
            Self::DabtCur => 0x25,
            Self::SpAlign => 0x26,
            Self::FpExc32 => 0x28,
            Self::FpExc64 => 0x2c,
            Self::Serror => 0x2f,
            Self::BreakptLow => 0x30,
            Self::BreakptCur => 0x31,
            Self::SoftstpLow => 0x32,
            Self::SoftstpCur => 0x33,
            Self::WatchptLow => 0x34,
            Self::WatchptCur => 0x35,
            Self::Bkpt32 => 0x38,
            Self::Vector32 => 0x3a,
            Self::Brk64 => 0x3c,
            Self::Reserved(code) => code,
        }
    }

    /// Whether this class is one of the four HVC/SMC variants.
    pub const fn is_privileged_call(self) -> bool {
        matches!(self, Self::Hvc32 | Self::Hvc64 | Self::Smc32 | Self::Smc64)
    }

    /// A human-readable name, for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown/Uncategorized",
            Self::Wfx => "WFI/WFE",
            Self::Cp15_32 => "CP15 MCR/MRC",
            Self::Cp15_64 => "CP15 MCRR/MRRC",
            Self::Cp14Mr => "CP14 MCR/MRC",
            Self::Cp14Ls => "CP14 LDC/STC",
            Self::FpAsimd => "ASIMD",
            Self::Cp10Id => "CP10 MRC/VMRS",
            Self::Pac => "PAC",
            Self::Cp14_64 => "CP14 MCRR/MRRC",
            Self::Ill => "PSTATE.IL",
            Self::Svc32 => "SVC (AArch32)",
            Self::Hvc32 => "HVC (AArch32)",
            Self::Smc32 => "SMC (AArch32)",
            Self::Svc64 => "SVC (AArch64)",
            Self::Hvc64 => "HVC (AArch64)",
            Self::Smc64 => "SMC (AArch64)",
            Self::Sys64 => "MSR/MRS (AArch64)",
            Self::Sve => "SVE",
            Self::Eret => "ERET/ERETAA/ERETAB",
            Self::ImpDef => "EL3 IMP DEF",
            Self::IabtLow => "IABT (lower EL)",
            Self::IabtCur => "IABT (current EL)",
            Self::PcAlign => "PC Alignment",
            Self::DabtLow => "DABT (lower EL)",
            Self::DabtCur => "DABT (current EL)",
            Self::SpAlign => "SP Alignment",
            Self::FpExc32 => "FP (AArch32)",
            Self::FpExc64 => "FP (AArch64)",
            Self::Serror => "SError",
            Self::BreakptLow => "Breakpoint (lower EL)",
            Self::BreakptCur => "Breakpoint (current EL)",
            Self::SoftstpLow => "Software Step (lower EL)",
            Self::SoftstpCur => "Software Step (current EL)",
            Self::WatchptLow => "Watchpoint (lower EL)",
            Self::WatchptCur => "Watchpoint (current EL)",
            Self::Bkpt32 => "BKPT (AArch32)",
            Self::Vector32 => "Vector catch (AArch32)",
            Self::Brk64 => "BRK (AArch64)",
            Self::Reserved(_) => "UNRECOGNIZED EC",
        }
    }
}

impl fmt::Display for ExceptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.code())
    }
}

/// A read-only view of a raw `ESR_EL2` value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrapSyndrome(u32);

impl TrapSyndrome {
    pub const fn new(esr: u32) -> Self {
        Self(esr)
    }

    /// Builds a syndrome from its class, instruction length and ISS.
    pub const fn from_parts(ec: ExceptionClass, il_is_32bit: bool, iss: u32) -> Self {
        let il = if il_is_32bit { ESR_ELX_IL } else { 0 };
        Self(((ec.code() as u32) << ESR_ELX_EC_SHIFT) | il | (iss & ESR_ELX_ISS_MASK))
    }

    /// The raw syndrome value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn ec_code(self) -> u8 {
        ((self.0 & ESR_ELX_EC_MASK) >> ESR_ELX_EC_SHIFT) as u8
    }

    pub const fn exception_class(self) -> ExceptionClass {
        ExceptionClass::from_code(self.ec_code())
    }

    /// Whether the trapped instruction was 32 bits wide (16 bits otherwise).
    pub const fn il_is_32bit(self) -> bool {
        self.0 & ESR_ELX_IL != 0
    }

    /// The width in bytes of the trapped instruction.
    pub const fn instr_len(self) -> u64 {
        if self.il_is_32bit() { 4 } else { 2 }
    }

    pub const fn iss(self) -> u32 {
        self.0 & ESR_ELX_ISS_MASK
    }

    /// The 16-bit immediate of a trapped HVC or SMC.
    pub const fn hvc_imm(self) -> u16 {
        (self.0 & ESR_ELX_HVC_IMM_MASK) as u16
    }

    /// Whether [`Self::cond`] holds a valid condition code.
    pub const fn cond_valid(self) -> bool {
        self.0 & ESR_ELX_CV != 0
    }

    pub const fn cond(self) -> u8 {
        ((self.0 & ESR_ELX_COND_MASK) >> ESR_ELX_COND_SHIFT) as u8
    }

    /// For a WFx trap, whether the instruction was WFE (WFI otherwise).
    pub const fn wfx_is_wfe(self) -> bool {
        self.0 & ESR_ELX_WFX_ISS_WFE != 0
    }
}

impl fmt::Debug for TrapSyndrome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapSyndrome")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("ec", &self.exception_class())
            .field("il", &self.il_is_32bit())
            .field("iss", &format_args!("{:#x}", self.iss()))
            .finish()
    }
}
