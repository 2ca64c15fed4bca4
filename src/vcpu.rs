use alloc::sync::Arc;
use core::iter::Sum;
use core::ops::AddAssign;
use core::sync::atomic::{AtomicU32, Ordering};

use axerrno::{ax_err, AxResult};

pub const PSR_MODE_MASK: u64 = 0x0000_000f;
pub const PSR_MODE_EL0T: u64 = 0x0000_0000;
pub const PSR_MODE_EL1T: u64 = 0x0000_0004;
pub const PSR_MODE_EL1H: u64 = 0x0000_0005;
pub const PSR_MODE_EL2T: u64 = 0x0000_0008;
pub const PSR_MODE_EL2H: u64 = 0x0000_0009;
pub const PSR_MODE32_BIT: u64 = 0x0000_0010;
pub const PSR_F_BIT: u64 = 1 << 6;
pub const PSR_I_BIT: u64 = 1 << 7;
pub const PSR_A_BIT: u64 = 1 << 8;
pub const PSR_D_BIT: u64 = 1 << 9;
pub const PSR_V_BIT: u64 = 1 << 28;
pub const PSR_C_BIT: u64 = 1 << 29;
pub const PSR_Z_BIT: u64 = 1 << 30;
pub const PSR_N_BIT: u64 = 1 << 31;

pub const HCR_TWI: u64 = 1 << 13;
pub const HCR_TWE: u64 = 1 << 14;
pub const HCR_TSC: u64 = 1 << 19;
pub const HCR_TGE: u64 = 1 << 27;
pub const HCR_E2H: u64 = 1 << 34;
pub const HCR_NV: u64 = 1 << 42;

pub const CPTR_EL2_TFP: u64 = 1 << 10;

/// Number of general-purpose registers (`x0`..`x30`).
pub const NR_GPRS: usize = 31;

/// Register number that reads as zero and ignores writes.
pub const XZR: usize = 31;

/// Per-vcpu configuration, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VCpuConfig {
    /// The guest owns an emulated EL2 (nested virtualization).
    pub nested_virt: bool,
    /// Decode paravirtualized EL2 instructions carried in nested HVCs
    /// before forwarding them.
    pub nested_pv: bool,
}

impl Default for VCpuConfig {
    fn default() -> Self {
        Self {
            nested_virt: false,
            nested_pv: cfg!(feature = "nested-pv"),
        }
    }
}

/// The emulated EL2 system registers of a nested guest.
///
/// The discriminants are the register numbers used by the paravirtualized
/// `MRS`/`MSR` encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum El2SysReg {
    ElrEl2 = 0,
    SpsrEl2,
    SpEl2,
    AmairEl2,
    MairEl2,
    TcrEl2,
    Ttbr0El2,
    VtcrEl2,
    VttbrEl2,
    VmpidrEl2,
    VpidrEl2,
    MdcrEl2,
    CnthctlEl2,
    CntvoffEl2,
    ActlrEl2,
    Afsr0El2,
    Afsr1El2,
    CptrEl2,
    EsrEl2,
    FarEl2,
    HacrEl2,
    HcrEl2,
    HpfarEl2,
    HstrEl2,
    RmrEl2,
    RvbarEl2,
    SctlrEl2,
    TpidrEl2,
    VbarEl2,
}

/// Number of [`El2SysReg`] registers.
pub const NR_EL2_SYS_REGS: usize = El2SysReg::VbarEl2 as usize + 1;

impl El2SysReg {
    const ALL: [Self; NR_EL2_SYS_REGS] = [
        Self::ElrEl2,
        Self::SpsrEl2,
        Self::SpEl2,
        Self::AmairEl2,
        Self::MairEl2,
        Self::TcrEl2,
        Self::Ttbr0El2,
        Self::VtcrEl2,
        Self::VttbrEl2,
        Self::VmpidrEl2,
        Self::VpidrEl2,
        Self::MdcrEl2,
        Self::CnthctlEl2,
        Self::CntvoffEl2,
        Self::ActlrEl2,
        Self::Afsr0El2,
        Self::Afsr1El2,
        Self::CptrEl2,
        Self::EsrEl2,
        Self::FarEl2,
        Self::HacrEl2,
        Self::HcrEl2,
        Self::HpfarEl2,
        Self::HstrEl2,
        Self::RmrEl2,
        Self::RvbarEl2,
        Self::SctlrEl2,
        Self::TpidrEl2,
        Self::VbarEl2,
    ];

    /// Looks up a register by its number, `None` if there is no such register.
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

/// Backing storage for the [`El2SysReg`] registers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct El2SysRegs([u64; NR_EL2_SYS_REGS]);

impl El2SysRegs {
    pub fn get(&self, reg: El2SysReg) -> u64 {
        self.0[reg as usize]
    }

    pub fn set(&mut self, reg: El2SysReg, val: u64) {
        self.0[reg as usize] = val;
    }
}

/// Guest-visible faults the fault injection port can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// A synthetic undefined-instruction exception.
    UndefinedInstruction,
    /// A virtual SError (asynchronous external abort).
    AsynchronousExternalAbort,
}

/// Faults waiting to be delivered on the next guest entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingFaults {
    pub undefined: bool,
    pub serror: bool,
}

impl PendingFaults {
    pub fn is_pending(&self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::UndefinedInstruction => self.undefined,
            FaultKind::AsynchronousExternalAbort => self.serror,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.undefined && !self.serror
    }
}

/// Exit counters owned by one vcpu.
///
/// Counters of several vcpus are summed by whoever collects them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VCpuStat {
    /// Traps on HVC and SMC instructions.
    pub hvc_exit_stat: u64,
    /// WFE traps, handled by yielding.
    pub wfe_exit_stat: u64,
    /// WFI traps, handled by blocking.
    pub wfi_exit_stat: u64,
}

impl AddAssign for VCpuStat {
    fn add_assign(&mut self, rhs: Self) {
        self.hvc_exit_stat += rhs.hvc_exit_stat;
        self.wfe_exit_stat += rhs.wfe_exit_stat;
        self.wfi_exit_stat += rhs.wfi_exit_stat;
    }
}

impl Sum for VCpuStat {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, stat| {
            acc += stat;
            acc
        })
    }
}

impl<'a> Sum<&'a VCpuStat> for VCpuStat {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Requests that other threads can raise against a vcpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum VCpuRequest {
    /// The vcpu should leave the halted state.
    Unhalt = 0,
}

impl VCpuRequest {
    const fn mask(self) -> u32 {
        1 << self as u32
    }
}

/// A request word shared between a vcpu and the threads that wake it.
///
/// Cloning yields another handle to the same word.
#[derive(Clone, Debug, Default)]
pub struct VCpuRequests(Arc<AtomicU32>);

impl VCpuRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises `req`.
    pub fn make(&self, req: VCpuRequest) {
        self.0.fetch_or(req.mask(), Ordering::Release);
    }

    /// Whether `req` is raised.
    pub fn check(&self, req: VCpuRequest) -> bool {
        self.0.load(Ordering::Acquire) & req.mask() != 0
    }

    pub fn clear(&self, req: VCpuRequest) {
        self.0.fetch_and(!req.mask(), Ordering::AcqRel);
    }

    /// Clears `req`, returning whether it was raised.
    pub fn test_and_clear(&self, req: VCpuRequest) -> bool {
        self.0.fetch_and(!req.mask(), Ordering::AcqRel) & req.mask() != 0
    }
}

/// The scheduling state of a vcpu while one of its exits is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state, entered after a failed transition.
    Invalid = 0,
    /// The vcpu owns its physical CPU and is handling an exit.
    Running = 1,
    /// The vcpu is waiting for an interrupt.
    Blocked = 2,
}

/// The per-guest-core state the exit handlers work on.
///
/// The context is owned exclusively by the thread handling the exit; only
/// the [`VCpuRequests`] word is shared.
#[derive(Debug)]
pub struct VCpuContext {
    id: usize,
    config: VCpuConfig,
    state: VCpuState,
    gprs: [u64; NR_GPRS],
    pc: u64,
    pstate: u64,
    el2_sys_regs: El2SysRegs,
    pending_faults: PendingFaults,
    /// An exclusive access (`LDXR`/`STXR` pair) is in flight.
    exclusive_monitor: bool,
    stat: VCpuStat,
    requests: VCpuRequests,
}

impl VCpuContext {
    /// Creates a running vcpu in EL1h with all registers cleared.
    pub fn new(id: usize, config: VCpuConfig) -> Self {
        Self {
            id,
            config,
            state: VCpuState::Running,
            gprs: [0; NR_GPRS],
            pc: 0,
            pstate: PSR_MODE_EL1H,
            el2_sys_regs: El2SysRegs::default(),
            pending_faults: PendingFaults::default(),
            exclusive_monitor: false,
            stat: VCpuStat::default(),
            requests: VCpuRequests::new(),
        }
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub const fn config(&self) -> &VCpuConfig {
        &self.config
    }

    pub fn state(&self) -> VCpuState {
        self.state
    }

    /// Transition the state of the vcpu. If the current state is not `from`,
    /// the vcpu becomes [`VCpuState::Invalid`] and an error is returned.
    pub fn transition_state(&mut self, from: VCpuState, to: VCpuState) -> AxResult {
        if self.state != from {
            let current = self.state;
            self.state = VCpuState::Invalid;
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, current)
            )
        } else {
            self.state = to;
            Ok(())
        }
    }

    /// Reads `x<reg>`. Register 31 reads as zero.
    pub fn gpr(&self, reg: usize) -> u64 {
        self.gprs.get(reg).copied().unwrap_or(0)
    }

    /// Writes `x<reg>`. Writes to register 31 are ignored.
    pub fn set_gpr(&mut self, reg: usize, val: u64) {
        if let Some(slot) = self.gprs.get_mut(reg) {
            *slot = val;
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    pub fn pstate(&self) -> u64 {
        self.pstate
    }

    pub fn set_pstate(&mut self, pstate: u64) {
        self.pstate = pstate;
    }

    /// The `M[3:0]` mode field of PSTATE.
    pub fn mode(&self) -> u64 {
        self.pstate & PSR_MODE_MASK
    }

    pub fn is_aarch32(&self) -> bool {
        self.pstate & PSR_MODE32_BIT != 0
    }

    pub fn mode_el2(&self) -> bool {
        !self.is_aarch32() && matches!(self.mode(), PSR_MODE_EL2T | PSR_MODE_EL2H)
    }

    pub fn mode_el1(&self) -> bool {
        !self.is_aarch32() && matches!(self.mode(), PSR_MODE_EL1T | PSR_MODE_EL1H)
    }

    pub fn sys_reg(&self, reg: El2SysReg) -> u64 {
        self.el2_sys_regs.get(reg)
    }

    pub fn set_sys_reg(&mut self, reg: El2SysReg, val: u64) {
        self.el2_sys_regs.set(reg, val);
    }

    pub fn nested_virt_in_use(&self) -> bool {
        self.config.nested_virt
    }

    /// Virtual `HCR_EL2.E2H`: the guest hypervisor runs as a VHE host.
    pub fn el2_e2h_is_set(&self) -> bool {
        self.sys_reg(El2SysReg::HcrEl2) & HCR_E2H != 0
    }

    /// Virtual `HCR_EL2.TGE`: exceptions are routed to the virtual EL2.
    pub fn el2_tge_is_set(&self) -> bool {
        self.sys_reg(El2SysReg::HcrEl2) & HCR_TGE != 0
    }

    pub fn pending_faults(&self) -> PendingFaults {
        self.pending_faults
    }

    /// Marks `kind` pending for the next guest entry. The PC is untouched.
    pub fn pend_fault(&mut self, kind: FaultKind) {
        match kind {
            FaultKind::UndefinedInstruction => self.pending_faults.undefined = true,
            FaultKind::AsynchronousExternalAbort => self.pending_faults.serror = true,
        }
    }

    /// Takes the pending faults, leaving none behind.
    pub fn take_pending_faults(&mut self) -> PendingFaults {
        core::mem::take(&mut self.pending_faults)
    }

    pub fn exclusive_monitor(&self) -> bool {
        self.exclusive_monitor
    }

    pub fn set_exclusive_monitor(&mut self, open: bool) {
        self.exclusive_monitor = open;
    }

    pub fn stat(&self) -> &VCpuStat {
        &self.stat
    }

    pub(crate) fn stat_mut(&mut self) -> &mut VCpuStat {
        &mut self.stat
    }

    /// The request word of this vcpu. Clone it to hand it to other threads.
    pub fn requests(&self) -> &VCpuRequests {
        &self.requests
    }
}
