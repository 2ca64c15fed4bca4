use axerrno::AxResult;

use crate::exit::ExitRecord;
use crate::vcpu::VCpuContext;

#[allow(unused_imports)] // used in doc
use crate::run_vcpu;

/// The world switch: the architecture layer that enters the guest.
///
/// This trait isolates the register save/restore sequences and the physical
/// interrupt handling from the exit handlers. It is driven by [`run_vcpu`].
pub trait AxArchVCpu {
    /// Loads `vcpu` into the hardware, runs the guest until it exits and
    /// saves the guest state back into `vcpu`.
    ///
    /// Faults pending in `vcpu` are delivered on entry. A physical interrupt
    /// that caused the exit has already been serviced when this returns.
    fn run(&mut self, vcpu: &mut VCpuContext) -> AxResult<ExitRecord>;
}
