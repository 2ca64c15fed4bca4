// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxTrap - AArch64 guest exit dispatch for ArceOS hypervisors.
//!
//! This crate runs right after a guest has exited to EL2. It decodes why the
//! guest exited and decides what happens next: resume the guest, emulate a
//! privileged operation and resume, forward the trap to the guest's own
//! (nested) hypervisor, or report the exit to the managing process.
//!
//! Everything around it (the world switch, PSCI, system register and abort
//! emulation, scheduling) is reached through the [`AxTrapHal`] and
//! [`AxArchVCpu`] traits.
//!
//! # Features
//!
//! - Exit classification with SError injection and HVC/SMC replay
//! - Exception class dispatch through a table built at compile time
//! - HVC/SMC, WFI/WFE, debug, FP/ASIMD and ERET handlers
//! - Nested virtualization: trap forwarding to the virtual EL2, ERET
//!   emulation and paravirtualized EL2 instructions (`nested-pv`)
//! - Per-vcpu exit statistics

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;

// Core modules
mod arch_vcpu; // World switch trait
mod dispatch; // Top-level exit handling and the run loop
mod emulate; // Instruction skip and condition check
mod esr; // Exit code and syndrome decoding
mod exit; // Exit records and outcomes
mod hal; // Interfaces implemented by the surrounding hypervisor
mod handlers; // Exception class handlers
mod nested; // Forwarding to the virtual EL2
mod pv; // Paravirtualized EL2 instructions
mod vcpu; // Vcpu context

// Public API exports
pub use arch_vcpu::AxArchVCpu;
pub use dispatch::{handle_exit, run_vcpu};
pub use emulate::{
    condition_holds, condition_valid, skip_instr, PSR_AA32_IT_MASK, PSR_AA32_T_BIT,
};
pub use esr::*;
pub use exit::{AxTrapExitReason, ExitOutcome, ExitRecord};
pub use hal::AxTrapHal;
pub use handlers::{exit_handler_for, ExitHandler};
pub use nested::{
    forward_nv_traps, handle_wfx_nested, inject_nested_sync, should_forward_to_nested, NestedTrap,
};
pub use pv::{handle_hvc_nested, PvInstr};
pub use vcpu::*;
