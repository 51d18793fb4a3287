//! A stack unwinder: DWARF call frame information and Apple compact unwind
//! decoding, a frame stepper, and the Itanium two-phase exception protocol on
//! top of it.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

mod stdext;

pub mod addr_space;
pub mod compact;
pub mod cursor;
pub mod dwarf;
pub mod exception;
pub mod phase;
pub mod registers;
pub mod sjlj;
pub mod step;
pub mod uw;

#[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
mod arch;
#[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
pub mod native;

pub use addr_space::{AddressSpace, LocalAddressSpace, MemoryError, Snapshot};
pub use cursor::{Cursor, FindUnwindSections, ProcInfo, StaticSections, StepResult, UnwindSections};
pub use registers::{AArch64, Arch, Ppc64, Register, Registers, Sparc64, X86_64};
pub use step::{step, StepError, StepFailure, StepOutcome, UnwindInfoLocation};

/// The registers of the caller, at the point of the call.
#[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
#[inline(always)]
pub fn current_registers() -> Registers<X86_64> {
    arch::capture_context()
}
