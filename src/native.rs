//! Unwinding the running thread.
//!
//! The entry points capture the registers of their own frame, walk outward
//! from it through the unwind tables of the loaded objects and, if a frame
//! takes over, jump into it. With the `export-symbols` feature they replace
//! the system unwinder.
#![allow(nonstandard_style)]

use core::ffi::c_void;

use crate::{
    addr_space::LocalAddressSpace,
    arch,
    dwarf::divination::DlFindObject,
    phase::{RegisterWalker, TwoPhase},
    registers::{Registers, X86_64},
    stdext,
    uw::*,
};

type LocalUnwinder = TwoPhase<RegisterWalker<X86_64, LocalAddressSpace, DlFindObject>>;

fn local_unwinder(registers: Registers<X86_64>) -> LocalUnwinder {
    TwoPhase::new(RegisterWalker::new(
        LocalAddressSpace::new(),
        DlFindObject,
        registers,
    ))
}

/// Jumps to the landing pad if the unwinder installed one, returns `reason`
/// otherwise. No span may be entered here, it would never be exited.
fn land(unwinder: LocalUnwinder, reason: _Unwind_Reason_Code) -> _Unwind_Reason_Code {
    if reason == _URC_INSTALL_CONTEXT {
        match unwinder.into_walker().into_landing() {
            // SAFETY: the landing frame is an outer frame of this thread,
            // still live below us.
            Some(registers) => unsafe { arch::restore_context(&registers) },
            None => return _URC_FATAL_PHASE2_ERROR,
        }
    }
    reason
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C-unwind" fn _Unwind_RaiseException(
    exception_object: *mut _Unwind_Exception,
) -> _Unwind_Reason_Code {
    let mut unwinder = local_unwinder(arch::capture_context());
    let reason = info_span!("_Unwind_RaiseException", ?exception_object)
        // SAFETY: forwarded from our caller.
        .in_scope(|| unsafe { unwinder.raise(exception_object) });
    land(unwinder, reason)
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C-unwind" fn _Unwind_Resume(exception_object: *mut _Unwind_Exception) -> ! {
    let mut unwinder = local_unwinder(arch::capture_context());
    let reason = info_span!("_Unwind_Resume", ?exception_object)
        // SAFETY: forwarded from our caller.
        .in_scope(|| unsafe { unwinder.resume(exception_object) });
    let reason = land(unwinder, reason);
    error!(?reason, "_Unwind_Resume can't return");
    stdext::abort()
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C-unwind" fn _Unwind_ForcedUnwind(
    exception_object: *mut _Unwind_Exception,
    stop: _Unwind_Stop_Fn,
    stop_parameter: *mut c_void,
) -> _Unwind_Reason_Code {
    let mut unwinder = local_unwinder(arch::capture_context());
    let reason = info_span!("_Unwind_ForcedUnwind", ?exception_object)
        // SAFETY: forwarded from our caller.
        .in_scope(|| unsafe { unwinder.forced(exception_object, stop, stop_parameter) });
    land(unwinder, reason)
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C-unwind" fn _Unwind_Resume_or_Rethrow(
    exception_object: *mut _Unwind_Exception,
) -> _Unwind_Reason_Code {
    let mut unwinder = local_unwinder(arch::capture_context());
    let reason = info_span!("_Unwind_Resume_or_Rethrow", ?exception_object)
        // SAFETY: forwarded from our caller.
        .in_scope(|| unsafe { unwinder.resume_or_rethrow(exception_object) });
    land(unwinder, reason)
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C-unwind" fn _Unwind_Backtrace(
    trace: _Unwind_Trace_Fn,
    trace_argument: *mut c_void,
) -> _Unwind_Reason_Code {
    let _span = info_span!("_Unwind_Backtrace").entered();
    let mut unwinder = local_unwinder(arch::capture_context());
    // SAFETY: forwarded from our caller.
    unsafe { unwinder.backtrace(trace, trace_argument) }
}
