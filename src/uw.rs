//! The Itanium C++ ABI unwinding interface.
#![allow(nonstandard_style)] // Closely follow the ABI here

use core::ffi::{c_int, c_void};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum _Unwind_Reason_Code {
    _URC_NO_REASON = 0,
    /// This indicates that a different runtime caught this exception.
    /// Nested foreign exceptions, or re-throwing a foreign exception, result in
    /// undefined behavior.
    _URC_FOREIGN_EXCEPTION_CAUGHT = 1,
    /// The personality routine encountered an error during phase 2, for instance a stack corruption.
    _URC_FATAL_PHASE2_ERROR = 2,
    /// The personality routine encountered an error during phase 1, other than the specific error codes defined.
    _URC_FATAL_PHASE1_ERROR = 3,
    _URC_NORMAL_STOP = 4,
    /// The unwinder encountered the end of the stack during phase 1, without finding a handler.
    /// The unwind runtime will not have modified the stack.
    /// The C++ runtime will normally call uncaught_exception() in this case
    _URC_END_OF_STACK = 5,
    _URC_HANDLER_FOUND = 6,
    _URC_INSTALL_CONTEXT = 7,
    _URC_CONTINUE_UNWIND = 8,
}

pub use _Unwind_Reason_Code::*;

/// The header every language runtime puts in front of its exception payload.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct _Unwind_Exception {
    pub exception_class: u64,
    pub exception_cleanup: _Unwind_Exception_Cleanup_Fn,
    /// The stop function of a forced unwind, 0 otherwise.
    pub private_1: usize,
    /// The handler frame found in phase 1, or the stop argument.
    pub private_2: usize,
}

impl _Unwind_Exception {
    pub const fn new(exception_class: u64, exception_cleanup: _Unwind_Exception_Cleanup_Fn) -> Self {
        Self {
            exception_class,
            exception_cleanup,
            private_1: 0,
            private_2: 0,
        }
    }
}

pub type _Unwind_Exception_Cleanup_Fn =
    Option<unsafe extern "C" fn(reason: _Unwind_Reason_Code, exc: *mut _Unwind_Exception)>;

pub type _Unwind_Action = c_int;

pub const _UA_SEARCH_PHASE: _Unwind_Action = 1;
pub const _UA_CLEANUP_PHASE: _Unwind_Action = 2;
pub const _UA_HANDLER_FRAME: _Unwind_Action = 4;
pub const _UA_FORCE_UNWIND: _Unwind_Action = 8;
pub const _UA_END_OF_STACK: _Unwind_Action = 16;

pub type PersonalityRoutine = unsafe extern "C" fn(
    version: c_int,
    actions: _Unwind_Action,
    exceptionClass: u64,
    exception_object: *mut _Unwind_Exception,
    context: *mut _Unwind_Context,
) -> _Unwind_Reason_Code;

pub type _Unwind_Stop_Fn = unsafe extern "C" fn(
    version: c_int,
    actions: _Unwind_Action,
    exceptionClass: u64,
    exception_object: *mut _Unwind_Exception,
    context: *mut _Unwind_Context,
    stop_argument: *mut c_void,
) -> _Unwind_Reason_Code;

pub type _Unwind_Trace_Fn =
    unsafe extern "C" fn(context: *mut _Unwind_Context, arg: *mut c_void) -> _Unwind_Reason_Code;

/// General purpose registers visible to personality routines.
pub const CONTEXT_REGISTERS: usize = 64;

/// The _Unwind_Context type is an opaque type used to refer to a system-specific data structure used by the system unwinder.
/// This context is created and destroyed by the system, and passed to the personality routine during unwinding
///
/// Ours is a snapshot of one frame. Writes through `_Unwind_SetGR` and
/// `_Unwind_SetIP` are recorded and applied by the walker when the frame is
/// installed.
#[derive(Debug, Clone)]
pub struct _Unwind_Context {
    pub(crate) ip: usize,
    pub(crate) cfa: usize,
    pub(crate) lsda: usize,
    pub(crate) region_start: usize,
    pub(crate) args_size: u64,
    pub(crate) signal_frame: bool,
    pub(crate) registers: [usize; CONTEXT_REGISTERS],
    /// Registers that exist in this frame.
    pub(crate) valid: u64,
    /// Registers written by the personality.
    pub(crate) dirty: u64,
    pub(crate) ip_dirty: bool,
}

impl Default for _Unwind_Context {
    fn default() -> Self {
        Self {
            ip: 0,
            cfa: 0,
            lsda: 0,
            region_start: 0,
            args_size: 0,
            signal_frame: false,
            registers: [0; CONTEXT_REGISTERS],
            valid: 0,
            dirty: 0,
            ip_dirty: false,
        }
    }
}

impl _Unwind_Context {
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn cfa(&self) -> usize {
        self.cfa
    }

    pub fn lsda(&self) -> usize {
        self.lsda
    }

    pub fn region_start(&self) -> usize {
        self.region_start
    }

    pub fn gr(&self, index: usize) -> Option<usize> {
        (index < CONTEXT_REGISTERS && self.valid & (1 << index) != 0).then(|| self.registers[index])
    }

    pub fn set_gr(&mut self, index: usize, value: usize) -> bool {
        if index >= CONTEXT_REGISTERS || self.valid & (1 << index) == 0 {
            warn!("personality wrote to unknown register {index}");
            return false;
        }
        self.registers[index] = value;
        self.dirty |= 1 << index;
        true
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
        self.ip_dirty = true;
    }

    /// Registers the personality changed, with their new values.
    pub(crate) fn dirty_registers(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..CONTEXT_REGISTERS)
            .filter(|&n| self.dirty & (1 << n) != 0)
            .map(|n| (n, self.registers[n]))
    }
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetGR(context: *mut _Unwind_Context, index: c_int) -> usize {
    // SAFETY: personalities only get pointers to live contexts.
    let context = unsafe { &*context };
    match usize::try_from(index).ok().and_then(|index| context.gr(index)) {
        Some(value) => value,
        None => {
            warn!("_Unwind_GetGR({index}) of an unknown register");
            0
        }
    }
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_SetGR(context: *mut _Unwind_Context, index: c_int, value: usize) {
    // SAFETY: personalities only get pointers to live contexts.
    let context = unsafe { &mut *context };
    if let Ok(index) = usize::try_from(index) {
        context.set_gr(index, value);
    }
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetIP(context: *mut _Unwind_Context) -> usize {
    // SAFETY: personalities only get pointers to live contexts.
    unsafe { (*context).ip }
}

/// Like `_Unwind_GetIP`, and reports whether the ip is exact rather than a
/// return address.
#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetIPInfo(
    context: *mut _Unwind_Context,
    ip_before_insn: *mut c_int,
) -> usize {
    // SAFETY: personalities only get pointers to live contexts.
    let context = unsafe { &*context };
    if !ip_before_insn.is_null() {
        // SAFETY: checked for null, the caller owns the int.
        unsafe { *ip_before_insn = c_int::from(context.signal_frame) };
    }
    context.ip
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_SetIP(context: *mut _Unwind_Context, value: usize) {
    // SAFETY: personalities only get pointers to live contexts.
    unsafe { (*context).set_ip(value) }
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetCFA(context: *mut _Unwind_Context) -> usize {
    // SAFETY: personalities only get pointers to live contexts.
    unsafe { (*context).cfa }
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetLanguageSpecificData(context: *mut _Unwind_Context) -> *mut c_void {
    // SAFETY: personalities only get pointers to live contexts.
    core::ptr::with_exposed_provenance_mut(unsafe { (*context).lsda })
}

#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_GetRegionStart(context: *mut _Unwind_Context) -> usize {
    // SAFETY: personalities only get pointers to live contexts.
    unsafe { (*context).region_start }
}

/// Hands the exception back to the runtime that threw it.
#[cfg_attr(feature = "export-symbols", no_mangle)]
pub unsafe extern "C" fn _Unwind_DeleteException(exception: *mut _Unwind_Exception) {
    debug!(?exception, "deleting exception");
    // SAFETY: the caller passes a live exception it owns.
    if let Some(cleanup) = unsafe { (*exception).exception_cleanup } {
        // SAFETY: the cleanup function belongs to the exception's runtime.
        unsafe { cleanup(_URC_FOREIGN_EXCEPTION_CAUGHT, exception) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_recorded() {
        let mut context = _Unwind_Context {
            ip: 0x4010,
            valid: 0b1011,
            ..Default::default()
        };
        context.registers[1] = 7;
        let ptr = &mut context as *mut _Unwind_Context;

        unsafe {
            assert_eq!(_Unwind_GetGR(ptr, 1), 7);
            assert_eq!(_Unwind_GetGR(ptr, 2), 0);
            _Unwind_SetGR(ptr, 0, 0xe);
            _Unwind_SetGR(ptr, 2, 0xbad);
            _Unwind_SetGR(ptr, -1, 0xbad);
            _Unwind_SetIP(ptr, 0x4080);
            let mut before = -1;
            assert_eq!(_Unwind_GetIPInfo(ptr, &mut before), 0x4080);
            assert_eq!(before, 0);
        }

        assert!(context.ip_dirty);
        assert_eq!(context.dirty_registers().collect::<alloc::vec::Vec<_>>(), [(0, 0xe)]);
    }

    #[test]
    fn delete_runs_the_cleanup() {
        static mut REASON: Option<_Unwind_Reason_Code> = None;
        unsafe extern "C" fn cleanup(reason: _Unwind_Reason_Code, _: *mut _Unwind_Exception) {
            unsafe { REASON = Some(reason) };
        }
        let mut exception = _Unwind_Exception::new(0, Some(cleanup));
        unsafe {
            _Unwind_DeleteException(&mut exception);
            assert_eq!(*core::ptr::addr_of!(REASON), Some(_URC_FOREIGN_EXCEPTION_CAUGHT));
        }
    }
}
