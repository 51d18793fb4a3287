//! Exception objects thrown by this crate, and the per-thread bookkeeping of
//! the exceptions being handled.
//!
//! A thrown value lives in a single allocation behind an
//! [`ExceptionHeader`], whose last field is the [`_Unwind_Exception`] handed
//! to the unwinder. Rethrowing creates a dependent exception: a header of its
//! own that shares the payload of the primary one by reference count.

use alloc::{
    alloc::{alloc, dealloc, handle_alloc_error, Layout},
    vec::Vec,
};
use core::{
    any::TypeId,
    mem::{self, offset_of},
};

use crate::{
    stdext,
    uw::{_Unwind_DeleteException, _Unwind_Exception, _Unwind_Reason_Code, _URC_FOREIGN_EXCEPTION_CAUGHT},
};

pub const STEPWIND_EXCEPTION_CLASS: u64 = u64::from_be_bytes(*b"STWNRUST");
pub const STEPWIND_DEPENDENT_EXCEPTION_CLASS: u64 = u64::from_be_bytes(*b"STWNRUS\x01");

/// Whether an exception was thrown by us. The last byte of the class
/// distinguishes primary and dependent exceptions.
pub fn is_native(class: u64) -> bool {
    class >> 8 == STEPWIND_EXCEPTION_CLASS >> 8
}

pub type TerminateHandler = fn() -> !;
pub type UnexpectedHandler = fn();

fn default_terminate() -> ! {
    error!("terminating");
    stdext::abort()
}

fn default_unexpected() {
    default_terminate()
}

#[repr(C)]
struct ExceptionHeader {
    block: *mut u8,
    layout: Layout,
    type_id: TypeId,
    drop_payload: unsafe fn(*mut u8),
    /// The exception whose payload a dependent exception shares, null for
    /// primary exceptions.
    primary: *mut ExceptionHeader,
    handler_count: usize,
    reference_count: usize,
    terminate_handler: TerminateHandler,
    unexpected_handler: UnexpectedHandler,
    unwind: _Unwind_Exception,
}

unsafe fn drop_payload<T>(payload: *mut u8) {
    // SAFETY: the header of a `T` payload passes it here exactly once.
    unsafe { payload.cast::<T>().drop_in_place() }
}

unsafe fn header_of(exception: *mut _Unwind_Exception) -> *mut ExceptionHeader {
    // SAFETY: native exceptions are always the tail of a header.
    unsafe { exception.byte_sub(offset_of!(ExceptionHeader, unwind)).cast() }
}

unsafe fn primary_of(header: *mut ExceptionHeader) -> *mut ExceptionHeader {
    // SAFETY: the caller passes a live header.
    let primary = unsafe { (*header).primary };
    if primary.is_null() {
        header
    } else {
        primary
    }
}

/// The payload directly follows the header of a primary exception.
unsafe fn payload_of(primary: *mut ExceptionHeader) -> *mut u8 {
    // SAFETY: see `allocate`.
    unsafe { primary.add(1).cast() }
}

/// Drops a reference. The last one destroys the payload and frees the
/// allocation; a dependent exception holds one reference to its primary.
unsafe fn release(header: *mut ExceptionHeader) {
    // SAFETY: the caller owns one of the header's references.
    unsafe {
        let Some(remaining) = (*header).reference_count.checked_sub(1) else {
            error!(?header, "exception released more often than referenced");
            stdext::abort()
        };
        (*header).reference_count = remaining;
        if remaining > 0 {
            return;
        }
        let primary = (*header).primary;
        if primary.is_null() {
            trace!(?header, "destroying payload");
            ((*header).drop_payload)(payload_of(header));
        }
        dealloc((*header).block, (*header).layout);
        if !primary.is_null() {
            release(primary);
        }
    }
}

unsafe extern "C" fn cleanup(reason: _Unwind_Reason_Code, exception: *mut _Unwind_Exception) {
    // SAFETY: only installed on headers we allocated.
    let header = unsafe { header_of(exception) };
    if reason != _URC_FOREIGN_EXCEPTION_CAUGHT {
        // SAFETY: as above.
        unsafe { ((*header).terminate_handler)() }
    }
    // SAFETY: the foreign runtime hands back the reference the raise held.
    unsafe { release(header) }
}

/// Allocates a primary exception holding `payload`.
fn allocate<T: 'static>(
    payload: T,
    terminate_handler: TerminateHandler,
    unexpected_handler: UnexpectedHandler,
) -> *mut _Unwind_Exception {
    let header_size = mem::size_of::<ExceptionHeader>();
    let payload_offset = header_size.next_multiple_of(mem::align_of::<T>());
    let align = mem::align_of::<ExceptionHeader>().max(mem::align_of::<T>());
    let Ok(layout) = Layout::from_size_align(payload_offset + mem::size_of::<T>(), align) else {
        default_terminate()
    };
    // SAFETY: the layout has a non-zero size, it contains the header.
    let block = unsafe { alloc(layout) };
    if block.is_null() {
        handle_alloc_error(layout);
    }
    // SAFETY: `payload_offset - header_size` is a multiple of the header's
    // alignment, both sizes being multiples of it or of a larger power of two.
    unsafe {
        let header = block.add(payload_offset - header_size).cast::<ExceptionHeader>();
        header.write(ExceptionHeader {
            block,
            layout,
            type_id: TypeId::of::<T>(),
            drop_payload: drop_payload::<T>,
            primary: core::ptr::null_mut(),
            handler_count: 0,
            reference_count: 1,
            terminate_handler,
            unexpected_handler,
            unwind: _Unwind_Exception::new(STEPWIND_EXCEPTION_CLASS, Some(cleanup)),
        });
        payload_of(header).cast::<T>().write(payload);
        debug!(?header, payload = core::any::type_name::<T>(), "allocated exception");
        &mut (*header).unwind
    }
}

/// Allocates a dependent exception sharing the payload of `primary`.
unsafe fn allocate_dependent(primary: *mut ExceptionHeader) -> *mut _Unwind_Exception {
    let layout = Layout::new::<ExceptionHeader>();
    // SAFETY: the header has a non-zero size.
    let block = unsafe { alloc(layout) };
    if block.is_null() {
        handle_alloc_error(layout);
    }
    // SAFETY: `block` fits a header, `primary` is live.
    unsafe {
        (*primary).reference_count += 1;
        let header = block.cast::<ExceptionHeader>();
        header.write(ExceptionHeader {
            block,
            layout,
            type_id: (*primary).type_id,
            drop_payload: (*primary).drop_payload,
            primary,
            handler_count: 0,
            reference_count: 1,
            terminate_handler: (*primary).terminate_handler,
            unexpected_handler: (*primary).unexpected_handler,
            unwind: _Unwind_Exception::new(STEPWIND_DEPENDENT_EXCEPTION_CLASS, Some(cleanup)),
        });
        &mut (*header).unwind
    }
}

/// The payload of a native exception, if it is a `T`.
///
/// # Safety
/// `exception` must point to a live exception.
pub unsafe fn downcast_ref<'a, T: 'static>(exception: *mut _Unwind_Exception) -> Option<&'a T> {
    // SAFETY: forwarded from our caller.
    unsafe {
        if !is_native((*exception).exception_class) {
            return None;
        }
        let primary = primary_of(header_of(exception));
        if (*primary).type_id != TypeId::of::<T>() {
            return None;
        }
        Some(&*payload_of(primary).cast::<T>())
    }
}

/// The number of exceptions sharing the payload of a native exception.
///
/// # Safety
/// `exception` must point to a live exception.
pub unsafe fn reference_count(exception: *mut _Unwind_Exception) -> Option<usize> {
    // SAFETY: forwarded from our caller.
    unsafe {
        is_native((*exception).exception_class)
            .then(|| (*primary_of(header_of(exception))).reference_count)
    }
}

/// The exceptions a thread is throwing and handling.
#[derive(Debug)]
pub struct ExceptionGlobals {
    /// Innermost last.
    caught: Vec<*mut _Unwind_Exception>,
    uncaught: usize,
    terminate_handler: TerminateHandler,
    unexpected_handler: UnexpectedHandler,
}

impl Default for ExceptionGlobals {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionGlobals {
    pub fn new() -> Self {
        Self {
            caught: Vec::new(),
            uncaught: 0,
            terminate_handler: default_terminate,
            unexpected_handler: default_unexpected,
        }
    }

    /// Sets the handler for exceptions thrown from now on and for failures
    /// outside of any exception, returning the previous one.
    pub fn set_terminate_handler(&mut self, handler: TerminateHandler) -> TerminateHandler {
        mem::replace(&mut self.terminate_handler, handler)
    }

    pub fn set_unexpected_handler(&mut self, handler: UnexpectedHandler) -> UnexpectedHandler {
        mem::replace(&mut self.unexpected_handler, handler)
    }

    /// Exceptions thrown but not caught yet.
    pub fn uncaught_exceptions(&self) -> usize {
        self.uncaught
    }

    /// The innermost exception being handled.
    pub fn current_exception(&self) -> Option<*mut _Unwind_Exception> {
        self.caught.last().copied()
    }

    /// Allocates the exception for `payload` and counts it as uncaught. Pass
    /// the result to `_Unwind_RaiseException`, and to
    /// [`ExceptionGlobals::throw_failed`] if that returns.
    pub fn begin_throw<T: 'static>(&mut self, payload: T) -> *mut _Unwind_Exception {
        let exception = allocate(payload, self.terminate_handler, self.unexpected_handler);
        self.uncaught += 1;
        exception
    }

    /// The raise of `exception` returned `reason`: nobody caught it.
    ///
    /// # Safety
    /// `exception` must be the live exception that failed to raise.
    pub unsafe fn throw_failed(&mut self, exception: *mut _Unwind_Exception, reason: _Unwind_Reason_Code) -> ! {
        warn!(?exception, ?reason, "exception escaped");
        // SAFETY: forwarded from our caller.
        unsafe { self.begin_catch(exception) };
        self.terminate()
    }

    /// Enters a handler for `exception`. Returns the payload of native
    /// exceptions and the exception itself for foreign ones.
    ///
    /// # Safety
    /// `exception` must point to a live exception that was raised.
    pub unsafe fn begin_catch(&mut self, exception: *mut _Unwind_Exception) -> *mut u8 {
        // SAFETY: forwarded from our caller.
        let class = unsafe { (*exception).exception_class };
        if !is_native(class) {
            if !self.caught.is_empty() {
                warn!(?exception, "nested foreign exception");
                self.terminate();
            }
            self.caught.push(exception);
            return exception.cast();
        }

        // SAFETY: native exceptions are ours.
        let header = unsafe { header_of(exception) };
        unsafe { (*header).handler_count += 1 };
        if self.caught.last() != Some(&exception) {
            self.caught.push(exception);
        }
        self.uncaught = self.uncaught.saturating_sub(1);
        // SAFETY: as above.
        unsafe { payload_of(primary_of(header)) }
    }

    /// Leaves the innermost handler. Leaving the last handler of an exception
    /// destroys it, unless a rethrow still refers to its payload.
    pub fn end_catch(&mut self) {
        let Some(&exception) = self.caught.last() else {
            return;
        };
        // SAFETY: exceptions on the caught stack are live until popped here.
        unsafe {
            if !is_native((*exception).exception_class) {
                self.caught.pop();
                _Unwind_DeleteException(exception);
                return;
            }
            let header = header_of(exception);
            (*header).handler_count -= 1;
            if (*header).handler_count == 0 {
                self.caught.pop();
                release(header);
            }
        }
    }

    /// Rethrows the innermost exception being handled. Native exceptions are
    /// rethrown as a new dependent exception; raise the result like a thrown
    /// one.
    pub fn begin_rethrow(&mut self) -> *mut _Unwind_Exception {
        let Some(&exception) = self.caught.last() else {
            warn!("rethrow without an exception");
            self.terminate()
        };
        self.uncaught += 1;
        // SAFETY: exceptions on the caught stack are live.
        unsafe {
            if !is_native((*exception).exception_class) {
                self.caught.pop();
                return exception;
            }
            allocate_dependent(primary_of(header_of(exception)))
        }
    }

    /// Calls the terminate handler of the exception being handled, or the
    /// thread's.
    pub fn terminate(&self) -> ! {
        let handler = match self.current_exception() {
            // SAFETY: exceptions on the caught stack are live.
            Some(exception) if unsafe { is_native((*exception).exception_class) } => unsafe {
                (*header_of(exception)).terminate_handler
            },
            _ => self.terminate_handler,
        };
        handler()
    }

    /// Calls the unexpected handler, and terminates if it returns.
    pub fn unexpected(&self) -> ! {
        let handler = match self.current_exception() {
            // SAFETY: exceptions on the caught stack are live.
            Some(exception) if unsafe { is_native((*exception).exception_class) } => unsafe {
                (*header_of(exception)).unexpected_handler
            },
            _ => self.unexpected_handler,
        };
        handler();
        self.terminate()
    }
}

/// The calling thread's exception globals. Must not be entered again from
/// `f`, and `f` must not raise.
#[cfg(feature = "std")]
pub fn with_thread_globals<R>(f: impl FnOnce(&mut ExceptionGlobals) -> R) -> R {
    use std::cell::RefCell;

    std::thread_local! {
        static GLOBALS: RefCell<ExceptionGlobals> = RefCell::new(ExceptionGlobals::new());
    }
    GLOBALS.with(|globals| f(&mut globals.borrow_mut()))
}

/// Throws `payload` on the current thread. Terminates if nothing catches it.
#[cfg(all(feature = "std", target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
pub fn throw<T: 'static>(payload: T) -> ! {
    let exception = with_thread_globals(|globals| globals.begin_throw(payload));
    // SAFETY: a fresh exception, owned by the unwinder from here on.
    let reason = unsafe { crate::native::_Unwind_RaiseException(exception) };
    // SAFETY: raising returned, so the exception is still ours.
    with_thread_globals(|globals| unsafe { globals.throw_failed(exception, reason) })
}

/// Rethrows the exception being handled on the current thread.
#[cfg(all(feature = "std", target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
pub fn rethrow() -> ! {
    let exception = with_thread_globals(|globals| globals.begin_rethrow());
    // SAFETY: the rethrown exception is owned by the unwinder from here on.
    let reason = unsafe { crate::native::_Unwind_Resume_or_Rethrow(exception) };
    // SAFETY: raising returned, so the exception is still ours.
    with_thread_globals(|globals| unsafe { globals.throw_failed(exception, reason) })
}
