//! Two-phase exception propagation.
//!
//! Phase 1 walks outward asking every personality routine whether its frame
//! handles the exception, without touching the stack. Phase 2 walks the same
//! frames again from the start, letting them run their cleanups, and hands
//! control to the handler frame. How the frames are walked is up to a
//! [`FrameWalker`]: registers restored from unwind info, or the registered
//! function contexts of setjmp/longjmp exceptions.

use core::ffi::c_void;

use crate::{
    addr_space::AddressSpace,
    cursor::{Cursor, FindUnwindSections, StepResult},
    registers::{Arch, Register, RegisterError, Registers},
    sjlj::SjljError,
    step::{StepError, StepFailure},
    uw::{self, *},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Sjlj(#[from] SjljError),
    #[error("personality returned {reason:?} in phase {phase}")]
    Personality {
        phase: u8,
        reason: _Unwind_Reason_Code,
    },
    #[error("phase 2 never reached the handler frame {0:#x}")]
    HandlerLost(usize),
    #[error("stop function returned {0:?}")]
    Stopped(_Unwind_Reason_Code),
}

impl WalkError {
    /// How a failed step is reported, `None` for protocol errors.
    pub fn failure(&self) -> Option<StepFailure> {
        match self {
            WalkError::Step(err) => Some(err.failure()),
            WalkError::Register(_) => Some(StepFailure::BadRegister),
            _ => None,
        }
    }
}

/// Where an unwind is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Searching,
    HandlerFound { frame: usize },
    CleaningUp,
    Complete,
    NoHandler,
    FatalError,
}

/// A frame the walker stopped at.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Identifies the frame across both phases.
    pub id: usize,
    pub personality: Option<PersonalityRoutine>,
}

pub trait FrameWalker {
    /// Goes back to where the exception was raised. The next frame is the
    /// raiser's caller.
    fn rewind(&mut self);

    /// Moves one frame outward, `None` at the end of the stack.
    fn next_frame(&mut self) -> Result<Option<Frame>, WalkError>;

    /// The context of the current frame, as handed to its personality.
    fn context(&mut self) -> &mut _Unwind_Context;

    /// Phase 2 left the current frame behind.
    fn unwound_past(&mut self) -> Result<(), WalkError> {
        Ok(())
    }

    /// Prepares to resume in the current frame with the context the
    /// personality set up.
    fn install(&mut self) -> Result<(), WalkError>;
}

impl<W: FrameWalker + ?Sized> FrameWalker for &mut W {
    fn rewind(&mut self) {
        (**self).rewind()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WalkError> {
        (**self).next_frame()
    }

    fn context(&mut self) -> &mut _Unwind_Context {
        (**self).context()
    }

    fn unwound_past(&mut self) -> Result<(), WalkError> {
        (**self).unwound_past()
    }

    fn install(&mut self) -> Result<(), WalkError> {
        (**self).install()
    }
}

/// The unwind protocol over some [`FrameWalker`].
///
/// Every operation returning `_URC_INSTALL_CONTEXT` has called
/// [`FrameWalker::install`]; the caller is responsible for transferring
/// control.
pub struct TwoPhase<W> {
    walker: W,
    phase: Phase,
    failure: Option<StepFailure>,
}

impl<W: FrameWalker> TwoPhase<W> {
    pub fn new(walker: W) -> Self {
        Self {
            walker,
            phase: Phase::Searching,
            failure: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Why a walk last failed to step past a frame.
    pub fn failure(&self) -> Option<StepFailure> {
        self.failure
    }

    fn fail(&mut self, err: WalkError, what: &str) {
        self.failure = err.failure();
        warn!(%err, failure = ?self.failure, "{what} failed");
        self.phase = Phase::FatalError;
    }

    pub fn walker(&self) -> &W {
        &self.walker
    }

    pub fn into_walker(self) -> W {
        self.walker
    }

    unsafe fn personality(
        &mut self,
        frame: &Frame,
        actions: _Unwind_Action,
        exception: *mut _Unwind_Exception,
    ) -> _Unwind_Reason_Code {
        let Some(personality) = frame.personality else {
            return _URC_CONTINUE_UNWIND;
        };
        // SAFETY: the caller passes a live exception.
        let class = unsafe { (*exception).exception_class };
        let context = self.walker.context();
        // SAFETY: the personality is the one the frame's code was compiled with.
        let reason = unsafe { personality(1, actions, class, exception, context) };
        trace!(frame = frame.id, actions, ?reason, "personality");
        reason
    }

    /// Phase 1. Returns the id of the handler frame.
    ///
    /// # Safety
    /// `exception` must point to a live exception.
    #[instrument(level = "debug", skip(self), err)]
    pub unsafe fn search(
        &mut self,
        exception: *mut _Unwind_Exception,
    ) -> Result<Option<usize>, WalkError> {
        self.phase = Phase::Searching;
        self.walker.rewind();
        while let Some(frame) = self.walker.next_frame()? {
            // SAFETY: forwarded from our caller.
            match unsafe { self.personality(&frame, _UA_SEARCH_PHASE, exception) } {
                _URC_HANDLER_FOUND => {
                    debug!(frame = frame.id, "found handler");
                    return Ok(Some(frame.id));
                }
                _URC_CONTINUE_UNWIND => {}
                reason => return Err(WalkError::Personality { phase: 1, reason }),
            }
        }
        Ok(None)
    }

    /// `_Unwind_RaiseException`: search for a handler, then unwind to it.
    ///
    /// # Safety
    /// `exception` must point to a live exception.
    pub unsafe fn raise(&mut self, exception: *mut _Unwind_Exception) -> _Unwind_Reason_Code {
        let _span = debug_span!("raise", ?exception).entered();
        // SAFETY: forwarded from our caller.
        unsafe {
            (*exception).private_1 = 0;
            (*exception).private_2 = 0;
        }
        // SAFETY: forwarded from our caller.
        let handler = match unsafe { self.search(exception) } {
            Ok(Some(handler)) => handler,
            Ok(None) => {
                self.phase = Phase::NoHandler;
                return _URC_END_OF_STACK;
            }
            Err(err) => {
                self.fail(err, "phase 1");
                return _URC_FATAL_PHASE1_ERROR;
            }
        };
        self.phase = Phase::HandlerFound { frame: handler };
        // SAFETY: forwarded from our caller.
        unsafe {
            (*exception).private_2 = handler;
            self.cleanup(exception)
        }
    }

    /// Phase 2 towards the handler frame recorded in `private_2`.
    unsafe fn cleanup(&mut self, exception: *mut _Unwind_Exception) -> _Unwind_Reason_Code {
        // SAFETY: forwarded from our caller.
        let handler = unsafe { (*exception).private_2 };
        self.phase = Phase::CleaningUp;
        self.walker.rewind();
        // SAFETY: forwarded from our caller.
        match unsafe { self.walk_to_handler(exception, handler) } {
            Ok(reason) => reason,
            Err(err) => {
                self.fail(err, "phase 2");
                _URC_FATAL_PHASE2_ERROR
            }
        }
    }

    #[instrument(level = "debug", skip(self, exception), err)]
    unsafe fn walk_to_handler(
        &mut self,
        exception: *mut _Unwind_Exception,
        handler: usize,
    ) -> Result<_Unwind_Reason_Code, WalkError> {
        loop {
            let Some(frame) = self.walker.next_frame()? else {
                return Err(WalkError::HandlerLost(handler));
            };
            let at_handler = frame.id == handler;
            let actions = if at_handler {
                _UA_CLEANUP_PHASE | _UA_HANDLER_FRAME
            } else {
                _UA_CLEANUP_PHASE
            };
            // SAFETY: forwarded from our caller.
            match unsafe { self.personality(&frame, actions, exception) } {
                _URC_CONTINUE_UNWIND if !at_handler => self.walker.unwound_past()?,
                _URC_INSTALL_CONTEXT => {
                    self.walker.install()?;
                    if at_handler {
                        self.phase = Phase::Complete;
                    }
                    return Ok(_URC_INSTALL_CONTEXT);
                }
                reason => return Err(WalkError::Personality { phase: 2, reason }),
            }
        }
    }

    /// `_Unwind_ForcedUnwind`: phase 2 only, all the way to the end of the
    /// stack unless a frame installs itself. `stop` sees every frame before
    /// its personality does.
    ///
    /// # Safety
    /// `exception` must point to a live exception, `stop` must accept
    /// `stop_argument`.
    pub unsafe fn forced(
        &mut self,
        exception: *mut _Unwind_Exception,
        stop: _Unwind_Stop_Fn,
        stop_argument: *mut c_void,
    ) -> _Unwind_Reason_Code {
        let _span = debug_span!("forced", ?exception).entered();
        // SAFETY: forwarded from our caller.
        unsafe {
            (*exception).private_1 = stop as usize;
            (*exception).private_2 = stop_argument.expose_provenance();
            self.walker.rewind();
            self.forced_phase2(exception)
        }
    }

    unsafe fn forced_phase2(&mut self, exception: *mut _Unwind_Exception) -> _Unwind_Reason_Code {
        self.phase = Phase::CleaningUp;
        // SAFETY: forwarded from our caller.
        match unsafe { self.walk_forced(exception) } {
            Ok(reason) => reason,
            Err(err) => {
                self.fail(err, "forced unwind");
                _URC_FATAL_PHASE2_ERROR
            }
        }
    }

    unsafe fn walk_forced(
        &mut self,
        exception: *mut _Unwind_Exception,
    ) -> Result<_Unwind_Reason_Code, WalkError> {
        // SAFETY: `forced` stored the stop function and its argument.
        let (class, stop, argument) = unsafe {
            (
                (*exception).exception_class,
                core::mem::transmute::<usize, _Unwind_Stop_Fn>((*exception).private_1),
                core::ptr::with_exposed_provenance_mut::<c_void>((*exception).private_2),
            )
        };
        let actions = _UA_FORCE_UNWIND | _UA_CLEANUP_PHASE;
        loop {
            let Some(frame) = self.walker.next_frame()? else {
                let context = self.walker.context();
                // SAFETY: the stop function was handed to us for this exception.
                unsafe { stop(1, actions | _UA_END_OF_STACK, class, exception, context, argument) };
                self.phase = Phase::Complete;
                return Ok(_URC_END_OF_STACK);
            };
            let context = self.walker.context();
            // SAFETY: as above.
            let reason = unsafe { stop(1, actions, class, exception, context, argument) };
            if reason != _URC_NO_REASON {
                return Err(WalkError::Stopped(reason));
            }
            // SAFETY: forwarded from our caller.
            match unsafe { self.personality(&frame, actions, exception) } {
                _URC_CONTINUE_UNWIND => self.walker.unwound_past()?,
                _URC_INSTALL_CONTEXT => {
                    self.walker.install()?;
                    return Ok(_URC_INSTALL_CONTEXT);
                }
                reason => return Err(WalkError::Personality { phase: 2, reason }),
            }
        }
    }

    /// `_Unwind_Resume`: continues phase 2 after a cleanup landing pad.
    ///
    /// # Safety
    /// `exception` must point to a live exception that went through
    /// [`TwoPhase::raise`] or [`TwoPhase::forced`].
    pub unsafe fn resume(&mut self, exception: *mut _Unwind_Exception) -> _Unwind_Reason_Code {
        let _span = debug_span!("resume", ?exception).entered();
        // SAFETY: forwarded from our caller.
        unsafe {
            if (*exception).private_1 != 0 {
                self.walker.rewind();
                self.forced_phase2(exception)
            } else {
                self.cleanup(exception)
            }
        }
    }

    /// `_Unwind_Resume_or_Rethrow`: a fresh raise unless the exception is
    /// being force-unwound.
    ///
    /// # Safety
    /// `exception` must point to a live exception.
    pub unsafe fn resume_or_rethrow(
        &mut self,
        exception: *mut _Unwind_Exception,
    ) -> _Unwind_Reason_Code {
        // SAFETY: forwarded from our caller.
        unsafe {
            if (*exception).private_1 == 0 {
                self.raise(exception)
            } else {
                self.resume(exception)
            }
        }
    }

    /// `_Unwind_Backtrace`: calls `trace` for every frame until it returns
    /// something other than `_URC_NO_REASON`.
    ///
    /// # Safety
    /// `trace` must accept `argument`.
    pub unsafe fn backtrace(
        &mut self,
        trace: _Unwind_Trace_Fn,
        argument: *mut c_void,
    ) -> _Unwind_Reason_Code {
        self.walker.rewind();
        loop {
            match self.walker.next_frame() {
                Ok(Some(_)) => {}
                Ok(None) => return _URC_END_OF_STACK,
                Err(err) => {
                    self.fail(err, "backtrace");
                    return _URC_FATAL_PHASE1_ERROR;
                }
            }
            // SAFETY: forwarded from our caller.
            let reason = unsafe { trace(self.walker.context(), argument) };
            if reason != _URC_NO_REASON {
                return reason;
            }
        }
    }
}

/// Interprets a personality pointer from unwind info.
fn personality_routine(address: Option<usize>) -> Option<PersonalityRoutine> {
    // SAFETY: the unwind info names the personality of the frame's code,
    // which is a function with this ABI.
    address
        .filter(|&address| address != 0)
        .map(|address| unsafe { core::mem::transmute::<usize, PersonalityRoutine>(address) })
}

/// Walks frames by restoring registers from unwind info.
///
/// Frames are identified by their stack pointer. Installing a frame leaves
/// the registers to jump to in [`RegisterWalker::landing`].
pub struct RegisterWalker<A: Arch, S, F> {
    cursor: Cursor<A, S, F>,
    start: Registers<A>,
    context: _Unwind_Context,
    landing: Option<Registers<A>>,
}

impl<A: Arch, S: AddressSpace, F: FindUnwindSections> RegisterWalker<A, S, F> {
    /// `registers` are those of the frame raising the exception.
    pub fn new(space: S, finder: F, registers: Registers<A>) -> Self {
        Self {
            cursor: Cursor::new(space, finder, registers.clone()),
            start: registers,
            context: _Unwind_Context::default(),
            landing: None,
        }
    }

    pub fn landing(&self) -> Option<&Registers<A>> {
        self.landing.as_ref()
    }

    pub fn into_landing(self) -> Option<Registers<A>> {
        self.landing
    }
}

impl<A: Arch, S: AddressSpace, F: FindUnwindSections> FrameWalker for RegisterWalker<A, S, F> {
    fn rewind(&mut self) {
        self.cursor.reset(self.start.clone());
        self.context = _Unwind_Context::default();
        self.landing = None;
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WalkError> {
        if self.cursor.step()? == StepResult::EndOfStack {
            return Ok(None);
        }
        let Some(info) = self.cursor.proc_info()? else {
            return Ok(None);
        };
        let registers = self.cursor.registers();
        let mut context = _Unwind_Context {
            ip: registers.ip(),
            cfa: registers.sp(),
            lsda: info.lsda.unwrap_or(0),
            region_start: info.start_ip,
            args_size: info.args_size,
            signal_frame: info.signal_frame,
            .._Unwind_Context::default()
        };
        for n in 0..uw::CONTEXT_REGISTERS {
            if let Ok(value) = registers.get(Register(n as u16)) {
                context.registers[n] = value;
                context.valid |= 1 << n;
            }
        }
        self.context = context;
        Ok(Some(Frame {
            id: registers.sp(),
            personality: personality_routine(info.personality),
        }))
    }

    fn context(&mut self) -> &mut _Unwind_Context {
        &mut self.context
    }

    fn install(&mut self) -> Result<(), WalkError> {
        let mut registers = self.cursor.registers().clone();
        for (n, value) in self.context.dirty_registers() {
            registers.set(Register(n as u16), value)?;
        }
        if self.context.ip_dirty {
            registers.set_ip(self.context.ip);
            let sp = registers.sp().wrapping_add(self.context.args_size as usize);
            registers.set_sp(sp);
        }
        debug!(?registers, "landing");
        self.landing = Some(registers);
        Ok(())
    }
}
