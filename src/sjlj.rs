//! setjmp/longjmp exceptions.
//!
//! Instead of unwind tables, every function with a landing pad registers a
//! [`FunctionContext`] on entry and unregisters it on exit. Walking the stack
//! means walking this list, and landing in a frame means `longjmp`ing to the
//! jump buffer of its context with the call site index in
//! `resume_location`.

use alloc::vec::Vec;

use crate::{
    phase::{Frame, FrameWalker, WalkError},
    uw::{PersonalityRoutine, _Unwind_Context},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SjljError {
    #[error("unregistered function context {popped} while {top:?} is on top")]
    NotOnTop { popped: usize, top: Option<usize> },
    #[error("no function context {0}")]
    Unknown(usize),
}

/// Registration record of one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionContext {
    /// Call site index the landing pad dispatches on; the personality reads
    /// it through the ip.
    pub resume_location: u32,
    pub resume_parameters: [usize; 4],
    pub personality: Option<PersonalityRoutine>,
    pub lsda: usize,
    pub jump_buffer: [usize; 5],
}

/// Handle to a registered context. Contexts are registered strictly LIFO,
/// so this is also the depth of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextId(usize);

/// The registered function contexts of one thread, innermost last.
#[derive(Debug, Default)]
pub struct FunctionContextStack {
    contexts: Vec<FunctionContext>,
}

impl FunctionContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// `_Unwind_SjLj_Register`
    pub fn push(&mut self, context: FunctionContext) -> ContextId {
        self.contexts.push(context);
        ContextId(self.contexts.len() - 1)
    }

    /// `_Unwind_SjLj_Unregister`
    pub fn pop(&mut self, id: ContextId) -> Result<FunctionContext, SjljError> {
        let top = self.contexts.len().checked_sub(1);
        if top != Some(id.0) {
            return Err(SjljError::NotOnTop { popped: id.0, top });
        }
        self.contexts.pop().ok_or(SjljError::Unknown(id.0))
    }

    pub fn get(&self, id: ContextId) -> Result<&FunctionContext, SjljError> {
        self.contexts.get(id.0).ok_or(SjljError::Unknown(id.0))
    }

    pub fn top(&self) -> Option<ContextId> {
        self.contexts.len().checked_sub(1).map(ContextId)
    }
}

/// The calling thread's function contexts.
#[cfg(feature = "std")]
pub fn with_thread_contexts<R>(f: impl FnOnce(&mut FunctionContextStack) -> R) -> R {
    use std::cell::RefCell;

    std::thread_local! {
        static CONTEXTS: RefCell<FunctionContextStack> = RefCell::new(FunctionContextStack::new());
    }
    CONTEXTS.with(|contexts| f(&mut contexts.borrow_mut()))
}

/// Walks a [`FunctionContextStack`] from the innermost context outward.
///
/// Personalities see `resume_location + 1` as the ip and the resume
/// parameters as registers 0 to 3. Installing a frame writes them back into
/// its context, unregisters everything above it and leaves a copy of the
/// context in [`SjljWalker::landing`] for the caller to `longjmp` with.
pub struct SjljWalker<'a> {
    stack: &'a mut FunctionContextStack,
    /// Index of the current frame, `None` before the first.
    position: Option<usize>,
    context: _Unwind_Context,
    landing: Option<FunctionContext>,
}

impl<'a> SjljWalker<'a> {
    pub fn new(stack: &'a mut FunctionContextStack) -> Self {
        Self {
            stack,
            position: None,
            context: _Unwind_Context::default(),
            landing: None,
        }
    }

    pub fn landing(&self) -> Option<&FunctionContext> {
        self.landing.as_ref()
    }
}

impl FrameWalker for SjljWalker<'_> {
    fn rewind(&mut self) {
        self.position = None;
        self.landing = None;
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WalkError> {
        let next = match self.position {
            None => self.stack.len().checked_sub(1),
            Some(n) => n.checked_sub(1),
        };
        let Some(next) = next else {
            return Ok(None);
        };
        self.position = Some(next);
        let function = *self.stack.get(ContextId(next))?;

        let mut context = _Unwind_Context {
            ip: function.resume_location as usize + 1,
            lsda: function.lsda,
            valid: 0b1111,
            ..Default::default()
        };
        context.registers[..4].copy_from_slice(&function.resume_parameters);
        self.context = context;
        trace!(frame = next, ?function, "function context");
        Ok(Some(Frame {
            id: next,
            personality: function.personality,
        }))
    }

    fn context(&mut self) -> &mut _Unwind_Context {
        &mut self.context
    }

    fn unwound_past(&mut self) -> Result<(), WalkError> {
        if let Some(n) = self.position {
            self.stack.contexts.truncate(n);
        }
        Ok(())
    }

    fn install(&mut self) -> Result<(), WalkError> {
        let Some(n) = self.position else {
            return Err(SjljError::Unknown(0).into());
        };
        let function = self
            .stack
            .contexts
            .get_mut(n)
            .ok_or(SjljError::Unknown(n))?;
        if self.context.ip_dirty {
            function.resume_location = self.context.ip.wrapping_sub(1) as u32;
        }
        for (n, value) in self.context.dirty_registers() {
            if let Some(parameter) = function.resume_parameters.get_mut(n) {
                *parameter = value;
            }
        }
        self.landing = Some(*function);
        self.stack.contexts.truncate(n + 1);
        debug!(landing = ?self.landing, "installing function context");
        Ok(())
    }
}
