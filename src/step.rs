//! Computing the caller's registers from the callee's.
//!
//! A step runs the unwind rules for the current pc (from an FDE or a compact
//! encoding) against the current [`Registers`] and produces a new set for the
//! caller. The old set is only ever read, so a failed step leaves the cursor
//! where it was.

use crate::{
    addr_space::{AddressSpace, MemoryError},
    compact::{CompactEncoding, CompactError, CompactUnwind},
    dwarf::{
        expr::{evaluate, ExprError},
        parse::{CfiError, EncodingBases},
        prolog::{parse_prolog, CfaRule, PrologInfo, RegisterRule},
    },
    registers::{Arch, Register, RegisterClass, RegisterError, Registers},
};

/// Where the unwind rules of a function are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindInfoLocation {
    Dwarf {
        /// Address of the FDE.
        fde: usize,
        bases: EncodingBases,
    },
    Compact {
        encoding: CompactEncoding,
        function_start: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Cfi(#[from] CfiError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Compact(#[from] CompactError),
    #[error("the CFA rule is undefined")]
    UnresolvableCfa,
    #[error("rule {rule:?} can't restore {register}")]
    UnsupportedRule {
        register: Register,
        rule: RegisterRule,
    },
    #[error("compact encoding defers to the FDE at .eh_frame+{0:#x}")]
    DwarfEscape(u32),
    #[error("the function has no unwind information")]
    NoUnwindInfo,
}

/// The libunwind error classes a failed step is reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StepFailure {
    BadRegister = -6542,
    BadFrame = -6546,
}

impl StepError {
    pub fn failure(&self) -> StepFailure {
        match self {
            StepError::Register(_) | StepError::UnsupportedRule { .. } => StepFailure::BadRegister,
            StepError::Cfi(CfiError::BadRegister(_)) => StepFailure::BadRegister,
            StepError::Expr(ExprError::Register(_)) => StepFailure::BadRegister,
            _ => StepFailure::BadFrame,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome<A: Arch> {
    pub registers: Registers<A>,
    pub signal_frame: bool,
}

/// Computes the unwind rules that apply at `pc`.
pub fn prolog_for<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    pc: usize,
    location: &UnwindInfoLocation,
) -> Result<PrologInfo, StepError> {
    match *location {
        UnwindInfoLocation::Dwarf { fde, ref bases } => {
            let (prolog, _, _) = parse_prolog::<A, S>(space, fde, pc, bases)?;
            Ok(prolog)
        }
        UnwindInfoLocation::Compact {
            encoding,
            function_start,
        } => match A::compact_unwind(space, encoding, function_start)? {
            CompactUnwind::Prolog(prolog) => Ok(prolog),
            CompactUnwind::Dwarf(offset) => Err(StepError::DwarfEscape(offset)),
            CompactUnwind::None => Err(StepError::NoUnwindInfo),
        },
    }
}

/// Steps from the frame executing at `pc` with `registers` to its caller.
#[instrument(level = "debug", skip(space, registers), err)]
pub fn step<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    pc: usize,
    location: &UnwindInfoLocation,
    registers: &Registers<A>,
) -> Result<StepOutcome<A>, StepError> {
    let prolog = prolog_for::<A, S>(space, pc, location)?;
    let registers = apply_prolog(space, &prolog, registers)?;
    Ok(StepOutcome {
        registers,
        signal_frame: prolog.signal_frame,
    })
}

pub fn cfa<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    prolog: &PrologInfo,
    registers: &Registers<A>,
) -> Result<usize, StepError> {
    match prolog.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            Ok(registers.get(register)?.wrapping_add_signed(offset as isize))
        }
        CfaRule::Expression(expr) => Ok(evaluate(space, expr, registers, 0)?),
        CfaRule::Undefined => Err(StepError::UnresolvableCfa),
    }
}

/// Applies the rules of `prolog` to `old`, producing the caller's registers.
pub fn apply_prolog<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    prolog: &PrologInfo,
    old: &Registers<A>,
) -> Result<Registers<A>, StepError> {
    let cfa = cfa(space, prolog, old)?;
    trace!("CFA = {cfa:#x}");

    let mut new = old.clone();
    new.set_sp(cfa);
    let cookie = A::window_cookie(old);

    for register in (0..=A::HIGHEST_REGISTER).map(Register) {
        if register == prolog.return_address_register {
            continue;
        }
        let rule = prolog.rule(register);
        if rule == RegisterRule::Unused {
            continue;
        }
        trace!(%register, ?rule, "restoring");
        match Registers::<A>::class(register) {
            Some(RegisterClass::Integer) => {
                new.set(register, integer(space, register, rule, cfa, cookie, old)?)?
            }
            Some(RegisterClass::Float) => {
                new.set_float(register, float(space, register, rule, cfa, old)?)?
            }
            Some(RegisterClass::Vector) => {
                new.set_vector(register, vector(space, register, rule, cfa, old)?)?
            }
            None => return Err(StepError::UnsupportedRule { register, rule }),
        }
    }

    let ra_register = prolog.return_address_register;
    let ra = match prolog.rule(ra_register) {
        // Leaf functions leave the return address where the call put it.
        RegisterRule::Unused => old.get(ra_register)?,
        rule => integer(space, ra_register, rule, cfa, cookie, old)?,
    };
    let ra = A::authenticate_return_address(ra, prolog.ra_signed, old);
    let ra = A::adjust_return_address(ra);
    debug!("return address = {ra:#x}");
    new.set_ip(ra);
    if ra != 0 {
        A::repair_after_return(space, &mut new)?;
    }
    Ok(new)
}

fn at(cfa: usize, offset: i64) -> usize {
    cfa.wrapping_add_signed(offset as isize)
}

fn integer<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    register: Register,
    rule: RegisterRule,
    cfa: usize,
    cookie: usize,
    old: &Registers<A>,
) -> Result<usize, StepError> {
    Ok(match rule {
        RegisterRule::Unused => old.get(register)?,
        RegisterRule::Undefined => 0,
        RegisterRule::InRegister(from) => old.get(from)?,
        RegisterRule::InCfa(offset) => space.get_register(at(cfa, offset))?,
        RegisterRule::InCfaDecrypted(offset) => space.get_register(at(cfa, offset))? ^ cookie,
        RegisterRule::AtExpression(expr) => {
            space.get_register(evaluate(space, expr, old, cfa)?)?
        }
        RegisterRule::IsExpression(expr) => evaluate(space, expr, old, cfa)?,
        RegisterRule::OffsetFromCfa(offset) => at(cfa, offset),
    })
}

fn float<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    register: Register,
    rule: RegisterRule,
    cfa: usize,
    old: &Registers<A>,
) -> Result<u64, StepError> {
    Ok(match rule {
        RegisterRule::Unused => old.get_float(register)?,
        RegisterRule::Undefined => 0,
        RegisterRule::InRegister(from) => old.get_float(from)?,
        RegisterRule::InCfa(offset) => space.get64(at(cfa, offset))?,
        RegisterRule::AtExpression(expr) => space.get64(evaluate(space, expr, old, cfa)?)?,
        rule => return Err(StepError::UnsupportedRule { register, rule }),
    })
}

fn vector<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    register: Register,
    rule: RegisterRule,
    cfa: usize,
    old: &Registers<A>,
) -> Result<u128, StepError> {
    Ok(match rule {
        RegisterRule::Unused => old.get_vector(register)?,
        RegisterRule::Undefined => 0,
        RegisterRule::InRegister(from) => old.get_vector(from)?,
        RegisterRule::InCfa(offset) => space.get128(at(cfa, offset))?,
        RegisterRule::AtExpression(expr) => space.get128(evaluate(space, expr, old, cfa)?)?,
        rule => return Err(StepError::UnsupportedRule { register, rule }),
    })
}

#[cfg(test)]
mod tests;
