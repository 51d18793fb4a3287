//! The DWARF expression stack machine, restricted to what CFI uses.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §2.5 DWARF Expressions
#![allow(non_upper_case_globals)]

use super::parse::Expr;
use crate::{
    addr_space::{AddressSpace, MemoryError, Reader},
    registers::{Arch, Register, RegisterError, Registers},
};

pub const EXPRESSION_STACK_SIZE: usize = 100;

/// Upper bound on executed operations. Branches can loop.
pub const MAX_EXPRESSION_STEPS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("expression stack overflow")]
    StackOverflow,
    #[error("{op:#04x} needs more values than are on the stack")]
    StackUnderflow { op: u8 },
    #[error("expression left an empty stack")]
    EmptyStack,
    #[error("division by zero")]
    DivisionByZero,
    #[error("unknown expression opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("expression opcode {0:#04x} is not supported in CFI")]
    Unsupported(u8),
    #[error("branch to {target:#x} leaves the expression")]
    BranchOutOfRange { target: usize },
    #[error("expression ran for more than {MAX_EXPRESSION_STEPS} operations")]
    TooManySteps,
    #[error("{size} is not a valid dereference size")]
    BadDerefSize { size: u8 },
}

const DW_OP_addr: u8 = 0x03;
const DW_OP_deref: u8 = 0x06;
const DW_OP_const1u: u8 = 0x08;
const DW_OP_const1s: u8 = 0x09;
const DW_OP_const2u: u8 = 0x0a;
const DW_OP_const2s: u8 = 0x0b;
const DW_OP_const4u: u8 = 0x0c;
const DW_OP_const4s: u8 = 0x0d;
const DW_OP_const8u: u8 = 0x0e;
const DW_OP_const8s: u8 = 0x0f;
const DW_OP_constu: u8 = 0x10;
const DW_OP_consts: u8 = 0x11;
const DW_OP_dup: u8 = 0x12;
const DW_OP_drop: u8 = 0x13;
const DW_OP_over: u8 = 0x14;
const DW_OP_pick: u8 = 0x15;
const DW_OP_swap: u8 = 0x16;
const DW_OP_rot: u8 = 0x17;
const DW_OP_xderef: u8 = 0x18;
const DW_OP_abs: u8 = 0x19;
const DW_OP_and: u8 = 0x1a;
const DW_OP_div: u8 = 0x1b;
const DW_OP_minus: u8 = 0x1c;
const DW_OP_mod: u8 = 0x1d;
const DW_OP_mul: u8 = 0x1e;
const DW_OP_neg: u8 = 0x1f;
const DW_OP_not: u8 = 0x20;
const DW_OP_or: u8 = 0x21;
const DW_OP_plus: u8 = 0x22;
const DW_OP_plus_uconst: u8 = 0x23;
const DW_OP_shl: u8 = 0x24;
const DW_OP_shr: u8 = 0x25;
const DW_OP_shra: u8 = 0x26;
const DW_OP_xor: u8 = 0x27;
const DW_OP_bra: u8 = 0x28;
const DW_OP_eq: u8 = 0x29;
const DW_OP_ge: u8 = 0x2a;
const DW_OP_gt: u8 = 0x2b;
const DW_OP_le: u8 = 0x2c;
const DW_OP_lt: u8 = 0x2d;
const DW_OP_ne: u8 = 0x2e;
const DW_OP_skip: u8 = 0x2f;
const DW_OP_lit0: u8 = 0x30;
const DW_OP_lit31: u8 = 0x4f;
const DW_OP_reg0: u8 = 0x50;
const DW_OP_reg31: u8 = 0x6f;
const DW_OP_breg0: u8 = 0x70;
const DW_OP_breg31: u8 = 0x8f;
const DW_OP_regx: u8 = 0x90;
const DW_OP_fbreg: u8 = 0x91;
const DW_OP_bregx: u8 = 0x92;
const DW_OP_piece: u8 = 0x93;
const DW_OP_deref_size: u8 = 0x94;
const DW_OP_xderef_size: u8 = 0x95;
const DW_OP_nop: u8 = 0x96;

struct Stack {
    slots: [usize; EXPRESSION_STACK_SIZE],
    len: usize,
}

impl Stack {
    fn new() -> Self {
        Self {
            slots: [0; EXPRESSION_STACK_SIZE],
            len: 0,
        }
    }

    fn push(&mut self, value: usize) -> Result<(), ExprError> {
        let slot = self.slots.get_mut(self.len).ok_or(ExprError::StackOverflow)?;
        *slot = value;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self, op: u8) -> Result<usize, ExprError> {
        if self.len == 0 {
            return Err(ExprError::StackUnderflow { op });
        }
        self.len -= 1;
        Ok(self.slots[self.len])
    }

    /// The value `depth` entries below the top.
    fn peek(&self, depth: usize, op: u8) -> Result<usize, ExprError> {
        if depth >= self.len {
            return Err(ExprError::StackUnderflow { op });
        }
        Ok(self.slots[self.len - 1 - depth])
    }
}

/// Evaluates `expr` with `initial` pushed on the stack and returns the value
/// on top of the stack at the end. Whether that is an address or a value is
/// up to the caller.
#[instrument(level = "trace", skip(space, registers), ret, err)]
pub fn evaluate<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    expr: Expr,
    registers: &Registers<A>,
    initial: usize,
) -> Result<usize, ExprError> {
    let mut code = Reader::new(space, expr.start, expr.end());
    let mut stack = Stack::new();
    stack.push(initial)?;

    let mut steps = 0;
    while !code.is_empty() {
        steps += 1;
        if steps > MAX_EXPRESSION_STEPS {
            return Err(ExprError::TooManySteps);
        }

        let op = code.u8()?;
        match op {
            DW_OP_addr => stack.push(code.pointer()?)?,
            DW_OP_deref => {
                let addr = stack.pop(op)?;
                stack.push(space.get_pointer(addr)?)?;
            }
            DW_OP_const1u => stack.push(usize::from(code.u8()?))?,
            DW_OP_const1s => stack.push(code.i8()? as usize)?,
            DW_OP_const2u => stack.push(usize::from(code.u16()?))?,
            DW_OP_const2s => stack.push(code.i16()? as usize)?,
            DW_OP_const4u => stack.push(code.u32()? as usize)?,
            DW_OP_const4s => stack.push(code.i32()? as usize)?,
            DW_OP_const8u => stack.push(code.u64()? as usize)?,
            DW_OP_const8s => stack.push(code.i64()? as usize)?,
            DW_OP_constu => stack.push(code.uleb128()? as usize)?,
            DW_OP_consts => stack.push(code.sleb128()? as usize)?,
            DW_OP_dup => stack.push(stack.peek(0, op)?)?,
            DW_OP_drop => {
                stack.pop(op)?;
            }
            DW_OP_over => stack.push(stack.peek(1, op)?)?,
            DW_OP_pick => {
                let index = usize::from(code.u8()?);
                stack.push(stack.peek(index, op)?)?;
            }
            DW_OP_swap => {
                let a = stack.pop(op)?;
                let b = stack.pop(op)?;
                stack.push(a)?;
                stack.push(b)?;
            }
            DW_OP_rot => {
                // The top moves to third place, the other two move up.
                let a = stack.pop(op)?;
                let b = stack.pop(op)?;
                let c = stack.pop(op)?;
                stack.push(a)?;
                stack.push(c)?;
                stack.push(b)?;
            }
            DW_OP_xderef => {
                let addr = stack.pop(op)?;
                let _address_space_id = stack.pop(op)?;
                stack.push(space.get_pointer(addr)?)?;
            }
            DW_OP_deref_size | DW_OP_xderef_size => {
                let size = code.u8()?;
                let addr = stack.pop(op)?;
                if op == DW_OP_xderef_size {
                    stack.pop(op)?;
                }
                let value = match size {
                    1 => usize::from(space.get8(addr)?),
                    2 => usize::from(space.get16(addr)?),
                    4 => space.get32(addr)? as usize,
                    8 => space.get64(addr)? as usize,
                    _ => return Err(ExprError::BadDerefSize { size }),
                };
                stack.push(value)?;
            }
            DW_OP_abs => {
                let v = stack.pop(op)? as isize;
                stack.push(v.wrapping_abs() as usize)?;
            }
            DW_OP_neg => {
                let v = stack.pop(op)? as isize;
                stack.push(v.wrapping_neg() as usize)?;
            }
            DW_OP_not => {
                let v = stack.pop(op)?;
                stack.push(!v)?;
            }
            DW_OP_plus_uconst => {
                let v = stack.pop(op)?;
                stack.push(v.wrapping_add(code.uleb128()? as usize))?;
            }
            DW_OP_and | DW_OP_div | DW_OP_minus | DW_OP_mod | DW_OP_mul | DW_OP_or
            | DW_OP_plus | DW_OP_shl | DW_OP_shr | DW_OP_shra | DW_OP_xor | DW_OP_eq
            | DW_OP_ge | DW_OP_gt | DW_OP_le | DW_OP_lt | DW_OP_ne => {
                let top = stack.pop(op)?;
                let second = stack.pop(op)?;
                stack.push(binary(op, second, top)?)?;
            }
            DW_OP_skip => {
                let offset = code.i16()?;
                jump(&mut code, expr, offset)?;
            }
            DW_OP_bra => {
                let offset = code.i16()?;
                if stack.pop(op)? != 0 {
                    jump(&mut code, expr, offset)?;
                }
            }
            DW_OP_lit0..=DW_OP_lit31 => stack.push(usize::from(op - DW_OP_lit0))?,
            DW_OP_reg0..=DW_OP_reg31 => {
                stack.push(registers.get(Register(u16::from(op - DW_OP_reg0)))?)?
            }
            DW_OP_regx => {
                let reg = register(code.uleb128()?);
                stack.push(registers.get(reg)?)?;
            }
            DW_OP_breg0..=DW_OP_breg31 => {
                let base = registers.get(Register(u16::from(op - DW_OP_breg0)))?;
                stack.push(base.wrapping_add(code.sleb128()? as usize))?;
            }
            DW_OP_bregx => {
                let reg = register(code.uleb128()?);
                let base = registers.get(reg)?;
                stack.push(base.wrapping_add(code.sleb128()? as usize))?;
            }
            DW_OP_nop => {}
            DW_OP_fbreg | DW_OP_piece => return Err(ExprError::Unsupported(op)),
            _ => return Err(ExprError::UnknownOpcode(op)),
        }
    }

    stack.pop(0).map_err(|_| ExprError::EmptyStack)
}

fn register(value: u64) -> Register {
    // Anything that does not fit is certainly not in the catalog either.
    Register(u16::try_from(value).unwrap_or(u16::MAX))
}

fn jump<S: AddressSpace + ?Sized>(
    code: &mut Reader<'_, S>,
    expr: Expr,
    offset: i16,
) -> Result<(), ExprError> {
    let target = code.pos().wrapping_add(offset as isize as usize);
    if target < expr.start || target > expr.end() {
        return Err(ExprError::BranchOutOfRange { target });
    }
    code.pos = target;
    Ok(())
}

/// `second op top`, in the order the operands were pushed.
fn binary(op: u8, second: usize, top: usize) -> Result<usize, ExprError> {
    let (s, t) = (second as isize, top as isize);
    Ok(match op {
        DW_OP_and => second & top,
        DW_OP_or => second | top,
        DW_OP_xor => second ^ top,
        DW_OP_plus => second.wrapping_add(top),
        DW_OP_minus => second.wrapping_sub(top),
        DW_OP_mul => second.wrapping_mul(top),
        DW_OP_div => {
            if top == 0 {
                return Err(ExprError::DivisionByZero);
            }
            s.wrapping_div(t) as usize
        }
        DW_OP_mod => {
            if top == 0 {
                return Err(ExprError::DivisionByZero);
            }
            second % top
        }
        DW_OP_shl => second.checked_shl(top as u32).unwrap_or(0),
        DW_OP_shr => second.checked_shr(top as u32).unwrap_or(0),
        DW_OP_shra => s.checked_shr(top as u32).unwrap_or(if s < 0 { -1 } else { 0 }) as usize,
        DW_OP_eq => usize::from(s == t),
        DW_OP_ge => usize::from(s >= t),
        DW_OP_gt => usize::from(s > t),
        DW_OP_le => usize::from(s <= t),
        DW_OP_lt => usize::from(s < t),
        DW_OP_ne => usize::from(s != t),
        _ => return Err(ExprError::UnknownOpcode(op)),
    })
}
