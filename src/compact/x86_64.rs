//! x86-64 compact unwind modes.

use super::{decode_permutation, CompactEncoding, CompactError, CompactUnwind};
use crate::{
    addr_space::AddressSpace,
    dwarf::prolog::{CfaRule, PrologInfo, RegisterRule},
    registers::{Register, X86_64},
};

const MODE_RBP_FRAME: u32 = 1;
const MODE_STACK_IMMD: u32 = 2;
const MODE_STACK_IND: u32 = 3;
const MODE_DWARF: u32 = 4;

const RBP_FRAME_REGISTERS: u32 = 0x0000_7FFF;
const RBP_FRAME_OFFSET: u32 = 0x00FF_0000;
const FRAMELESS_STACK_SIZE: u32 = 0x00FF_0000;
const FRAMELESS_STACK_ADJUST: u32 = 0x0000_E000;
const FRAMELESS_STACK_REG_COUNT: u32 = 0x0000_1C00;
const FRAMELESS_STACK_REG_PERMUTATION: u32 = 0x0000_03FF;

/// The callee-saved registers, in the numbering the encoding uses (minus one).
const SAVED_REGISTERS: [Register; 6] = [
    X86_64::RBX,
    Register(12),
    Register(13),
    Register(14),
    Register(15),
    X86_64::RBP,
];

const WORD: i64 = 8;

#[instrument(level = "trace", skip(space), err)]
pub fn decode<S: AddressSpace + ?Sized>(
    space: &S,
    encoding: CompactEncoding,
    function_start: usize,
) -> Result<CompactUnwind, CompactError> {
    let mut prolog = PrologInfo::new(X86_64::RIP);
    match encoding.mode() {
        0 => return Ok(CompactUnwind::None),
        MODE_RBP_FRAME => {
            // push rbp; mov rbp, rsp; the other saves are relative to rbp.
            prolog.cfa = CfaRule::RegisterOffset {
                register: X86_64::RBP,
                offset: 2 * WORD,
            };
            prolog.set_rule(X86_64::RBP, RegisterRule::InCfa(-2 * WORD))?;
            prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-WORD))?;

            let offset = i64::from(encoding.field(RBP_FRAME_OFFSET));
            let mut locations = encoding.field(RBP_FRAME_REGISTERS);
            let mut at = -2 * WORD - offset * WORD;
            for _ in 0..5 {
                let register = locations & 0b111;
                if register != 0 {
                    let register = *SAVED_REGISTERS
                        .get(register as usize - 1)
                        .ok_or(CompactError::BadMode(encoding))?;
                    prolog.set_rule(register, RegisterRule::InCfa(at))?;
                }
                at += WORD;
                locations >>= 3;
            }
        }
        mode @ (MODE_STACK_IMMD | MODE_STACK_IND) => {
            let field = encoding.field(FRAMELESS_STACK_SIZE);
            let stack_size = if mode == MODE_STACK_IMMD {
                i64::from(field) * WORD
            } else {
                // The field is the offset of the imm32 of `sub rsp, N` in the
                // function. Pushes before the `sub` are in the adjustment.
                let sub = space.get32(function_start.wrapping_add(field as usize))?;
                let adjust = encoding.field(FRAMELESS_STACK_ADJUST);
                i64::from(sub) + i64::from(adjust) * WORD
            };
            trace!(stack_size, "frameless function");

            prolog.cfa = CfaRule::RegisterOffset {
                register: X86_64::RSP,
                offset: stack_size,
            };
            prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-WORD))?;

            let count = encoding.field(FRAMELESS_STACK_REG_COUNT);
            if count > 6 {
                return Err(CompactError::BadMode(encoding));
            }
            let permutation = encoding.field(FRAMELESS_STACK_REG_PERMUTATION);
            let order = decode_permutation(count, permutation);
            let mut at = -WORD - i64::from(count) * WORD;
            for &n in &order[..count as usize] {
                prolog.set_rule(SAVED_REGISTERS[usize::from(n)], RegisterRule::InCfa(at))?;
                at += WORD;
            }
        }
        MODE_DWARF => {
            return Ok(CompactUnwind::Dwarf(
                encoding.0 & CompactEncoding::DWARF_SECTION_OFFSET,
            ))
        }
        _ => return Err(CompactError::BadMode(encoding)),
    }
    debug!(?prolog, "decoded compact encoding");
    Ok(CompactUnwind::Prolog(prolog))
}
