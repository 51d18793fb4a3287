//! arm64 compact unwind modes.

use super::{CompactEncoding, CompactError, CompactUnwind};
use crate::{
    addr_space::AddressSpace,
    dwarf::prolog::{CfaRule, PrologInfo, RegisterRule},
    registers::{AArch64, Register},
};

const MODE_FRAMELESS: u32 = 2;
const MODE_DWARF: u32 = 3;
const MODE_FRAME: u32 = 4;

const FRAMELESS_STACK_SIZE: u32 = 0x00FF_F000;

/// Flag bit and the register pair it saves, in the order they are pushed.
const PAIRS: [(u32, Register, Register); 9] = [
    (0x001, Register(19), Register(20)),
    (0x002, Register(21), Register(22)),
    (0x004, Register(23), Register(24)),
    (0x008, Register(25), Register(26)),
    (0x010, Register(27), Register(28)),
    (0x100, Register(72), Register(73)),
    (0x200, Register(74), Register(75)),
    (0x400, Register(76), Register(77)),
    (0x800, Register(78), Register(79)),
];

const WORD: i64 = 8;

#[instrument(level = "trace", skip(_space), err)]
pub fn decode<S: AddressSpace + ?Sized>(
    _space: &S,
    encoding: CompactEncoding,
    function_start: usize,
) -> Result<CompactUnwind, CompactError> {
    let mut prolog = PrologInfo::new(AArch64::LR);
    let first_save = match encoding.mode() {
        0 => return Ok(CompactUnwind::None),
        MODE_FRAMELESS => {
            // Leaf function: pop the stack, the return address is still in lr.
            let stack_size = i64::from(encoding.field(FRAMELESS_STACK_SIZE)) * 16;
            prolog.cfa = CfaRule::RegisterOffset {
                register: AArch64::SP,
                offset: stack_size,
            };
            -WORD
        }
        MODE_FRAME => {
            // stp x29, x30, [sp, #-16]!; mov x29, sp
            prolog.cfa = CfaRule::RegisterOffset {
                register: AArch64::FP,
                offset: 2 * WORD,
            };
            prolog.set_rule(AArch64::FP, RegisterRule::InCfa(-2 * WORD))?;
            prolog.set_rule(AArch64::LR, RegisterRule::InCfa(-WORD))?;
            -3 * WORD
        }
        MODE_DWARF => {
            return Ok(CompactUnwind::Dwarf(
                encoding.0 & CompactEncoding::DWARF_SECTION_OFFSET,
            ))
        }
        _ => return Err(CompactError::BadMode(encoding)),
    };

    let mut at = first_save;
    for (flag, first, second) in PAIRS {
        if encoding.0 & flag == 0 {
            continue;
        }
        prolog.set_rule(first, RegisterRule::InCfa(at))?;
        prolog.set_rule(second, RegisterRule::InCfa(at - WORD))?;
        at -= 2 * WORD;
    }
    debug!(?prolog, "decoded compact encoding");
    Ok(CompactUnwind::Prolog(prolog))
}
