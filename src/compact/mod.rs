//! Apple's compact unwind encoding.
//!
//! Most functions in a Mach-O image don't get a DWARF FDE. Instead the linker
//! summarizes how to unwind them in a single 32 bit word, stored in the
//! `__unwind_info` section. The layout of the word is architecture specific,
//! except for the top byte:
//!
//! ```text
//! 31                 30       28 27    24 23                               0
//! | not function start | LSDA | personality | mode | mode specific ......... |
//! ```
//!
//! Decoding produces the same [`PrologInfo`] the DWARF path does, so the
//! stepper doesn't care where its rules came from.

pub mod arm64;
pub mod unwind_info;
pub mod x86_64;

pub use unwind_info::{find_entry, CompactEntry, CompactSection};

use core::fmt;

use crate::{
    addr_space::MemoryError,
    dwarf::{parse::CfiError, prolog::PrologInfo},
    registers::ArchTag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompactError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Cfi(#[from] CfiError),
    #[error("compact unwind is not supported on {0:?}")]
    UnsupportedArch(ArchTag),
    #[error("unknown compact unwind mode in {0:?}")]
    BadMode(CompactEncoding),
    #[error("__unwind_info version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("unknown second level page kind {0}")]
    BadPageKind(u32),
    #[error("encoding index {0} is out of range")]
    BadEncodingIndex(u32),
    #[error("personality index {0} is out of range")]
    BadPersonalityIndex(u32),
    #[error("function at {0:#x} has an LSDA flag but no LSDA entry")]
    MissingLsda(usize),
}

/// A compact unwind encoding word.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactEncoding(pub u32);

impl CompactEncoding {
    pub const IS_NOT_FUNCTION_START: u32 = 0x8000_0000;
    pub const HAS_LSDA: u32 = 0x4000_0000;
    pub const PERSONALITY_MASK: u32 = 0x3000_0000;
    pub const MODE_MASK: u32 = 0x0F00_0000;
    /// The offset of the FDE in `.eh_frame` for the DWARF escape modes.
    pub const DWARF_SECTION_OFFSET: u32 = 0x00FF_FFFF;

    pub fn is_not_function_start(self) -> bool {
        self.0 & Self::IS_NOT_FUNCTION_START != 0
    }

    pub fn has_lsda(self) -> bool {
        self.0 & Self::HAS_LSDA != 0
    }

    /// One-based index into the personality table, 0 for none.
    pub fn personality_index(self) -> u32 {
        (self.0 & Self::PERSONALITY_MASK) >> 28
    }

    pub fn mode(self) -> u32 {
        (self.0 & Self::MODE_MASK) >> 24
    }

    /// Extracts the field selected by `mask`, shifted down.
    pub(crate) fn field(self, mask: u32) -> u32 {
        (self.0 & mask) >> mask.trailing_zeros()
    }
}

impl fmt::Debug for CompactEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompactEncoding({:#010x})", self.0)
    }
}

/// What a compact encoding says about a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactUnwind {
    /// No unwind information, the function can't be stepped through.
    None,
    Prolog(PrologInfo),
    /// Use the FDE at this offset in `.eh_frame` instead.
    Dwarf(u32),
}

/// Decodes the saved register permutation of a frameless function.
///
/// The registers are numbered 0 to 5 and stored as a Lehmer code: the first
/// digit picks one of the six registers, the next one of the five left, and
/// so on. Returns the register numbers in the order they were pushed.
pub fn decode_permutation(count: u32, mut permutation: u32) -> [u8; 6] {
    let divisors: &[u32] = match count {
        6 | 5 => &[120, 24, 6, 2, 1],
        4 => &[60, 12, 3, 1],
        3 => &[20, 4, 1],
        2 => &[5, 1],
        1 => &[1],
        _ => &[],
    };
    let mut digits = [0u32; 6];
    for (digit, &divisor) in digits.iter_mut().zip(divisors) {
        *digit = permutation / divisor;
        permutation -= *digit * divisor;
    }

    let mut registers = [0; 6];
    let mut used = [false; 6];
    for (register, &digit) in registers.iter_mut().zip(&digits).take(count.min(6) as usize) {
        let mut rank = 0;
        for (n, taken) in used.iter_mut().enumerate() {
            if *taken {
                continue;
            }
            if rank == digit {
                *register = n as u8;
                *taken = true;
                break;
            }
            rank += 1;
        }
    }
    registers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_permutation() {
        assert_eq!(&decode_permutation(3, 0)[..3], &[0, 1, 2]);
        assert_eq!(decode_permutation(6, 0), [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn reversed_permutations() {
        // 5 4 3 2 1 0: the largest remaining index every time.
        assert_eq!(
            decode_permutation(6, 5 * 120 + 4 * 24 + 3 * 6 + 2 * 2 + 1),
            [5, 4, 3, 2, 1, 0]
        );
        assert_eq!(&decode_permutation(2, 5)[..2], &[1, 0]);
        assert_eq!(&decode_permutation(3, 2 * 20 + 4)[..3], &[2, 1, 0]);
    }

    #[test]
    fn encoding_flags() {
        let encoding = CompactEncoding(0x5100_0000 | 0x2000_0000);
        assert!(!encoding.is_not_function_start());
        assert!(encoding.has_lsda());
        assert_eq!(encoding.personality_index(), 3);
        assert_eq!(encoding.mode(), 1);
        assert_eq!(CompactEncoding(0x00ab_0000).field(0x00FF_0000), 0xab);
    }
}
