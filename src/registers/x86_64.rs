use super::{Arch, ArchTag, Register, Slot};
use crate::{
    addr_space::AddressSpace,
    compact::{self, CompactEncoding, CompactError, CompactUnwind},
};

/// System V x86-64. Registers 0-16 follow the psABI DWARF numbering, where
/// column 16 is the return address (and therefore `rip`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct X86_64;

impl X86_64 {
    pub const RAX: Register = Register(0);
    pub const RDX: Register = Register(1);
    pub const RCX: Register = Register(2);
    pub const RBX: Register = Register(3);
    pub const RSI: Register = Register(4);
    pub const RDI: Register = Register(5);
    pub const RBP: Register = Register(6);
    pub const RSP: Register = Register(7);
    pub const R8: Register = Register(8);
    pub const R12: Register = Register(12);
    pub const R13: Register = Register(13);
    pub const R14: Register = Register(14);
    pub const R15: Register = Register(15);
    pub const RIP: Register = Register(16);
    pub const XMM0: Register = Register(17);
    pub const XMM15: Register = Register(32);
}

impl Arch for X86_64 {
    const TAG: ArchTag = ArchTag::X86_64;
    const HIGHEST_REGISTER: u16 = 32;
    const SP: Register = Self::RSP;
    const FP: Register = Self::RBP;
    const RETURN_ADDRESS: Register = Self::RIP;

    fn slot(reg: Register) -> Option<Slot> {
        match reg.0 {
            n @ 0..=15 => Some(Slot::Integer(n as usize)),
            16 => Some(Slot::Ip),
            n @ 17..=32 => Some(Slot::Vector((n - 17) as usize)),
            _ => None,
        }
    }

    fn compact_unwind<S: AddressSpace + ?Sized>(
        space: &S,
        encoding: CompactEncoding,
        function_start: usize,
    ) -> Result<CompactUnwind, CompactError> {
        compact::x86_64::decode(space, encoding, function_start)
    }
}
