use super::{Arch, ArchTag, Register, Registers, Slot, VendorCfaOp};
use crate::{
    addr_space::AddressSpace,
    compact::{self, CompactEncoding, CompactError, CompactUnwind},
};

/// AArch64 with the AAPCS64 DWARF numbering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AArch64;

impl AArch64 {
    pub const X0: Register = Register(0);
    pub const X19: Register = Register(19);
    pub const FP: Register = Register(29);
    pub const LR: Register = Register(30);
    pub const SP: Register = Register(31);
    pub const PC: Register = Register(32);
    /// Pseudo register holding the return address signing state.
    pub const RA_SIGN_STATE: Register = Register(34);
    pub const V0: Register = Register(64);
    pub const D8: Register = Register(72);

    /// Bits of a code address that are not part of the virtual address.
    /// Whatever sits above them on a signed pointer is the PAC.
    const VA_MASK: usize = (1 << 48) - 1;
}

impl Arch for AArch64 {
    const TAG: ArchTag = ArchTag::AArch64;
    const HIGHEST_REGISTER: u16 = 95;
    const SP: Register = Self::SP;
    const FP: Register = Self::FP;
    const RETURN_ADDRESS: Register = Self::LR;
    const VENDOR_CFA_OP: VendorCfaOp = VendorCfaOp::NegateRaState;

    fn slot(reg: Register) -> Option<Slot> {
        match reg.0 {
            n @ 0..=31 => Some(Slot::Integer(n as usize)),
            32 => Some(Slot::Ip),
            34 => Some(Slot::Integer(32)),
            n @ 64..=95 => Some(Slot::Float((n - 64) as usize)),
            _ => None,
        }
    }

    fn authenticate_return_address(ra: usize, signed: bool, regs: &Registers<Self>) -> usize {
        let sign_state = regs.get(Self::RA_SIGN_STATE).unwrap_or_default();
        if signed || sign_state & 1 != 0 {
            trace!("stripping PAC from return address {ra:#x}");
            ra & Self::VA_MASK
        } else {
            ra
        }
    }

    fn compact_unwind<S: AddressSpace + ?Sized>(
        space: &S,
        encoding: CompactEncoding,
        function_start: usize,
    ) -> Result<CompactUnwind, CompactError> {
        compact::arm64::decode(space, encoding, function_start)
    }
}
