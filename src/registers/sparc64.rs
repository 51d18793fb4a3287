use super::{Arch, ArchTag, Register, Registers, Slot, VendorCfaOp};

/// SPARC V9. Registers 0-31 are `%g0-%g7`, `%o0-%o7`, `%l0-%l7`, `%i0-%i7`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sparc64;

impl Sparc64 {
    pub const O0: Register = Register(8);
    pub const SP: Register = Register(14);
    pub const O7: Register = Register(15);
    pub const L0: Register = Register(16);
    pub const I0: Register = Register(24);
    pub const FP: Register = Register(30);
    pub const I7: Register = Register(31);
    /// Pseudo register carrying the StackGhost cookie. It is outside the
    /// range CFI can name.
    pub const WINDOW_COOKIE: Register = Register(0x1000);

    /// `call` plus its delay slot.
    const CALL_SEQUENCE_LEN: usize = 8;
}

impl Arch for Sparc64 {
    const TAG: ArchTag = ArchTag::Sparc64;
    const HIGHEST_REGISTER: u16 = 31;
    const SP: Register = Self::SP;
    const FP: Register = Self::FP;
    const RETURN_ADDRESS: Register = Self::O7;
    const VENDOR_CFA_OP: VendorCfaOp = VendorCfaOp::WindowSave;

    fn slot(reg: Register) -> Option<Slot> {
        match reg.0 {
            n @ 0..=31 => Some(Slot::Integer(n as usize)),
            0x1000 => Some(Slot::Integer(32)),
            _ => None,
        }
    }

    /// `%o7` holds the address of the `call` itself.
    fn adjust_return_address(ra: usize) -> usize {
        ra.wrapping_add(Self::CALL_SEQUENCE_LEN)
    }

    fn window_cookie(regs: &Registers<Self>) -> usize {
        regs.get(Self::WINDOW_COOKIE).unwrap_or_default()
    }
}
