//! The register file of one frame.
//!
//! Registers are always named by their DWARF number, which is the contract
//! between whoever emitted the CFI and us. How the numbers map onto storage
//! and which architectural quirks apply while stepping is described by an
//! [`Arch`].

mod aarch64;
mod ppc64;
mod sparc64;
mod x86_64;

use core::{fmt, marker::PhantomData};

pub use aarch64::AArch64;
pub use ppc64::Ppc64;
pub use sparc64::Sparc64;
pub use x86_64::X86_64;

use crate::{
    addr_space::{AddressSpace, MemoryError},
    compact::{CompactEncoding, CompactError, CompactUnwind},
};

/// A DWARF register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register(pub u16);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchTag {
    X86_64,
    AArch64,
    Ppc64,
    Sparc64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    Integer,
    Float,
    Vector,
}

/// Where a register lives inside [`Registers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Integer(usize),
    Float(usize),
    Vector(usize),
    /// The column that names the instruction pointer itself.
    Ip,
}

impl Slot {
    pub fn class(self) -> RegisterClass {
        match self {
            Slot::Integer(_) | Slot::Ip => RegisterClass::Integer,
            Slot::Float(_) => RegisterClass::Float,
            Slot::Vector(_) => RegisterClass::Vector,
        }
    }
}

/// What the vendor CFA opcode `0x2d` means on an architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorCfaOp {
    None,
    /// `DW_CFA_AARCH64_negate_ra_state`
    NegateRaState,
    /// `DW_CFA_GNU_window_save`
    WindowSave,
}

pub const INTEGER_SLOTS: usize = 40;
pub const FLOAT_SLOTS: usize = 32;
pub const VECTOR_SLOTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("{reg} is not a {class:?} register on {arch:?}")]
    BadRegister {
        reg: Register,
        class: RegisterClass,
        arch: ArchTag,
    },
}

/// Architecture capabilities the stepper is written against.
///
/// The hooks default to doing nothing; an architecture overrides the ones
/// that apply to it.
pub trait Arch: fmt::Debug + Clone + Copy + Default + PartialEq + 'static {
    const TAG: ArchTag;
    /// The highest register number CFI may describe.
    const HIGHEST_REGISTER: u16;
    const SP: Register;
    const FP: Register;
    /// The return address column compilers use by default.
    const RETURN_ADDRESS: Register;
    const VENDOR_CFA_OP: VendorCfaOp = VendorCfaOp::None;

    fn slot(reg: Register) -> Option<Slot>;

    /// Strips a pointer authentication code from a return address.
    /// `signed` is the sign state tracked by the CFI program.
    fn authenticate_return_address(ra: usize, _signed: bool, _regs: &Registers<Self>) -> usize {
        ra
    }

    /// Turns the return address recorded by the call into the address
    /// execution continues at.
    fn adjust_return_address(ra: usize) -> usize {
        ra
    }

    /// Fixes up registers that ordinary CFI does not describe, by looking at
    /// the instruction at the caller's ip.
    fn repair_after_return<S: AddressSpace + ?Sized>(
        _space: &S,
        _regs: &mut Registers<Self>,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    /// The value XOR-ed into `InCFADecrypted` saves.
    fn window_cookie(_regs: &Registers<Self>) -> usize {
        0
    }

    fn compact_unwind<S: AddressSpace + ?Sized>(
        _space: &S,
        _encoding: CompactEncoding,
        _function_start: usize,
    ) -> Result<CompactUnwind, CompactError> {
        Err(CompactError::UnsupportedArch(Self::TAG))
    }
}

/// The register file of a single frame. Stepping never mutates a
/// `Registers` in place; it produces the caller's file as a new value.
#[derive(Clone, PartialEq, Eq)]
pub struct Registers<A: Arch> {
    ints: [usize; INTEGER_SLOTS],
    floats: [u64; FLOAT_SLOTS],
    vectors: [u128; VECTOR_SLOTS],
    ip: usize,
    _arch: PhantomData<A>,
}

impl<A: Arch> Default for Registers<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch> Registers<A> {
    pub fn new() -> Self {
        Self {
            ints: [0; INTEGER_SLOTS],
            floats: [0; FLOAT_SLOTS],
            vectors: [0; VECTOR_SLOTS],
            ip: 0,
            _arch: PhantomData,
        }
    }

    pub fn arch(&self) -> ArchTag {
        A::TAG
    }

    pub fn class(reg: Register) -> Option<RegisterClass> {
        A::slot(reg).map(Slot::class)
    }

    fn bad(reg: Register, class: RegisterClass) -> RegisterError {
        RegisterError::BadRegister {
            reg,
            class,
            arch: A::TAG,
        }
    }

    pub fn get(&self, reg: Register) -> Result<usize, RegisterError> {
        match A::slot(reg) {
            Some(Slot::Integer(i)) => Ok(self.ints[i]),
            Some(Slot::Ip) => Ok(self.ip),
            _ => Err(Self::bad(reg, RegisterClass::Integer)),
        }
    }

    pub fn set(&mut self, reg: Register, value: usize) -> Result<(), RegisterError> {
        match A::slot(reg) {
            Some(Slot::Integer(i)) => self.ints[i] = value,
            Some(Slot::Ip) => self.ip = value,
            _ => return Err(Self::bad(reg, RegisterClass::Integer)),
        }
        Ok(())
    }

    /// The raw bits of a floating-point register.
    pub fn get_float(&self, reg: Register) -> Result<u64, RegisterError> {
        match A::slot(reg) {
            Some(Slot::Float(i)) => Ok(self.floats[i]),
            _ => Err(Self::bad(reg, RegisterClass::Float)),
        }
    }

    pub fn set_float(&mut self, reg: Register, bits: u64) -> Result<(), RegisterError> {
        match A::slot(reg) {
            Some(Slot::Float(i)) => self.floats[i] = bits,
            _ => return Err(Self::bad(reg, RegisterClass::Float)),
        }
        Ok(())
    }

    pub fn get_vector(&self, reg: Register) -> Result<u128, RegisterError> {
        match A::slot(reg) {
            Some(Slot::Vector(i)) => Ok(self.vectors[i]),
            _ => Err(Self::bad(reg, RegisterClass::Vector)),
        }
    }

    pub fn set_vector(&mut self, reg: Register, bits: u128) -> Result<(), RegisterError> {
        match A::slot(reg) {
            Some(Slot::Vector(i)) => self.vectors[i] = bits,
            _ => return Err(Self::bad(reg, RegisterClass::Vector)),
        }
        Ok(())
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub fn sp(&self) -> usize {
        self.get(A::SP).unwrap_or_default()
    }

    pub fn set_sp(&mut self, sp: usize) {
        // SP is an integer register on every architecture we describe.
        let _ = self.set(A::SP, sp);
    }

    pub fn fp(&self) -> usize {
        self.get(A::FP).unwrap_or_default()
    }

    /// Builder-style setter for tests and for seeding a walk.
    pub fn with(mut self, reg: Register, value: usize) -> Self {
        let _ = self.set(reg, value);
        self
    }
}

impl<A: Arch> fmt::Debug for Registers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"arch", &A::TAG);
        map.entry(&"ip", &format_args!("{:#x}", self.ip));
        for n in 0..=A::HIGHEST_REGISTER {
            let reg = Register(n);
            if let Some(Slot::Integer(i)) = A::slot(reg) {
                if self.ints[i] != 0 {
                    map.entry(&reg, &format_args!("{:#x}", self.ints[i]));
                }
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_slots() {
        let mut regs = Registers::<X86_64>::new();
        regs.set(X86_64::RBX, 7).unwrap();
        regs.set_vector(X86_64::XMM0, 0x1234).unwrap();
        assert_eq!(regs.get(X86_64::RBX).unwrap(), 7);
        assert_eq!(regs.get_vector(X86_64::XMM0).unwrap(), 0x1234);
        assert!(matches!(
            regs.set_float(X86_64::RBX, 1),
            Err(RegisterError::BadRegister {
                class: RegisterClass::Float,
                ..
            })
        ));
        assert!(regs.get(Register(200)).is_err());
    }

    #[test]
    fn return_address_column_aliases_ip_on_x86_64() {
        let mut regs = Registers::<X86_64>::new();
        regs.set(X86_64::RIP, 0x4000).unwrap();
        assert_eq!(regs.ip(), 0x4000);
        regs.set_sp(0x7000);
        assert_eq!(regs.get(X86_64::RSP).unwrap(), 0x7000);
    }
}
