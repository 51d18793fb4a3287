use super::{Arch, ArchTag, Register, Registers, Slot};
use crate::addr_space::{AddressSpace, MemoryError};

/// 64-bit PowerPC (ELFv1 and ELFv2).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Ppc64;

impl Ppc64 {
    pub const R1: Register = Register(1);
    /// The TOC pointer.
    pub const R2: Register = Register(2);
    pub const R31: Register = Register(31);
    pub const F0: Register = Register(32);
    pub const LR: Register = Register(65);
    pub const CTR: Register = Register(66);
    pub const V0: Register = Register(77);

    /// `ld r2, 24(r1)`, the TOC restore after a cross-module call on ELFv2.
    const LD_R2_24_R1: u32 = 0xe841_0018;
    /// `ld r2, 40(r1)`, the same on ELFv1.
    const LD_R2_40_R1: u32 = 0xe841_0028;
}

impl Arch for Ppc64 {
    const TAG: ArchTag = ArchTag::Ppc64;
    const HIGHEST_REGISTER: u16 = 108;
    const SP: Register = Self::R1;
    const FP: Register = Self::R31;
    const RETURN_ADDRESS: Register = Self::LR;

    fn slot(reg: Register) -> Option<Slot> {
        match reg.0 {
            n @ 0..=31 => Some(Slot::Integer(n as usize)),
            n @ 32..=63 => Some(Slot::Float((n - 32) as usize)),
            65 => Some(Slot::Integer(32)),
            66 => Some(Slot::Integer(33)),
            n @ 77..=108 => Some(Slot::Vector((n - 77) as usize)),
            _ => None,
        }
    }

    /// The linker-generated call stub saved r2 in the caller's frame and the
    /// caller reloads it right after the call. CFI does not know about that
    /// save, so we do the reload ourselves.
    fn repair_after_return<S: AddressSpace + ?Sized>(
        space: &S,
        regs: &mut Registers<Self>,
    ) -> Result<(), MemoryError> {
        let offset = match space.get32(regs.ip())? {
            Self::LD_R2_24_R1 => 24,
            Self::LD_R2_40_R1 => 40,
            _ => return Ok(()),
        };
        let toc = space.get_pointer(regs.sp().wrapping_add(offset))?;
        trace!("restoring TOC r2={toc:#x} from sp+{offset}");
        // r2 is an integer register, see `slot`.
        let _ = regs.set(Self::R2, toc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_space::{Endian, Snapshot};

    #[test]
    fn reloads_toc_after_cross_module_call() {
        let code = 0xe841_0018u32.to_be_bytes();
        let stack = 0x1122_3344_5566_7788u64.to_be_bytes();
        let space = Snapshot::new(Endian::Big)
            .with_region(0x1000, &code)
            .with_region(0x8000 + 24, &stack);

        let mut regs = Registers::<Ppc64>::new();
        regs.set_ip(0x1000);
        regs.set_sp(0x8000);
        Ppc64::repair_after_return(&space, &mut regs).unwrap();
        assert_eq!(regs.get(Ppc64::R2).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn other_instructions_leave_r2_alone() {
        let code = 0x6000_0000u32.to_be_bytes(); // nop
        let space = Snapshot::new(Endian::Big).with_region(0x1000, &code);
        let mut regs = Registers::<Ppc64>::new().with(Ppc64::R2, 5);
        regs.set_ip(0x1000);
        Ppc64::repair_after_return(&space, &mut regs).unwrap();
        assert_eq!(regs.get(Ppc64::R2).unwrap(), 5);
    }
}
