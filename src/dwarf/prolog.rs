//! Runs the CFI program of a function up to a pc, producing the row of the
//! table that applies there.

use alloc::vec::Vec;

use super::parse::{decode_fde, CfiError, CieInfo, EncodingBases, Expr, FdeInfo, Instruction, Instructions};
use crate::{
    addr_space::AddressSpace,
    registers::{Arch, Register},
};

/// Rules are tracked for registers `0..MAX_REGISTERS`. Every [`Arch`] keeps its
/// catalog below that.
pub const MAX_REGISTERS: usize = 128;

/// How deep `DW_CFA_remember_state` may nest.
pub const MAX_REMEMBER_DEPTH: usize = 16;

/// Where the caller's value of a register can be found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRule {
    /// No rule, the register keeps its value (also used for "same value").
    #[default]
    Unused,
    /// The register has no recoverable value in the previous frame.
    Undefined,
    /// The value is in another register of the callee.
    InRegister(Register),
    /// The value is saved at CFA+N.
    InCfa(i64),
    /// Like `InCfa`, but the saved value is XOR-ed with the window cookie.
    InCfaDecrypted(i64),
    /// The value is saved at the address the expression computes.
    AtExpression(Expr),
    /// The value is what the expression computes.
    IsExpression(Expr),
    /// The value is CFA+N.
    OffsetFromCfa(i64),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule {
    /// No CFA rule has been given.
    #[default]
    Undefined,
    RegisterOffset {
        register: Register,
        offset: i64,
    },
    Expression(Expr),
}

/// One row of the CFI table: the CFA rule and a rule for every register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrologInfo {
    pub cfa: CfaRule,
    registers: [RegisterRule; MAX_REGISTERS],
    pub return_address_register: Register,
    /// `DW_CFA_GNU_args_size`
    pub args_size: u64,
    /// Toggled by `DW_CFA_AARCH64_negate_ra_state`.
    pub ra_signed: bool,
    pub signal_frame: bool,
}

impl PrologInfo {
    pub fn new(return_address_register: Register) -> Self {
        Self {
            cfa: CfaRule::Undefined,
            registers: [RegisterRule::Unused; MAX_REGISTERS],
            return_address_register,
            args_size: 0,
            ra_signed: false,
            signal_frame: false,
        }
    }

    pub fn rule(&self, reg: Register) -> RegisterRule {
        self.registers
            .get(usize::from(reg.0))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_rule(&mut self, reg: Register, rule: RegisterRule) -> Result<(), CfiError> {
        let slot = self
            .registers
            .get_mut(usize::from(reg.0))
            .ok_or(CfiError::BadRegister(u64::from(reg.0)))?;
        *slot = rule;
        Ok(())
    }

    /// Registers that have a rule other than [`RegisterRule::Unused`].
    pub fn rules(&self) -> impl Iterator<Item = (Register, RegisterRule)> + '_ {
        self.registers
            .iter()
            .enumerate()
            .filter(|(_, rule)| **rule != RegisterRule::Unused)
            .map(|(n, rule)| (Register(n as u16), *rule))
    }
}

/// Decodes the FDE at `fde` and computes the row for `pc`.
pub fn parse_prolog<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    fde: usize,
    pc: usize,
    bases: &EncodingBases,
) -> Result<(PrologInfo, FdeInfo, CieInfo), CfiError> {
    let bases = EncodingBases {
        func: None,
        ..*bases
    };
    let (fde, cie) = decode_fde(space, fde, &bases)?;
    let bases = EncodingBases {
        func: Some(fde.pc_start),
        ..bases
    };
    let prolog = run_prolog::<A, S>(space, &cie, &fde, pc, &bases)?;
    Ok((prolog, fde, cie))
}

/// Runs the initial instructions of `cie`, then the instructions of `fde`
/// that apply to locations at or before `pc`.
#[instrument(level = "trace", skip_all, fields(fde = fde.address, pc = pc), err)]
pub fn run_prolog<A: Arch, S: AddressSpace + ?Sized>(
    space: &S,
    cie: &CieInfo,
    fde: &FdeInfo,
    pc: usize,
    bases: &EncodingBases,
) -> Result<PrologInfo, CfiError> {
    let mut initial = PrologInfo::new(cie.return_address_register);
    initial.signal_frame = cie.is_signal_frame;
    let mut machine = Machine::<A>::new(initial);
    machine.run(
        Instructions::new(space, cie.initial_instructions.clone(), cie, bases, A::VENDOR_CFA_OP),
        usize::MAX,
        fde.pc_start,
        None,
    )?;

    let initial = machine.row.clone();
    machine.remembered.clear();
    machine.run(
        Instructions::new(space, fde.instructions.clone(), cie, bases, A::VENDOR_CFA_OP),
        pc,
        fde.pc_start,
        Some(&initial),
    )?;
    Ok(machine.row)
}

struct Machine<A> {
    row: PrologInfo,
    remembered: Vec<PrologInfo>,
    _arch: core::marker::PhantomData<A>,
}

impl<A: Arch> Machine<A> {
    fn new(row: PrologInfo) -> Self {
        Self {
            row,
            remembered: Vec::new(),
            _arch: core::marker::PhantomData,
        }
    }

    fn check(reg: Register) -> Result<Register, CfiError> {
        if reg.0 > A::HIGHEST_REGISTER {
            return Err(CfiError::BadRegister(u64::from(reg.0)));
        }
        Ok(reg)
    }

    fn set(&mut self, reg: Register, rule: RegisterRule) -> Result<(), CfiError> {
        self.row.set_rule(Self::check(reg)?, rule)
    }

    fn run<S: AddressSpace + ?Sized>(
        &mut self,
        instructions: Instructions<'_, S>,
        pc: usize,
        start: usize,
        initial: Option<&PrologInfo>,
    ) -> Result<(), CfiError> {
        let mut location = start;
        for instruction in instructions {
            let instruction = instruction?;
            trace!(location, ?instruction);
            match instruction {
                Instruction::SetLoc(to) => {
                    if to > pc {
                        break;
                    }
                    location = to;
                }
                Instruction::AdvanceLoc(delta) => {
                    let to = location.wrapping_add(delta as usize);
                    if to > pc {
                        break;
                    }
                    location = to;
                }
                Instruction::DefCfa { register, offset } => {
                    self.row.cfa = CfaRule::RegisterOffset {
                        register: Self::check(register)?,
                        offset,
                    };
                }
                Instruction::DefCfaRegister(register) => {
                    let offset = match self.row.cfa {
                        CfaRule::RegisterOffset { offset, .. } => offset,
                        _ => 0,
                    };
                    self.row.cfa = CfaRule::RegisterOffset {
                        register: Self::check(register)?,
                        offset,
                    };
                }
                Instruction::DefCfaOffset(offset) => match &mut self.row.cfa {
                    CfaRule::RegisterOffset { offset: o, .. } => *o = offset,
                    _ => return Err(CfiError::CfaNotRegister),
                },
                Instruction::DefCfaExpression(expr) => self.row.cfa = CfaRule::Expression(expr),
                Instruction::Undefined(reg) => self.set(reg, RegisterRule::Undefined)?,
                Instruction::SameValue(reg) => self.set(reg, RegisterRule::Unused)?,
                Instruction::Offset { register, offset } => {
                    self.set(register, RegisterRule::InCfa(offset))?
                }
                Instruction::ValOffset { register, offset } => {
                    self.set(register, RegisterRule::OffsetFromCfa(offset))?
                }
                Instruction::Register { register, from } => {
                    self.set(register, RegisterRule::InRegister(Self::check(from)?))?
                }
                Instruction::Expression { register, expr } => {
                    self.set(register, RegisterRule::AtExpression(expr))?
                }
                Instruction::ValExpression { register, expr } => {
                    self.set(register, RegisterRule::IsExpression(expr))?
                }
                Instruction::Restore(reg) => {
                    let rule = initial.map(|i| i.rule(reg)).unwrap_or_default();
                    self.set(reg, rule)?;
                }
                Instruction::RememberState => {
                    if self.remembered.len() >= MAX_REMEMBER_DEPTH {
                        return Err(CfiError::RememberOverflow(MAX_REMEMBER_DEPTH));
                    }
                    self.remembered.push(self.row.clone());
                }
                Instruction::RestoreState => {
                    self.row = self.remembered.pop().ok_or(CfiError::RestoreUnderflow)?;
                }
                Instruction::ArgsSize(size) => self.row.args_size = size,
                Instruction::NegateRaState => self.row.ra_signed = !self.row.ra_signed,
                Instruction::WindowSave => self.window_save()?,
                Instruction::Nop => {}
            }
        }
        Ok(())
    }

    /// After a `save`, the caller's outs are the callee's ins, and the
    /// caller's locals and ins were spilled to the save area at the CFA.
    fn window_save(&mut self) -> Result<(), CfiError> {
        for reg in 8..16 {
            self.set(Register(reg), RegisterRule::InRegister(Register(reg + 16)))?;
        }
        for reg in 16..32 {
            let offset = i64::from(reg - 16) * core::mem::size_of::<usize>() as i64;
            self.set(Register(reg), RegisterRule::InCfaDecrypted(offset))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addr_space::Snapshot,
        dwarf::testutil::EhFrameBuilder,
        registers::{AArch64, Sparc64, X86_64},
    };

    const BASE: usize = 0x10_0000;

    fn build(cie_instructions: &[u8], fde_instructions: &[u8]) -> (alloc::vec::Vec<u8>, usize) {
        let mut b = EhFrameBuilder::new(BASE);
        let cie = b.cie("zR", &[0x1b], 1, -8, 16, cie_instructions);
        let fde = b.fde(cie, 0x4000, 0x100, &[], fde_instructions);
        (b.finish(), fde)
    }

    fn prolog_at(bytes: &[u8], fde: usize, pc: usize) -> Result<PrologInfo, CfiError> {
        let space = Snapshot::native().with_region(BASE, bytes);
        parse_prolog::<X86_64, _>(&space, fde, pc, &EncodingBases::default()).map(|(p, _, _)| p)
    }

    #[rustfmt::skip]
    const CIE: &[u8] = &[
        0x0c, 7, 8, // DW_CFA_def_cfa: RSP +8
        0x90, 1,    // DW_CFA_offset: RIP -8
    ];

    #[test]
    fn rows_apply_at_or_before_pc() {
        #[rustfmt::skip]
        let fde = [
            0x41,       // DW_CFA_advance_loc: 1
            0x0e, 16,   // DW_CFA_def_cfa_offset: +16
            0x86, 2,    // DW_CFA_offset: RBP -16
            0x43,       // DW_CFA_advance_loc: 3
            0x0d, 6,    // DW_CFA_def_cfa_register: RBP
        ];
        let (bytes, fde_addr) = build(CIE, &fde);

        let p = prolog_at(&bytes, fde_addr, 0x4000).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RSP, offset: 8 });
        assert_eq!(p.rule(X86_64::RBP), RegisterRule::Unused);
        assert_eq!(p.rule(X86_64::RIP), RegisterRule::InCfa(-8));

        let p = prolog_at(&bytes, fde_addr, 0x4001).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RSP, offset: 16 });
        assert_eq!(p.rule(X86_64::RBP), RegisterRule::InCfa(-16));

        let p = prolog_at(&bytes, fde_addr, 0x4003).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RSP, offset: 16 });

        let p = prolog_at(&bytes, fde_addr, 0x4004).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RBP, offset: 16 });
    }

    #[test]
    fn remember_and_restore_state() {
        #[rustfmt::skip]
        let fde = [
            0x0e, 16,   // DW_CFA_def_cfa_offset: +16
            0x83, 2,    // DW_CFA_offset: RBX -16
            0x0a,       // DW_CFA_remember_state
            0x41,       // DW_CFA_advance_loc: 1
            0x0e, 8,    // DW_CFA_def_cfa_offset: +8
            0xc3,       // DW_CFA_restore: RBX
            0x41,       // DW_CFA_advance_loc: 1
            0x0b,       // DW_CFA_restore_state
        ];
        let (bytes, fde_addr) = build(CIE, &fde);

        let p = prolog_at(&bytes, fde_addr, 0x4001).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RSP, offset: 8 });
        assert_eq!(p.rule(X86_64::RBX), RegisterRule::Unused);

        let p = prolog_at(&bytes, fde_addr, 0x4002).unwrap();
        assert_eq!(p.cfa, CfaRule::RegisterOffset { register: X86_64::RSP, offset: 16 });
        assert_eq!(p.rule(X86_64::RBX), RegisterRule::InCfa(-16));
    }

    #[test]
    fn remember_depth_is_bounded() {
        let fde = [0x0a; MAX_REMEMBER_DEPTH + 1];
        let (bytes, fde_addr) = build(CIE, &fde);
        assert_eq!(
            prolog_at(&bytes, fde_addr, 0x4000),
            Err(CfiError::RememberOverflow(MAX_REMEMBER_DEPTH))
        );

        let (bytes, fde_addr) = build(CIE, &[0x0b]);
        assert_eq!(prolog_at(&bytes, fde_addr, 0x4000), Err(CfiError::RestoreUnderflow));
    }

    #[test]
    fn register_outside_the_catalog_is_rejected() {
        // DW_CFA_offset_extended: r200 -8
        let (bytes, fde_addr) = build(CIE, &[0x05, 0xc8, 0x01, 0x01]);
        assert_eq!(prolog_at(&bytes, fde_addr, 0x4000), Err(CfiError::BadRegister(200)));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let (bytes, fde_addr) = build(CIE, &[0x3f]);
        assert_eq!(prolog_at(&bytes, fde_addr, 0x4000), Err(CfiError::UnknownOpcode(0x3f)));
        // 0x2d means nothing on x86_64
        let (bytes, fde_addr) = build(CIE, &[0x2d]);
        assert_eq!(prolog_at(&bytes, fde_addr, 0x4000), Err(CfiError::UnknownOpcode(0x2d)));
    }

    #[test]
    fn args_size_and_value_rules() {
        #[rustfmt::skip]
        let fde = [
            0x2e, 0x10,       // DW_CFA_GNU_args_size: 16
            0x14, 3, 2,       // DW_CFA_val_offset: RBX CFA-16
            0x09, 12, 13,     // DW_CFA_register: R12 in R13
            0x07, 14,         // DW_CFA_undefined: R14
            0x08, 15,         // DW_CFA_same_value: R15
        ];
        let (bytes, fde_addr) = build(CIE, &fde);
        let p = prolog_at(&bytes, fde_addr, 0x4000).unwrap();
        assert_eq!(p.args_size, 16);
        assert_eq!(p.rule(X86_64::RBX), RegisterRule::OffsetFromCfa(-16));
        assert_eq!(p.rule(X86_64::R12), RegisterRule::InRegister(X86_64::R13));
        assert_eq!(p.rule(X86_64::R14), RegisterRule::Undefined);
        assert_eq!(p.rule(X86_64::R15), RegisterRule::Unused);
    }

    #[test]
    fn vendor_opcode_depends_on_the_architecture() {
        let (bytes, fde_addr) = build(&[0x0c, 31, 0], &[0x2d, 0x41, 0x2d, 0x41, 0x2d]);
        let space = Snapshot::native().with_region(BASE, &bytes);
        let bases = EncodingBases::default();

        let (p, _, _) = parse_prolog::<AArch64, _>(&space, fde_addr, 0x4000, &bases).unwrap();
        assert!(p.ra_signed);
        let (p, _, _) = parse_prolog::<AArch64, _>(&space, fde_addr, 0x4001, &bases).unwrap();
        assert!(!p.ra_signed);

        let (p, _, _) = parse_prolog::<Sparc64, _>(&space, fde_addr, 0x4000, &bases).unwrap();
        assert_eq!(p.rule(Sparc64::O7), RegisterRule::InRegister(Sparc64::I7));
        assert_eq!(p.rule(Sparc64::L0), RegisterRule::InCfaDecrypted(0));
        assert_eq!(p.rule(Sparc64::I7), RegisterRule::InCfaDecrypted(15 * 8));
    }
}
