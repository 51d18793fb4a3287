use alloc::vec::Vec;

use super::*;
use crate::{
    addr_space::Snapshot,
    dwarf::{parse::Expr, testutil::EhFrameBuilder},
    registers::{AArch64, Sparc64, X86_64},
};

const EH_FRAME: usize = 0x10_0000;
const STACK: usize = 0x7000;

fn words(values: &[usize]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

#[test]
fn saved_register_is_read_at_cfa_offset() {
    #[rustfmt::skip]
    let cie = [
        0x0c, 7, 8, // DW_CFA_def_cfa: RSP +8
        0x90, 1,    // DW_CFA_offset: RIP -8
    ];
    #[rustfmt::skip]
    let fde = [
        0x41,       // DW_CFA_advance_loc: 1
        0x0e, 16,   // DW_CFA_def_cfa_offset: +16
        0x86, 2,    // DW_CFA_offset: RBP -16
    ];
    let mut b = EhFrameBuilder::new(EH_FRAME);
    let cie = b.cie("zR", &[0x1b], 1, -8, 16, &cie);
    let fde = b.fde(cie, 0x4000, 0x100, &[], &fde);
    let frame = b.finish();
    let stack = words(&[0x1111, 0x5555]);
    let space = Snapshot::native()
        .with_region(EH_FRAME, &frame)
        .with_region(STACK, &stack);

    let mut regs = Registers::<X86_64>::new()
        .with(X86_64::RSP, STACK)
        .with(X86_64::RBP, 0xdead)
        .with(X86_64::RBX, 0xb0b);
    regs.set_ip(0x4001);
    let location = UnwindInfoLocation::Dwarf {
        fde,
        bases: EncodingBases::default(),
    };

    let outcome = step(&space, 0x4001, &location, &regs).unwrap();
    assert!(!outcome.signal_frame);
    let new = outcome.registers;
    assert_eq!(new.get(X86_64::RBP), Ok(0x1111));
    assert_eq!(new.sp(), STACK + 16);
    assert_eq!(new.ip(), 0x5555);
    assert_eq!(new.get(X86_64::RBX), Ok(0xb0b));
    // The callee's registers are untouched.
    assert_eq!(regs.get(X86_64::RBP), Ok(0xdead));
}

#[test]
fn in_register_reads_the_old_context() {
    let stack = words(&[0x5555]);
    let space = Snapshot::native().with_region(STACK, &stack);
    let mut prolog = PrologInfo::new(X86_64::RIP);
    prolog.cfa = CfaRule::RegisterOffset {
        register: X86_64::RSP,
        offset: 8,
    };
    prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-8)).unwrap();
    prolog.set_rule(X86_64::RBX, RegisterRule::InRegister(X86_64::R12)).unwrap();
    prolog.set_rule(X86_64::R12, RegisterRule::InRegister(X86_64::RBX)).unwrap();
    let regs = Registers::<X86_64>::new()
        .with(X86_64::RSP, STACK)
        .with(X86_64::RBX, 1)
        .with(X86_64::R12, 2);

    let new = apply_prolog(&space, &prolog, &regs).unwrap();
    assert_eq!(new.get(X86_64::RBX), Ok(2));
    assert_eq!(new.get(X86_64::R12), Ok(1));
}

#[test]
fn value_and_expression_rules() {
    #[rustfmt::skip]
    let code = [
        0x23, 0x10, // DW_OP_plus_uconst: 16
        0x06,       // DW_OP_deref
    ];
    const CODE: usize = 0x9000;
    let stack = words(&[0x5555, 0xaaaa, 0xbbbb, 0xcccc]);
    let space = Snapshot::native()
        .with_region(STACK, &stack)
        .with_region(CODE, &code);

    let mut prolog = PrologInfo::new(X86_64::RIP);
    prolog.cfa = CfaRule::RegisterOffset {
        register: X86_64::RSP,
        offset: 8,
    };
    prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-8)).unwrap();
    // CFA + 16
    let address = Expr { start: CODE, len: 2 };
    // [CFA + 16]
    let value = Expr { start: CODE, len: 3 };
    prolog.set_rule(X86_64::RBX, RegisterRule::IsExpression(address)).unwrap();
    prolog.set_rule(X86_64::R12, RegisterRule::AtExpression(address)).unwrap();
    prolog.set_rule(X86_64::R13, RegisterRule::IsExpression(value)).unwrap();
    prolog.set_rule(X86_64::R14, RegisterRule::OffsetFromCfa(-8)).unwrap();
    prolog.set_rule(X86_64::R15, RegisterRule::Undefined).unwrap();
    let regs = Registers::<X86_64>::new()
        .with(X86_64::RSP, STACK)
        .with(X86_64::R15, 15);

    let new = apply_prolog(&space, &prolog, &regs).unwrap();
    let cfa = STACK + 8;
    assert_eq!(new.get(X86_64::RBX), Ok(cfa + 16));
    assert_eq!(new.get(X86_64::R12), Ok(0xcccc));
    assert_eq!(new.get(X86_64::R13), Ok(0xcccc));
    assert_eq!(new.get(X86_64::R14), Ok(STACK));
    assert_eq!(new.get(X86_64::R15), Ok(0));
}

#[test]
fn cfa_expression_starts_from_zero() {
    #[rustfmt::skip]
    let code = [
        0x77, 0x08, // DW_OP_breg7: RSP +8
        0x22,       // DW_OP_plus
    ];
    const CODE: usize = 0x9000;
    let stack = words(&[0x5555]);
    let space = Snapshot::native()
        .with_region(STACK, &stack)
        .with_region(CODE, &code);
    let mut prolog = PrologInfo::new(X86_64::RIP);
    prolog.cfa = CfaRule::Expression(Expr { start: CODE, len: 3 });
    prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-8)).unwrap();
    let regs = Registers::<X86_64>::new().with(X86_64::RSP, STACK);

    assert_eq!(cfa(&space, &prolog, &regs), Ok(STACK + 8));
    assert_eq!(apply_prolog(&space, &prolog, &regs).unwrap().ip(), 0x5555);
}

#[test]
fn failures_are_classified() {
    let space = Snapshot::native();
    let regs = Registers::<X86_64>::new().with(X86_64::RSP, STACK);

    let prolog = PrologInfo::new(X86_64::RIP);
    let err = apply_prolog(&space, &prolog, &regs).unwrap_err();
    assert_eq!(err, StepError::UnresolvableCfa);
    assert_eq!(err.failure(), StepFailure::BadFrame);

    let mut prolog = PrologInfo::new(X86_64::RIP);
    prolog.cfa = CfaRule::RegisterOffset {
        register: X86_64::RSP,
        offset: 8,
    };
    prolog.set_rule(X86_64::RIP, RegisterRule::InCfa(-8)).unwrap();
    let err = apply_prolog(&space, &prolog, &regs).unwrap_err();
    assert!(matches!(err, StepError::Memory(_)), "{err:?}");
    assert_eq!(err.failure(), StepFailure::BadFrame);

    let stack = words(&[0x5555]);
    let space = Snapshot::native().with_region(STACK, &stack);
    prolog.set_rule(X86_64::XMM0, RegisterRule::OffsetFromCfa(0)).unwrap();
    let err = apply_prolog(&space, &prolog, &regs).unwrap_err();
    assert_eq!(
        err,
        StepError::UnsupportedRule {
            register: X86_64::XMM0,
            rule: RegisterRule::OffsetFromCfa(0)
        }
    );
    assert_eq!(err.failure(), StepFailure::BadRegister);
}

#[test]
fn leaf_return_address_stays_in_lr() {
    let space = Snapshot::native();
    let mut prolog = PrologInfo::new(AArch64::LR);
    prolog.cfa = CfaRule::RegisterOffset {
        register: AArch64::SP,
        offset: 0,
    };
    let regs = Registers::<AArch64>::new()
        .with(AArch64::SP, STACK)
        .with(AArch64::LR, 0x40_1000);

    let new = apply_prolog(&space, &prolog, &regs).unwrap();
    assert_eq!(new.ip(), 0x40_1000);
    assert_eq!(new.sp(), STACK);
}

#[test]
fn signed_return_address_and_float_saves() {
    let stack = words(&[0x4010_0000_0000_0000, 0x002a_0000_0040_1234]);
    let space = Snapshot::native().with_region(STACK, &stack);
    let mut prolog = PrologInfo::new(AArch64::LR);
    prolog.cfa = CfaRule::RegisterOffset {
        register: AArch64::SP,
        offset: 16,
    };
    prolog.ra_signed = true;
    prolog.set_rule(AArch64::LR, RegisterRule::InCfa(-8)).unwrap();
    prolog.set_rule(AArch64::D8, RegisterRule::InCfa(-16)).unwrap();
    let regs = Registers::<AArch64>::new().with(AArch64::SP, STACK);

    let new = apply_prolog(&space, &prolog, &regs).unwrap();
    assert_eq!(new.ip(), 0x40_1234);
    assert_eq!(new.get_float(AArch64::D8), Ok(4.0f64.to_bits()));
}

#[test]
fn sparc_window_is_decrypted_and_return_skips_delay_slot() {
    let stack = words(&[0x12ff]);
    let space = Snapshot::native().with_region(STACK, &stack);
    let mut prolog = PrologInfo::new(Sparc64::O7);
    prolog.cfa = CfaRule::RegisterOffset {
        register: Sparc64::FP,
        offset: 0,
    };
    prolog.set_rule(Sparc64::O7, RegisterRule::InRegister(Sparc64::I7)).unwrap();
    prolog.set_rule(Sparc64::L0, RegisterRule::InCfaDecrypted(0)).unwrap();
    let regs = Registers::<Sparc64>::new()
        .with(Sparc64::FP, STACK)
        .with(Sparc64::I7, 0x1000)
        .with(Sparc64::WINDOW_COOKIE, 0xff);

    let new = apply_prolog(&space, &prolog, &regs).unwrap();
    assert_eq!(new.get(Sparc64::L0), Ok(0x1200));
    assert_eq!(new.ip(), 0x1008);
}

#[test]
fn compact_location() {
    let stack = words(&[0x1111, 0x5555]);
    let space = Snapshot::native().with_region(STACK, &stack);
    let regs = Registers::<X86_64>::new()
        .with(X86_64::RSP, STACK - 0x40)
        .with(X86_64::RBP, STACK);

    let location = UnwindInfoLocation::Compact {
        encoding: CompactEncoding(0x0100_0000),
        function_start: 0x4000,
    };
    let new = step(&space, 0x4010, &location, &regs).unwrap().registers;
    assert_eq!(new.get(X86_64::RBP), Ok(0x1111));
    assert_eq!(new.ip(), 0x5555);
    assert_eq!(new.sp(), STACK + 16);

    let location = UnwindInfoLocation::Compact {
        encoding: CompactEncoding(0x0400_0080),
        function_start: 0x4000,
    };
    assert_eq!(
        step(&space, 0x4010, &location, &regs),
        Err(StepError::DwarfEscape(0x80))
    );
}
