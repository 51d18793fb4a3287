use alloc::vec::Vec;

use super::*;
use crate::{
    addr_space::{Endian, Snapshot},
    dwarf::testutil::EhFrameBuilder,
};

const BASE: usize = 0x1000;

fn instructions<S: AddressSpace>(
    space: &S,
    range: Range<usize>,
    cie: &CieInfo,
    vendor: VendorCfaOp,
) -> Result<Vec<Instruction>> {
    Instructions::new(space, range, cie, &EncodingBases::default(), vendor).collect()
}

#[test]
fn parse_simple_cie() {
    #[rustfmt::skip]
    let data = [
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        0x7a, 0x52, 0, 1,
        0x78, 0x10, 1,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
    ];
    let space = Snapshot::new(Endian::Little).with_region(BASE, &data);

    let cie = decode_cie(&space, BASE, &EncodingBases::default()).unwrap();

    assert_eq!(
        cie,
        CieInfo {
            address: BASE,
            length: 0x18,
            version: 1,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
            return_address_register: Register(16),
            initial_instructions: BASE + 0x11..BASE + 0x18,
            pointer_encoding: Encoding(0x1b),
            lsda_encoding: Encoding::OMIT,
            personality: None,
            has_augmentation_data: true,
            is_signal_frame: false,
            addresses_signed_with_b_key: false,
            mte_tagged_frame: false,
        }
    );

    assert_eq!(
        instructions(&space, cie.initial_instructions.clone(), &cie, VendorCfaOp::None),
        Ok(alloc::vec![
            Instruction::DefCfa {
                register: Register(7),
                offset: 8
            },
            Instruction::Offset {
                register: Register(16),
                offset: -8
            },
            Instruction::Nop,
            Instruction::Nop,
        ])
    );

    // llvm-dwarfdump output:
    /*
    00000000 00000014 00000000 CIE
    Format:                DWARF32
    Version:               1
    Augmentation:          "zR"
    Code alignment factor: 1
    Data alignment factor: -8
    Return address column: 16
    Augmentation data:     1B

    DW_CFA_def_cfa: RSP +8
    DW_CFA_offset: RIP -8
    DW_CFA_nop:
    DW_CFA_nop:

    CFA=RSP+8: RIP=[CFA-8]
    */
}

#[test]
fn cie_with_personality_and_lsda() {
    const PERSONALITY: usize = 0x7777_0000;
    let mut aug = Vec::new();
    aug.push(0x1b); // R: pcrel | sdata4
    aug.push(0x00); // P: absptr
    aug.extend_from_slice(&PERSONALITY.to_ne_bytes());
    aug.push(0x00); // L: absptr

    let mut b = EhFrameBuilder::new(BASE);
    let cie = b.cie("zRPL", &aug, 1, -8, 16, &[]);
    let mut lsda = Vec::new();
    lsda.extend_from_slice(&0x5555_0000usize.to_ne_bytes());
    let with_lsda = b.fde(cie, 0x40_0000, 0x20, &lsda, &[0x41]);
    let without_lsda = b.fde(cie, 0x40_0020, 0x20, &0usize.to_ne_bytes(), &[]);
    let frame = b.finish();
    let space = Snapshot::native().with_region(BASE, &frame);
    let bases = EncodingBases::default();

    let (fde, cie_info) = decode_fde(&space, with_lsda, &bases).unwrap();
    assert_eq!(cie_info.personality, Some(PERSONALITY));
    assert_eq!(cie_info.lsda_encoding, Encoding(0));
    assert_eq!(fde.cie, cie);
    assert_eq!((fde.pc_start, fde.pc_end), (0x40_0000, 0x40_0020));
    assert_eq!(fde.lsda, Some(0x5555_0000));
    assert!(fde.covers(0x40_001f));
    assert!(!fde.covers(0x40_0020));
    assert_eq!(
        instructions(&space, fde.instructions.clone(), &cie_info, VendorCfaOp::None)
            .unwrap()
            .first(),
        Some(&Instruction::AdvanceLoc(1))
    );

    let (fde, _) = decode_fde(&space, without_lsda, &bases).unwrap();
    assert_eq!(fde.lsda, None);
}

#[test]
fn signal_frame_and_pointer_auth_augmentations() {
    let mut b = EhFrameBuilder::new(BASE);
    let cie = b.cie("zRSB", &[0x1b], 4, -8, 30, &[]);
    let frame = b.finish();
    let space = Snapshot::native().with_region(BASE, &frame);

    let cie = decode_cie(&space, cie, &EncodingBases::default()).unwrap();
    assert!(cie.is_signal_frame);
    assert!(cie.addresses_signed_with_b_key);
    assert!(!cie.mte_tagged_frame);
    assert_eq!(cie.code_alignment_factor, 4);
    assert_eq!(cie.return_address_register, Register(30));
}

#[test]
fn version_3_and_64_bit_length() {
    #[rustfmt::skip]
    let data = [
        0xff, 0xff, 0xff, 0xff,                 // 64-bit length follows
        0x10, 0, 0, 0, 0, 0, 0, 0,              // length
        0, 0, 0, 0,                             // CIE id
        3,                                      // version
        0,                                      // augmentation ""
        1,                                      // code alignment
        0x78,                                   // data alignment -8
        0x80, 0x01,                             // return address column 128 (ULEB)
        0, 0, 0, 0, 0, 0,                       // DW_CFA_nop
    ];
    let space = Snapshot::new(Endian::Little).with_region(BASE, &data);

    let cie = decode_cie(&space, BASE, &EncodingBases::default()).unwrap();
    assert_eq!(cie.version, 3);
    assert_eq!(cie.length, data.len());
    assert_eq!(cie.return_address_register, Register(128));
    assert!(!cie.has_augmentation_data);
    assert_eq!(cie.initial_instructions, BASE + 22..BASE + 28);
}

#[test]
fn rejects_bad_entries() {
    #[rustfmt::skip]
    let data = [
        0x08, 0, 0, 0,
        0, 0, 0, 0,
        2, 0, 1, 0x78,                          // version 2
        0x0c, 0, 0, 0,
        0, 0, 0, 0,
        1, b'Q', 0, 1,                          // augmentation "Q"
        0x78, 0x10, 0, 0,
        0, 0, 0, 0,                             // terminator
    ];
    let space = Snapshot::new(Endian::Little).with_region(BASE, &data);
    let bases = EncodingBases::default();

    assert_eq!(
        decode_cie(&space, BASE, &bases),
        Err(CfiError::UnsupportedVersion {
            addr: BASE,
            version: 2
        })
    );
    assert_eq!(
        decode_cie(&space, BASE + 12, &bases),
        Err(CfiError::UnknownAugmentation {
            addr: BASE + 12,
            aug: 'Q'
        })
    );
    assert_eq!(
        decode_fde(&space, BASE, &bases).map(|_| ()),
        Err(CfiError::NotAnFde { addr: BASE })
    );
    assert_eq!(
        decode_cie(&space, BASE + 28, &bases),
        Err(CfiError::Terminator { addr: BASE + 28 })
    );
}

#[test]
fn augmentation_data_must_fit_the_entry() {
    #[rustfmt::skip]
    let data = [
        // CIE claiming 0x40 bytes of augmentation data
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        b'z', b'R', 0, 1,
        0x78, 0x10, 0x40,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
        // well formed CIE
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        b'z', b'R', 0, 1,
        0x78, 0x10, 1,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
        // FDE of the second CIE, claiming 0x20 bytes of augmentation data
        0x10, 0, 0, 0,
        0x1c, 0, 0, 0,                          // CIE pointer
        0, 0, 0, 0,                             // pc begin
        0x10, 0, 0, 0,                          // pc range
        0x20, 0, 0, 0,
    ];
    let space = Snapshot::new(Endian::Little).with_region(BASE, &data);
    let bases = EncodingBases::default();

    assert_eq!(
        decode_cie(&space, BASE, &bases),
        Err(CfiError::AugmentationOverrun { addr: BASE, len: 0x40 })
    );
    assert!(decode_cie(&space, BASE + 24, &bases).is_ok());
    assert_eq!(
        decode_fde(&space, BASE + 48, &bases).map(|_| ()),
        Err(CfiError::AugmentationOverrun {
            addr: BASE + 48,
            len: 0x20
        })
    );
}

#[test]
fn decode_every_instruction_form() {
    #[rustfmt::skip]
    let program = [
        0x48,                   // DW_CFA_advance_loc: 8
        0x02, 0x10,             // DW_CFA_advance_loc1: 16
        0x03, 0x00, 0x01,       // DW_CFA_advance_loc2: 256
        0x0e, 0x10,             // DW_CFA_def_cfa_offset: 16
        0x86, 0x02,             // DW_CFA_offset: RBP -16
        0x0d, 0x06,             // DW_CFA_def_cfa_register: RBP
        0x11, 0x03, 0x7d,       // DW_CFA_offset_extended_sf: RBX +24
        0x2f, 0x0c, 0x02,       // DW_CFA_GNU_negative_offset_extended: R12 +16
        0x09, 0x0d, 0x00,       // DW_CFA_register: R13 in RAX
        0x07, 0x0e,             // DW_CFA_undefined: R14
        0x08, 0x0f,             // DW_CFA_same_value: R15
        0x14, 0x03, 0x01,       // DW_CFA_val_offset: RBX CFA-8
        0x0a,                   // DW_CFA_remember_state
        0x0b,                   // DW_CFA_restore_state
        0xc6,                   // DW_CFA_restore: RBP
        0x06, 0x03,             // DW_CFA_restore_extended: RBX
        0x2e, 0x20,             // DW_CFA_GNU_args_size: 32
        0x0f, 0x02, 0x77, 0x08, // DW_CFA_def_cfa_expression: DW_OP_breg7 +8
        0x10, 0x06, 0x01, 0x30, // DW_CFA_expression: RBP DW_OP_lit0
        0x16, 0x06, 0x01, 0x31, // DW_CFA_val_expression: RBP DW_OP_lit1
        0x00,                   // DW_CFA_nop
    ];
    let space = Snapshot::native().with_region(BASE, &program);
    let cie = CieInfo {
        address: 0,
        length: 0,
        version: 1,
        code_alignment_factor: 1,
        data_alignment_factor: -8,
        return_address_register: Register(16),
        initial_instructions: 0..0,
        pointer_encoding: Encoding(0),
        lsda_encoding: Encoding::OMIT,
        personality: None,
        has_augmentation_data: true,
        is_signal_frame: false,
        addresses_signed_with_b_key: false,
        mte_tagged_frame: false,
    };

    let decoded = instructions(&space, BASE..BASE + program.len(), &cie, VendorCfaOp::None).unwrap();

    use Instruction as I;
    assert_eq!(
        decoded,
        [
            I::AdvanceLoc(8),
            I::AdvanceLoc(16),
            I::AdvanceLoc(256),
            I::DefCfaOffset(16),
            I::Offset {
                register: Register(6),
                offset: -16
            },
            I::DefCfaRegister(Register(6)),
            I::Offset {
                register: Register(3),
                offset: 24
            },
            I::Offset {
                register: Register(12),
                offset: 16
            },
            I::Register {
                register: Register(13),
                from: Register(0)
            },
            I::Undefined(Register(14)),
            I::SameValue(Register(15)),
            I::ValOffset {
                register: Register(3),
                offset: -8
            },
            I::RememberState,
            I::RestoreState,
            I::Restore(Register(6)),
            I::Restore(Register(3)),
            I::ArgsSize(32),
            I::DefCfaExpression(Expr {
                start: BASE + 37,
                len: 2
            }),
            I::Expression {
                register: Register(6),
                expr: Expr {
                    start: BASE + 42,
                    len: 1
                }
            },
            I::ValExpression {
                register: Register(6),
                expr: Expr {
                    start: BASE + 46,
                    len: 1
                }
            },
            I::Nop,
        ]
    );
}

#[test]
fn vendor_opcode_depends_on_arch() {
    let program = [0x2d];
    let space = Snapshot::native().with_region(BASE, &program);
    let mut b = EhFrameBuilder::new(0x8000);
    b.cie("z", &[], 1, -8, 16, &[]);
    let frame = b.finish();
    let cie_space = Snapshot::native().with_region(0x8000, &frame);
    let cie = decode_cie(&cie_space, 0x8000, &EncodingBases::default()).unwrap();

    let range = BASE..BASE + 1;
    assert_eq!(
        instructions(&space, range.clone(), &cie, VendorCfaOp::NegateRaState),
        Ok(alloc::vec![Instruction::NegateRaState])
    );
    assert_eq!(
        instructions(&space, range.clone(), &cie, VendorCfaOp::WindowSave),
        Ok(alloc::vec![Instruction::WindowSave])
    );
    assert_eq!(
        instructions(&space, range, &cie, VendorCfaOp::None),
        Err(CfiError::UnknownOpcode(0x2d))
    );
}
