//! Implements parsing of DWARF call frame information as found in `.eh_frame`.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//! and the LSB `.eh_frame` extensions
//! (<https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>).
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program (a relative offset in shared object files). The remaining columns
//! contain unwinding rules that are associated with the indicated location.
//!
//! The table is not stored, it is encoded as a program: each FDE carries the
//! instructions that build the rows for one function, prefixed by the initial
//! instructions of its CIE. This module decodes the entries and the
//! instruction stream. Running the program is done by [`super::prolog`].
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use core::{fmt, ops::Range};

use crate::{
    addr_space::{AddressSpace, MemoryError, Reader},
    registers::{Register, VendorCfaOp},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CfiError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("CIE at {addr:#x} has unsupported version {version}")]
    UnsupportedVersion { addr: usize, version: u8 },
    #[error("entry at {addr:#x} is not a CIE (id {id:#x})")]
    NotACie { addr: usize, id: u32 },
    #[error("entry at {addr:#x} is a CIE, expected an FDE")]
    NotAnFde { addr: usize },
    #[error("entry at {addr:#x} is the section terminator")]
    Terminator { addr: usize },
    #[error("augmentation data of {len} bytes overruns the entry at {addr:#x}")]
    AugmentationOverrun { addr: usize, len: usize },
    #[error("unknown augmentation {aug:?} in CIE at {addr:#x}")]
    UnknownAugmentation { addr: usize, aug: char },
    #[error("register {0} is outside the register catalog")]
    BadRegister(u64),
    #[error("unknown CFA opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("remember_state nested deeper than {0}")]
    RememberOverflow(usize),
    #[error("restore_state without a matching remember_state")]
    RestoreUnderflow,
    #[error("CFA offset change while the CFA is not register based")]
    CfaNotRegister,
    #[error("eh_frame_hdr version {0} is not supported")]
    UnsupportedHdrVersion(u8),
    #[error("eh_frame_hdr table encoding {0:?} can't be binary searched")]
    UnsearchableTable(Encoding),
}

type Result<T, E = CfiError> = core::result::Result<T, E>;

/// A `DW_EH_PE_*` pointer encoding. The low nibble is the value format, bits
/// 4-6 say what it is relative to and bit 7 requests an extra indirection.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    /// A pointer-sized value.
    pub const DW_EH_PE_absptr: u8 = 0x00;
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    pub const DW_EH_PE_uleb128: u8 = 0x01;
    /// A 2 bytes unsigned value.
    pub const DW_EH_PE_udata2: u8 = 0x02;
    /// A 4 bytes unsigned value.
    pub const DW_EH_PE_udata4: u8 = 0x03;
    /// An 8 bytes unsigned value.
    pub const DW_EH_PE_udata8: u8 = 0x04;
    /// Signed value is encoded using the Little Endian Base 128 (LEB128).
    pub const DW_EH_PE_sleb128: u8 = 0x09;
    /// A 2 bytes signed value.
    pub const DW_EH_PE_sdata2: u8 = 0x0a;
    /// A 4 bytes signed value.
    pub const DW_EH_PE_sdata4: u8 = 0x0b;
    /// An 8 bytes signed value.
    pub const DW_EH_PE_sdata8: u8 = 0x0c;

    /// Value is relative to the current program counter.
    pub const DW_EH_PE_pcrel: u8 = 0x10;
    /// Value is relative to the beginning of the .text section.
    pub const DW_EH_PE_textrel: u8 = 0x20;
    /// Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    pub const DW_EH_PE_datarel: u8 = 0x30;
    /// Value is relative to the beginning of the function.
    pub const DW_EH_PE_funcrel: u8 = 0x40;
    /// Value is aligned to an address unit sized boundary.
    pub const DW_EH_PE_aligned: u8 = 0x50;

    pub const DW_EH_PE_indirect: u8 = 0x80;
    /// The value is not present at all.
    pub const DW_EH_PE_omit: u8 = 0xff;

    pub const OMIT: Encoding = Encoding(Self::DW_EH_PE_omit);

    pub fn format(self) -> u8 {
        self.0 & 0x0f
    }

    pub fn application(self) -> u8 {
        self.0 & 0x70
    }

    pub fn is_indirect(self) -> bool {
        self.0 & Self::DW_EH_PE_indirect != 0
    }

    pub fn is_omit(self) -> bool {
        self.0 == Self::DW_EH_PE_omit
    }

    /// The same value format, applied to nothing.
    pub fn value_only(self) -> Encoding {
        Encoding(self.format())
    }

    /// The size of a value in this format, if it has a fixed one.
    pub fn size(self) -> Option<usize> {
        match self.format() {
            Self::DW_EH_PE_absptr => Some(core::mem::size_of::<usize>()),
            Self::DW_EH_PE_udata2 | Self::DW_EH_PE_sdata2 => Some(2),
            Self::DW_EH_PE_udata4 | Self::DW_EH_PE_sdata4 => Some(4),
            Self::DW_EH_PE_udata8 | Self::DW_EH_PE_sdata8 => Some(8),
            _ => None,
        }
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("omit");
        }
        let application = match self.application() {
            Self::DW_EH_PE_absptr => "abs",
            Self::DW_EH_PE_pcrel => "pcrel",
            Self::DW_EH_PE_textrel => "textrel",
            Self::DW_EH_PE_datarel => "datarel",
            Self::DW_EH_PE_funcrel => "funcrel",
            Self::DW_EH_PE_aligned => "aligned",
            _ => "?",
        };
        let format = match self.format() {
            Self::DW_EH_PE_absptr => "ptr",
            Self::DW_EH_PE_uleb128 => "uleb128",
            Self::DW_EH_PE_udata2 => "udata2",
            Self::DW_EH_PE_udata4 => "udata4",
            Self::DW_EH_PE_udata8 => "udata8",
            Self::DW_EH_PE_sleb128 => "sleb128",
            Self::DW_EH_PE_sdata2 => "sdata2",
            Self::DW_EH_PE_sdata4 => "sdata4",
            Self::DW_EH_PE_sdata8 => "sdata8",
            _ => "?",
        };
        let indirect = if self.is_indirect() { " | indirect" } else { "" };
        write!(f, "{application} | {format}{indirect}")
    }
}

/// Base addresses for the relative pointer encodings. `pcrel` needs none,
/// its base is the address of the field itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EncodingBases {
    pub text: Option<usize>,
    pub data: Option<usize>,
    pub func: Option<usize>,
}

/// Common Information Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CieInfo {
    /// Address of the length field.
    pub address: usize,
    /// Size including the length field.
    pub length: usize,
    pub version: u8,
    /// A constant that is factored out of all advance location instructions.
    /// The resulting value is (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions. The
    /// resulting value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// Indicates which column in the rule table represents the return address
    /// of the function. Note that this column might not correspond to an
    /// actual machine register.
    pub return_address_register: Register,
    /// A sequence of rules that are interpreted to create the initial setting
    /// of each column in the table.
    pub initial_instructions: Range<usize>,
    /// Encoding of the addresses in the FDEs using this CIE (`R`).
    pub pointer_encoding: Encoding,
    /// Encoding of the LSDA pointer in the FDEs (`L`).
    pub lsda_encoding: Encoding,
    /// The personality routine (`P`).
    pub personality: Option<usize>,
    /// Whether the FDEs have an augmentation data length (`z`).
    pub has_augmentation_data: bool,
    /// The frames are signal handler trampolines (`S`).
    pub is_signal_frame: bool,
    /// AArch64: return addresses are signed with the B key (`B`).
    pub addresses_signed_with_b_key: bool,
    /// AArch64: the frames use MTE tagged stack memory (`G`).
    pub mte_tagged_frame: bool,
}

/// Frame Description Entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdeInfo {
    /// Address of the length field.
    pub address: usize,
    /// Size including the length field.
    pub length: usize,
    pub cie: usize,
    pub pc_start: usize,
    pub pc_end: usize,
    pub lsda: Option<usize>,
    /// A sequence of table defining instructions.
    pub instructions: Range<usize>,
}

impl FdeInfo {
    pub fn covers(&self, pc: usize) -> bool {
        (self.pc_start..self.pc_end).contains(&pc)
    }
}

/// Length and id of an `.eh_frame` entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHead {
    pub(crate) address: usize,
    /// Address of the CIE id / CIE pointer field.
    pub(crate) id_field: usize,
    pub(crate) id: u32,
    /// One past the last byte of the entry.
    pub(crate) end: usize,
}

/// Reads the length and id of the entry at `address`. A zero length is the
/// terminator of the section.
pub(crate) fn parse_entry_head<S: AddressSpace + ?Sized>(
    space: &S,
    address: usize,
) -> Result<EntryHead> {
    let mut reader = Reader::unbounded(space, address);
    let length = match reader.u32()? {
        0 => return Err(CfiError::Terminator { addr: address }),
        0xffff_ffff => reader.u64()? as usize,
        length => length as usize,
    };
    let id_field = reader.pos();
    let end = id_field
        .checked_add(length)
        .ok_or(MemoryError::PastLimit {
            addr: id_field,
            len: length,
            limit: usize::MAX,
        })?;
    let id = reader.u32()?;
    Ok(EntryHead {
        address,
        id_field,
        id,
        end,
    })
}

/// Reads the augmentation data length, returning where the data ends. The
/// data must fit in the entry.
fn augmentation_data_end<S: AddressSpace + ?Sized>(
    data: &mut Reader<'_, S>,
    head: &EntryHead,
) -> Result<usize> {
    let len = data.uleb128()? as usize;
    data.pos()
        .checked_add(len)
        .filter(|end| *end <= head.end)
        .ok_or(CfiError::AugmentationOverrun {
            addr: head.address,
            len,
        })
}

/// Decodes the CIE at `address`.
#[instrument(level = "trace", skip(space, bases), err)]
pub fn decode_cie<S: AddressSpace + ?Sized>(
    space: &S,
    address: usize,
    bases: &EncodingBases,
) -> Result<CieInfo> {
    let head = parse_entry_head(space, address)?;
    if head.id != 0 {
        return Err(CfiError::NotACie {
            addr: address,
            id: head.id,
        });
    }
    let mut data = Reader::new(space, head.id_field + 4, head.end);

    let version = data.u8()?;
    if version != 1 && version != 3 {
        return Err(CfiError::UnsupportedVersion {
            addr: address,
            version,
        });
    }

    // The augmentation string is walked twice: once to find its end, and once
    // more below to interpret the augmentation data in the right order.
    let augmentation = data.pos();
    while data.u8()? != 0 {}
    let augmentation = augmentation..data.pos() - 1;

    let mut cie = CieInfo {
        address,
        length: head.end - address,
        version,
        code_alignment_factor: 0,
        data_alignment_factor: 0,
        return_address_register: Register(0),
        initial_instructions: 0..0,
        pointer_encoding: Encoding(Encoding::DW_EH_PE_absptr),
        lsda_encoding: Encoding::OMIT,
        personality: None,
        has_augmentation_data: false,
        is_signal_frame: false,
        addresses_signed_with_b_key: false,
        mte_tagged_frame: false,
    };

    // The legacy "eh" augmentation carries a pointer to the exception table.
    if augmentation.len() >= 2
        && space.get8(augmentation.start)? == b'e'
        && space.get8(augmentation.start + 1)? == b'h'
    {
        data.pointer()?;
    }

    cie.code_alignment_factor = data.uleb128()?;
    cie.data_alignment_factor = data.sleb128()?;
    let ra = if version == 1 {
        u64::from(data.u8()?)
    } else {
        data.uleb128()?
    };
    cie.return_address_register = register(ra)?;

    let mut augmentation_end = None;
    for at in augmentation {
        match space.get8(at)? {
            b'z' => {
                augmentation_end = Some(augmentation_data_end(&mut data, &head)?);
                cie.has_augmentation_data = true;
            }
            // If present, it indicates the presence of two arguments in the
            // Augmentation Data of the CIE. The first argument is 1-byte and
            // represents the pointer encoding used for the second argument,
            // which is the address of a personality routine handler.
            b'P' => {
                let encoding = Encoding(data.u8()?);
                let personality = data.encoded_pointer(encoding, bases)?;
                cie.personality = (personality != 0).then_some(personality);
            }
            // The 1-byte argument is the pointer encoding of the LSDA pointer
            // in the augmentation data of the FDE.
            b'L' => cie.lsda_encoding = Encoding(data.u8()?),
            // The 1-byte argument is the pointer encoding for the address
            // pointers used in the FDE.
            b'R' => cie.pointer_encoding = Encoding(data.u8()?),
            b'S' => cie.is_signal_frame = true,
            b'B' => cie.addresses_signed_with_b_key = true,
            b'G' => cie.mte_tagged_frame = true,
            b'e' | b'h' => {}
            // With a 'z' the rest of the data can be skipped without knowing
            // what it means.
            _ if augmentation_end.is_some() => break,
            aug => {
                return Err(CfiError::UnknownAugmentation {
                    addr: address,
                    aug: char::from(aug),
                })
            }
        }
    }

    let instructions = augmentation_end.unwrap_or(data.pos());
    cie.initial_instructions = instructions..head.end;
    trace!(?cie, "decoded CIE");
    Ok(cie)
}

/// Decodes the FDE at `address` together with its CIE.
#[instrument(level = "trace", skip(space, bases), err)]
pub fn decode_fde<S: AddressSpace + ?Sized>(
    space: &S,
    address: usize,
    bases: &EncodingBases,
) -> Result<(FdeInfo, CieInfo)> {
    let head = parse_entry_head(space, address)?;
    if head.id == 0 {
        return Err(CfiError::NotAnFde { addr: address });
    }
    // The CIE pointer is relative to the field it is stored in.
    let cie_address = head.id_field.wrapping_sub(head.id as usize);
    let cie = decode_cie(space, cie_address, bases)?;

    let mut data = Reader::new(space, head.id_field + 4, head.end);
    let pc_start = data.encoded_pointer(cie.pointer_encoding, bases)?;
    let pc_range = data.encoded_pointer(cie.pointer_encoding.value_only(), bases)?;

    let mut lsda = None;
    if cie.has_augmentation_data {
        let augmentation_end = augmentation_data_end(&mut data, &head)?;
        if !cie.lsda_encoding.is_omit() {
            // A zero LSDA pointer means there is none, whatever the encoding
            // would add to it.
            let field = data.pos();
            if data.encoded_pointer(cie.lsda_encoding.value_only(), bases)? != 0 {
                data.pos = field;
                lsda = Some(data.encoded_pointer(cie.lsda_encoding, bases)?);
            }
        }
        data.pos = augmentation_end;
    }

    let fde = FdeInfo {
        address,
        length: head.end - address,
        cie: cie_address,
        pc_start,
        pc_end: pc_start.wrapping_add(pc_range),
        lsda,
        instructions: data.pos()..head.end,
    };
    trace!(?fde, "decoded FDE");
    Ok((fde, cie))
}

fn register(value: u64) -> Result<Register> {
    u16::try_from(value)
        .map(Register)
        .map_err(|_| CfiError::BadRegister(value))
}

/// A DWARF expression stored in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expr {
    pub start: usize,
    pub len: usize,
}

impl Expr {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// A decoded call frame instruction. Offsets are already multiplied by the
/// alignment factors of the CIE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    //-------- 6.4.2.1 Row Creation Instructions
    //
    /// The DW_CFA_set_loc instruction takes a single operand that represents a
    /// target address. The required action is to create a new table row using
    /// the specified address as the location.
    SetLoc(usize),
    /// DW_CFA_advance_loc and its 1, 2 and 4 byte forms: create a new table
    /// row with a location value that is computed by taking the current
    /// entry's location value and adding the delta.
    AdvanceLoc(u64),
    //
    //-------- 6.4.2.2 CFA Definition Instructions
    //
    /// DW_CFA_def_cfa and DW_CFA_def_cfa_sf: define the current CFA rule to use
    /// the provided register and offset.
    DefCfa { register: Register, offset: i64 },
    /// The DW_CFA_def_cfa_register instruction takes a single unsigned LEB128
    /// operand representing a register number. The required action is to define
    /// the current CFA rule to use the provided register (but to keep the
    /// old offset).
    DefCfaRegister(Register),
    /// DW_CFA_def_cfa_offset and DW_CFA_def_cfa_offset_sf. This operation is
    /// valid only if the current CFA rule is defined to use a register and
    /// offset.
    DefCfaOffset(i64),
    /// The DW_CFA_def_cfa_expression instruction establishes a DWARF
    /// expression as the means by which the current CFA is computed.
    DefCfaExpression(Expr),
    //
    //-------- 6.4.2.3 Register Rule Instructions
    //
    /// Set the rule for the specified register to "undefined."
    Undefined(Register),
    /// Set the rule for the specified register to "same value."
    SameValue(Register),
    /// DW_CFA_offset, DW_CFA_offset_extended, DW_CFA_offset_extended_sf and
    /// DW_CFA_GNU_negative_offset_extended: the previous value of the register
    /// is saved at the address CFA+N.
    Offset { register: Register, offset: i64 },
    /// DW_CFA_val_offset and DW_CFA_val_offset_sf: the previous value of this
    /// register is the value CFA+N.
    ValOffset { register: Register, offset: i64 },
    /// The previous value of `register` is stored in the register `from`.
    Register { register: Register, from: Register },
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression. The CFA is pushed on the DWARF
    /// evaluation stack prior to execution.
    Expression { register: Register, expr: Expr },
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression.
    ValExpression { register: Register, expr: Expr },
    /// DW_CFA_restore and DW_CFA_restore_extended: change the rule for the
    /// indicated register to the rule assigned it by the initial_instructions
    /// in the CIE.
    Restore(Register),
    //
    //-------- 6.4.2.4 Row State Instructions
    //
    /// Push the set of rules for every register onto an implicit stack.
    RememberState,
    /// Pop the set of rules off the implicit stack and place them in the
    /// current row.
    RestoreState,
    //
    //-------- Extensions
    //
    /// DW_CFA_GNU_args_size: the size of the arguments pushed for the current
    /// call, to be removed from the stack when landing in this frame.
    ArgsSize(u64),
    /// DW_CFA_AARCH64_negate_ra_state: toggles whether the return address is
    /// signed.
    NegateRaState,
    /// DW_CFA_GNU_window_save: SPARC register window spill.
    WindowSave,
    //
    //-------- 6.4.2.5 Padding Instruction
    //
    /// The DW_CFA_nop instruction has no operands and no required actions. It
    /// is used as padding to make a CIE or FDE an appropriate size.
    Nop,
}

const DW_CFA_advance_loc_hi: u8 = 0x01;
const DW_CFA_offset_hi: u8 = 0x02;
const DW_CFA_restore_hi: u8 = 0x03;

const DW_CFA_nop: u8 = 0;
const DW_CFA_set_loc: u8 = 0x01;
const DW_CFA_advance_loc1: u8 = 0x02;
const DW_CFA_advance_loc2: u8 = 0x03;
const DW_CFA_advance_loc4: u8 = 0x04;
const DW_CFA_offset_extended: u8 = 0x05;
const DW_CFA_restore_extended: u8 = 0x06;
const DW_CFA_undefined: u8 = 0x07;
const DW_CFA_same_value: u8 = 0x08;
const DW_CFA_register: u8 = 0x09;
const DW_CFA_remember_state: u8 = 0x0a;
const DW_CFA_restore_state: u8 = 0x0b;
const DW_CFA_def_cfa: u8 = 0x0c;
const DW_CFA_def_cfa_register: u8 = 0x0d;
const DW_CFA_def_cfa_offset: u8 = 0x0e;
const DW_CFA_def_cfa_expression: u8 = 0x0f;
const DW_CFA_expression: u8 = 0x10;
const DW_CFA_offset_extended_sf: u8 = 0x11;
const DW_CFA_def_cfa_sf: u8 = 0x12;
const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
const DW_CFA_val_offset: u8 = 0x14;
const DW_CFA_val_offset_sf: u8 = 0x15;
const DW_CFA_val_expression: u8 = 0x16;
const DW_CFA_GNU_window_save: u8 = 0x2d;
const DW_CFA_GNU_args_size: u8 = 0x2e;
const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// Decodes the instruction stream of a CIE or FDE. Stops after the first
/// error.
pub struct Instructions<'s, S: ?Sized> {
    reader: Reader<'s, S>,
    code_alignment_factor: u64,
    data_alignment_factor: i64,
    pointer_encoding: Encoding,
    bases: EncodingBases,
    vendor: VendorCfaOp,
    failed: bool,
}

impl<'s, S: AddressSpace + ?Sized> Instructions<'s, S> {
    pub fn new(
        space: &'s S,
        range: Range<usize>,
        cie: &CieInfo,
        bases: &EncodingBases,
        vendor: VendorCfaOp,
    ) -> Self {
        Self {
            reader: Reader::new(space, range.start, range.end),
            code_alignment_factor: cie.code_alignment_factor,
            data_alignment_factor: cie.data_alignment_factor,
            pointer_encoding: cie.pointer_encoding,
            bases: *bases,
            vendor,
            failed: false,
        }
    }

    fn register(&mut self) -> Result<Register> {
        register(self.reader.uleb128()?)
    }

    fn factored(&mut self) -> Result<i64> {
        Ok((self.reader.uleb128()? as i64).wrapping_mul(self.data_alignment_factor))
    }

    fn factored_sf(&mut self) -> Result<i64> {
        Ok(self.reader.sleb128()?.wrapping_mul(self.data_alignment_factor))
    }

    fn advance(&self, delta: u64) -> Instruction {
        Instruction::AdvanceLoc(delta.wrapping_mul(self.code_alignment_factor))
    }

    fn expr(&mut self) -> Result<Expr> {
        let len = self.reader.uleb128()? as usize;
        let start = self.reader.pos();
        self.reader.skip(len)?;
        Ok(Expr { start, len })
    }

    fn decode(&mut self) -> Result<Instruction> {
        let b = self.reader.u8()?;
        let low_6 = b & (u8::MAX >> 2);
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => self.advance(u64::from(low_6)),
            DW_CFA_offset_hi => Instruction::Offset {
                register: Register(u16::from(low_6)),
                offset: self.factored()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(Register(u16::from(low_6))),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => {
                    Instruction::SetLoc(self.reader.encoded_pointer(self.pointer_encoding, &self.bases)?)
                }
                DW_CFA_advance_loc1 => {
                    let delta = self.reader.u8()?;
                    self.advance(u64::from(delta))
                }
                DW_CFA_advance_loc2 => {
                    let delta = self.reader.u16()?;
                    self.advance(u64::from(delta))
                }
                DW_CFA_advance_loc4 => {
                    let delta = self.reader.u32()?;
                    self.advance(u64::from(delta))
                }
                DW_CFA_offset_extended => Instruction::Offset {
                    register: self.register()?,
                    offset: self.factored()?,
                },
                DW_CFA_restore_extended => Instruction::Restore(self.register()?),
                DW_CFA_undefined => Instruction::Undefined(self.register()?),
                DW_CFA_same_value => Instruction::SameValue(self.register()?),
                DW_CFA_register => Instruction::Register {
                    register: self.register()?,
                    from: self.register()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: self.register()?,
                    offset: self.reader.uleb128()? as i64,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(self.register()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(self.reader.uleb128()? as i64),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(self.expr()?),
                DW_CFA_expression => Instruction::Expression {
                    register: self.register()?,
                    expr: self.expr()?,
                },
                DW_CFA_offset_extended_sf => Instruction::Offset {
                    register: self.register()?,
                    offset: self.factored_sf()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfa {
                    register: self.register()?,
                    offset: self.factored_sf()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffset(self.factored_sf()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: self.register()?,
                    offset: self.factored()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffset {
                    register: self.register()?,
                    offset: self.factored_sf()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: self.register()?,
                    expr: self.expr()?,
                },
                DW_CFA_GNU_window_save => match self.vendor {
                    VendorCfaOp::NegateRaState => Instruction::NegateRaState,
                    VendorCfaOp::WindowSave => Instruction::WindowSave,
                    VendorCfaOp::None => return Err(CfiError::UnknownOpcode(b)),
                },
                DW_CFA_GNU_args_size => Instruction::ArgsSize(self.reader.uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::Offset {
                    register: self.register()?,
                    offset: self.factored()?.wrapping_neg(),
                },
                _ => return Err(CfiError::UnknownOpcode(b)),
            },
        })
    }
}

impl<S: AddressSpace + ?Sized> Iterator for Instructions<'_, S> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.is_empty() {
            return None;
        }
        let instruction = self.decode();
        self.failed = instruction.is_err();
        Some(instruction)
    }
}
