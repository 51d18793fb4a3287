//! Walking a stack frame by frame.
//!
//! The [`Cursor`] owns the registers of the current frame. For every frame it
//! asks a [`FindUnwindSections`] which object the pc belongs to, finds the
//! unwind rules for the pc in that object's `__unwind_info` or `.eh_frame`,
//! and steps to the caller.

use alloc::vec::Vec;
use core::ops::Range;

use crate::{
    addr_space::AddressSpace,
    compact::{find_entry, CompactSection, CompactUnwind},
    dwarf::{
        divination::{find_fde_with_header, scan_eh_frame, EhFrameHeader},
        parse::{CfiError, EncodingBases, FdeInfo},
        prolog::{parse_prolog, PrologInfo},
    },
    registers::{Arch, Registers},
    step::{apply_prolog, cfa, StepError, UnwindInfoLocation},
};

/// The unwind sections of one loaded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwindSections {
    pub eh_frame_hdr: Option<usize>,
    /// Start and length of `.eh_frame`, for objects without a usable header
    /// and for resolving compact unwind DWARF escapes.
    pub eh_frame: Option<(usize, usize)>,
    pub compact_unwind: Option<CompactSection>,
    pub bases: EncodingBases,
}

/// Finds the unwind sections of the object containing a pc.
pub trait FindUnwindSections {
    fn find_sections(&self, pc: usize) -> Option<UnwindSections>;
}

impl<F: FindUnwindSections + ?Sized> FindUnwindSections for &F {
    fn find_sections(&self, pc: usize) -> Option<UnwindSections> {
        (**self).find_sections(pc)
    }
}

/// A fixed table of code ranges and their sections.
#[derive(Debug, Clone, Default)]
pub struct StaticSections {
    objects: Vec<(Range<usize>, UnwindSections)>,
}

impl StaticSections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, text: Range<usize>, sections: UnwindSections) {
        self.objects.push((text, sections));
    }

    pub fn with(mut self, text: Range<usize>, sections: UnwindSections) -> Self {
        self.add(text, sections);
        self
    }
}

impl FindUnwindSections for StaticSections {
    fn find_sections(&self, pc: usize) -> Option<UnwindSections> {
        self.objects
            .iter()
            .find(|(text, _)| text.contains(&pc))
            .map(|(_, sections)| *sections)
    }
}

/// What is known about the function of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub start_ip: usize,
    pub end_ip: usize,
    pub lsda: Option<usize>,
    pub personality: Option<usize>,
    /// `DW_CFA_GNU_args_size` at the pc.
    pub args_size: u64,
    pub signal_frame: bool,
    pub location: UnwindInfoLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Stepped,
    EndOfStack,
}

#[derive(Debug, Clone)]
struct Frame {
    info: ProcInfo,
    prolog: PrologInfo,
}

pub struct Cursor<A: Arch, S, F> {
    space: S,
    finder: F,
    registers: Registers<A>,
    /// The ip is exact rather than a return address: the first frame, and
    /// the frame a signal interrupted.
    exact_ip: bool,
    frame: Option<Frame>,
}

impl<A: Arch, S: AddressSpace, F: FindUnwindSections> Cursor<A, S, F> {
    pub fn new(space: S, finder: F, registers: Registers<A>) -> Self {
        Self {
            space,
            finder,
            registers,
            exact_ip: true,
            frame: None,
        }
    }

    pub fn space(&self) -> &S {
        &self.space
    }

    pub fn registers(&self) -> &Registers<A> {
        &self.registers
    }

    /// Starts over from `registers`, as the first frame of a walk.
    pub fn reset(&mut self, registers: Registers<A>) {
        self.registers = registers;
        self.exact_ip = true;
        self.frame = None;
    }

    /// The address used to look up the unwind rules. Return addresses point
    /// after the call, which may already be the next function.
    pub fn lookup_pc(&self) -> usize {
        let ip = self.registers.ip();
        if self.exact_ip {
            ip
        } else {
            ip.wrapping_sub(1)
        }
    }

    fn frame(&mut self) -> Result<Option<&Frame>, StepError> {
        if self.frame.is_none() {
            if self.registers.ip() == 0 {
                return Ok(None);
            }
            self.frame = self.locate(self.lookup_pc())?;
        }
        Ok(self.frame.as_ref())
    }

    /// The function of the current frame, `None` if no unwind information
    /// covers it.
    pub fn proc_info(&mut self) -> Result<Option<ProcInfo>, StepError> {
        Ok(self.frame()?.map(|frame| frame.info))
    }

    /// The canonical frame address of the current frame.
    pub fn cfa(&mut self) -> Result<Option<usize>, StepError> {
        let Some(frame) = self.frame()? else {
            return Ok(None);
        };
        let prolog = frame.prolog.clone();
        cfa(&self.space, &prolog, &self.registers).map(Some)
    }

    /// Moves to the caller. On error the cursor stays on the current frame.
    #[instrument(level = "debug", skip(self), fields(ip = self.registers.ip()), err)]
    pub fn step(&mut self) -> Result<StepResult, StepError> {
        let Some(frame) = self.frame()? else {
            debug!("no unwind info, end of stack");
            return Ok(StepResult::EndOfStack);
        };
        let signal_frame = frame.info.signal_frame;
        let prolog = frame.prolog.clone();
        let registers = apply_prolog(&self.space, &prolog, &self.registers)?;

        self.registers = registers;
        self.exact_ip = signal_frame;
        self.frame = None;
        if self.registers.ip() == 0 {
            debug!("return address is 0, end of stack");
            return Ok(StepResult::EndOfStack);
        }
        Ok(StepResult::Stepped)
    }

    fn locate(&self, pc: usize) -> Result<Option<Frame>, StepError> {
        let Some(sections) = self.finder.find_sections(pc) else {
            trace!("no object contains {pc:#x}");
            return Ok(None);
        };

        if let Some(compact) = sections.compact_unwind {
            if let Some(entry) = find_entry(&self.space, &compact, pc)? {
                match A::compact_unwind(&self.space, entry.encoding, entry.start_ip)? {
                    CompactUnwind::Prolog(prolog) => {
                        let info = ProcInfo {
                            start_ip: entry.start_ip,
                            end_ip: entry.end_ip,
                            lsda: entry.lsda,
                            personality: entry.personality,
                            args_size: 0,
                            signal_frame: false,
                            location: UnwindInfoLocation::Compact {
                                encoding: entry.encoding,
                                function_start: entry.start_ip,
                            },
                        };
                        return Ok(Some(Frame { info, prolog }));
                    }
                    CompactUnwind::Dwarf(offset) => {
                        let Some(eh_frame) = self.eh_frame_start(&sections)? else {
                            return Err(StepError::DwarfEscape(offset));
                        };
                        let mut frame = self.dwarf(eh_frame + offset as usize, pc, &sections.bases)?;
                        // The compact entry knows the personality and LSDA
                        // even when the FDE doesn't.
                        frame.info.personality = frame.info.personality.or(entry.personality);
                        frame.info.lsda = frame.info.lsda.or(entry.lsda);
                        return Ok(Some(frame));
                    }
                    CompactUnwind::None => return Ok(None),
                }
            }
        }

        let Some(fde) = self.find_fde(&sections, pc)? else {
            trace!("no FDE covers {pc:#x}");
            return Ok(None);
        };
        self.dwarf(fde.address, pc, &sections.bases).map(Some)
    }

    fn eh_frame_start(&self, sections: &UnwindSections) -> Result<Option<usize>, CfiError> {
        if let Some((start, _)) = sections.eh_frame {
            return Ok(Some(start));
        }
        sections
            .eh_frame_hdr
            .map(|hdr| EhFrameHeader::parse(&self.space, hdr).map(|header| header.eh_frame))
            .transpose()
    }

    fn find_fde(&self, sections: &UnwindSections, pc: usize) -> Result<Option<FdeInfo>, CfiError> {
        if let Some(hdr) = sections.eh_frame_hdr {
            let header = EhFrameHeader::parse(&self.space, hdr)?;
            match find_fde_with_header(&self.space, &header, pc, &sections.bases) {
                Err(CfiError::UnsearchableTable(encoding)) => {
                    debug!(?encoding, "header table is not searchable, scanning");
                    let len = sections.eh_frame.map(|(_, len)| len);
                    return scan_eh_frame(&self.space, header.eh_frame, len, pc, &sections.bases);
                }
                result => return result,
            }
        }
        match sections.eh_frame {
            Some((start, len)) => scan_eh_frame(&self.space, start, Some(len), pc, &sections.bases),
            None => Ok(None),
        }
    }

    fn dwarf(&self, fde: usize, pc: usize, bases: &EncodingBases) -> Result<Frame, StepError> {
        let (prolog, fde, cie) = parse_prolog::<A, S>(&self.space, fde, pc, bases)?;
        let info = ProcInfo {
            start_ip: fde.pc_start,
            end_ip: fde.pc_end,
            lsda: fde.lsda,
            personality: cie.personality,
            args_size: prolog.args_size,
            signal_frame: prolog.signal_frame,
            location: UnwindInfoLocation::Dwarf {
                fde: fde.address,
                bases: *bases,
            },
        };
        trace!(?info, "proc info");
        Ok(Frame { info, prolog })
    }
}
