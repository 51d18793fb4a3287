//! # divination
//!
//! the practice of seeking knowledge of the future or the unknown by
//! supernatural means.
//!
//! we ask supernatural means (the dynamic linker) for knowledge of the future
//! (where we will find the dwarves)
//!
//! first, we ask the dynamic linker to give us the `.eh_frame_hdr` for the
//! object containing a pc using the GNU extension
//! (`_dl_find_object`)[https://www.gnu.org/software/libc/manual/html_node/Dynamic-Linker-Introspection.html].
//! then, we binary search its table for the FDE covering the pc. Sections
//! without a header can still be scanned linearly.

use super::parse::{decode_fde, parse_entry_head, CfiError, Encoding, EncodingBases, FdeInfo};
use crate::addr_space::{AddressSpace, Reader};

/// The `.eh_frame_hdr` section.
/// See <https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html>
/// and <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EhFrameHeader {
    /// Address of the header itself, the base of `datarel` values in it.
    pub address: usize,
    pub eh_frame: usize,
    pub fde_count: usize,
    pub table_encoding: Encoding,
    pub table: usize,
}

impl EhFrameHeader {
    #[instrument(level = "trace", skip(space), err)]
    pub fn parse<S: AddressSpace + ?Sized>(space: &S, address: usize) -> Result<Self, CfiError> {
        let mut reader = Reader::unbounded(space, address);
        let version = reader.u8()?;
        if version != 1 {
            return Err(CfiError::UnsupportedHdrVersion(version));
        }
        let eh_frame_ptr_enc = Encoding(reader.u8()?);
        let fde_count_enc = Encoding(reader.u8()?);
        let table_enc = Encoding(reader.u8()?);

        let bases = EncodingBases {
            data: Some(address),
            ..EncodingBases::default()
        };
        let eh_frame = reader.encoded_pointer(eh_frame_ptr_enc, &bases)?;
        let fde_count = if fde_count_enc.is_omit() || table_enc.is_omit() {
            0
        } else {
            reader.encoded_pointer(fde_count_enc, &bases)?
        };

        let header = Self {
            address,
            eh_frame,
            fde_count,
            table_encoding: table_enc,
            table: reader.pos(),
        };
        trace!(?header, "eh_frame_hdr");
        Ok(header)
    }

    fn entry<S: AddressSpace + ?Sized>(
        &self,
        space: &S,
        index: usize,
        entry_size: usize,
    ) -> Result<(usize, usize), CfiError> {
        let bases = EncodingBases {
            data: Some(self.address),
            ..EncodingBases::default()
        };
        let mut reader = Reader::unbounded(space, self.table + index * entry_size);
        let initial_location = reader.encoded_pointer(self.table_encoding, &bases)?;
        let fde = reader.encoded_pointer(self.table_encoding, &bases)?;
        Ok((initial_location, fde))
    }

    /// Binary searches the table for the last entry starting at or before
    /// `pc`. The FDE found still has to be checked for covering `pc`.
    #[instrument(level = "trace", skip(self, space), err)]
    pub fn search<S: AddressSpace + ?Sized>(
        &self,
        space: &S,
        pc: usize,
    ) -> Result<Option<usize>, CfiError> {
        if self.fde_count == 0 {
            return Ok(None);
        }
        let entry_size = self
            .table_encoding
            .size()
            .filter(|_| !self.table_encoding.is_indirect())
            .ok_or(CfiError::UnsearchableTable(self.table_encoding))?
            * 2;

        let mut low = 0;
        let mut len = self.fde_count;
        while len > 1 {
            let half = len / 2;
            let mid = low + half;
            let (initial_location, _) = self.entry(space, mid, entry_size)?;
            debug!(low, len, mid, "binary searching for {pc:#x}: {initial_location:#x}");
            if initial_location <= pc {
                low = mid;
                len -= half;
            } else {
                len = half;
            }
        }

        let (initial_location, fde) = self.entry(space, low, entry_size)?;
        if initial_location > pc {
            return Ok(None);
        }
        debug!("found FDE at address {fde:#x}");
        Ok(Some(fde))
    }
}

/// Finds the FDE covering `pc` through the header table.
pub fn find_fde_with_header<S: AddressSpace + ?Sized>(
    space: &S,
    header: &EhFrameHeader,
    pc: usize,
    bases: &EncodingBases,
) -> Result<Option<FdeInfo>, CfiError> {
    let Some(fde) = header.search(space, pc)? else {
        return Ok(None);
    };
    let (fde, _) = decode_fde(space, fde, bases)?;
    Ok(fde.covers(pc).then_some(fde))
}

/// Walks `.eh_frame` entry by entry, for sections without a usable header.
#[instrument(level = "trace", skip(space, bases), err)]
pub fn scan_eh_frame<S: AddressSpace + ?Sized>(
    space: &S,
    eh_frame: usize,
    len: Option<usize>,
    pc: usize,
    bases: &EncodingBases,
) -> Result<Option<FdeInfo>, CfiError> {
    let end = len.map_or(usize::MAX, |len| eh_frame + len);
    let mut address = eh_frame;
    while address < end {
        let head = match parse_entry_head(space, address) {
            Ok(head) => head,
            Err(CfiError::Terminator { .. }) => break,
            Err(err) => return Err(err),
        };
        if head.id != 0 {
            let (fde, _) = decode_fde(space, address, bases)?;
            if fde.covers(pc) {
                return Ok(Some(fde));
            }
        }
        address = head.end;
    }
    Ok(None)
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use dl::DlFindObject;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod dl {
    #![allow(non_camel_case_types)]

    use core::ffi;

    use crate::{
        cursor::{FindUnwindSections, UnwindSections},
        dwarf::parse::EncodingBases,
        stdext::with_last_os_error_str,
    };

    #[repr(C)]
    struct dl_find_object {
        dlfo_flags: ffi::c_ulonglong,
        dlfo_map_start: *const ffi::c_void,
        dlfo_map_end: *const ffi::c_void,
        dlf_link_map: *const ffi::c_void,
        /// A pointer to the `PT_GNU_EH_FRAME` segment (the `.eh_frame_hdr`
        /// section).
        dlfo_eh_frame: *const ffi::c_void,
        __dlfo_reserved: [ffi::c_ulonglong; 7],
    }

    extern "C" {
        fn _dl_find_object(address: *const ffi::c_void, result: *mut dl_find_object) -> ffi::c_int;
    }

    /// Finds the unwind sections of loaded objects through the dynamic linker.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct DlFindObject;

    impl FindUnwindSections for DlFindObject {
        #[instrument(level = "trace", skip(self))]
        fn find_sections(&self, pc: usize) -> Option<UnwindSections> {
            let addr = core::ptr::with_exposed_provenance::<ffi::c_void>(pc);
            // SAFETY: all zeroes is a valid `dl_find_object`, and glibc fills it
            // in or returns an error.
            let out = unsafe {
                let mut out = core::mem::zeroed::<dl_find_object>();
                let ret = _dl_find_object(addr, &mut out);
                trace!("_dl_find_object returned {ret}");
                if ret != 0 {
                    with_last_os_error_str(|err| trace!("dl_find_object error: {err}"));
                    return None;
                }
                out
            };
            if out.dlfo_eh_frame.is_null() {
                trace!("dlfo_eh_frame is null");
                return None;
            }
            if !(out.dlfo_map_start..out.dlfo_map_end).contains(&addr) {
                trace!("dl_find_object returned object out of range for addr: {pc:#x}");
                return None;
            }

            let eh_frame_hdr = out.dlfo_eh_frame.addr();
            trace!(
                "dwarf info; map: ({:p}, {:p}), eh_frame_hdr: {eh_frame_hdr:#x}",
                out.dlfo_map_start,
                out.dlfo_map_end,
            );
            Some(UnwindSections {
                eh_frame_hdr: Some(eh_frame_hdr),
                eh_frame: None,
                compact_unwind: None,
                bases: EncodingBases {
                    text: Some(out.dlfo_map_start.addr()),
                    data: None,
                    func: None,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{addr_space::Snapshot, dwarf::testutil::EhFrameBuilder};

    const EH_FRAME: usize = 0x20_0000;
    const HDR: usize = 0x1f_0000;

    fn eh_frame() -> (Vec<u8>, [usize; 3]) {
        let mut b = EhFrameBuilder::new(EH_FRAME);
        let cie = b.cie("zR", &[0x1b], 1, -8, 16, &[0x0c, 7, 8, 0x90, 1]);
        let f1 = b.fde(cie, 0x1000, 0x100, &[], &[]);
        let f2 = b.fde(cie, 0x1100, 0x80, &[], &[]);
        // Gap between 0x1180 and 0x2000.
        let f3 = b.fde(cie, 0x2000, 0x40, &[], &[]);
        (b.finish(), [f1, f2, f3])
    }

    fn header(fdes: &[(usize, usize)]) -> Vec<u8> {
        #[rustfmt::skip]
        let mut hdr = alloc::vec![
            1,    // version
            0x1b, // eh_frame_ptr: pcrel | sdata4
            0x03, // fde_count: udata4
            0x3b, // table: datarel | sdata4
        ];
        let eh_frame_ptr = (EH_FRAME as i64 - (HDR + 4) as i64) as i32;
        hdr.extend_from_slice(&eh_frame_ptr.to_ne_bytes());
        hdr.extend_from_slice(&(fdes.len() as u32).to_ne_bytes());
        for &(pc, fde) in fdes {
            hdr.extend_from_slice(&((pc as i64 - HDR as i64) as i32).to_ne_bytes());
            hdr.extend_from_slice(&((fde as i64 - HDR as i64) as i32).to_ne_bytes());
        }
        hdr
    }

    #[test]
    fn header_binary_search() {
        let (frame, [f1, f2, f3]) = eh_frame();
        let hdr = header(&[(0x1000, f1), (0x1100, f2), (0x2000, f3)]);
        let space = Snapshot::native()
            .with_region(EH_FRAME, &frame)
            .with_region(HDR, &hdr);
        let bases = EncodingBases::default();

        let header = EhFrameHeader::parse(&space, HDR).unwrap();
        assert_eq!(header.eh_frame, EH_FRAME);
        assert_eq!(header.fde_count, 3);

        let find = |pc| find_fde_with_header(&space, &header, pc, &bases).unwrap();
        assert_eq!(find(0x1000).map(|f| f.address), Some(f1));
        assert_eq!(find(0x10ff).map(|f| f.address), Some(f1));
        assert_eq!(find(0x1100).map(|f| f.address), Some(f2));
        assert_eq!(find(0x2020).map(|f| f.address), Some(f3));
        assert_eq!(find(0x0fff), None);
        assert_eq!(find(0x1800), None);
        assert_eq!(find(0x2040), None);
    }

    #[test]
    fn linear_scan() {
        let (frame, [_, f2, _]) = eh_frame();
        let space = Snapshot::native().with_region(EH_FRAME, &frame);
        let bases = EncodingBases::default();

        let fde = scan_eh_frame(&space, EH_FRAME, None, 0x1150, &bases)
            .unwrap()
            .unwrap();
        assert_eq!(fde.address, f2);
        assert_eq!((fde.pc_start, fde.pc_end), (0x1100, 0x1180));
        assert_eq!(
            scan_eh_frame(&space, EH_FRAME, Some(frame.len()), 0x3000, &bases),
            Ok(None)
        );
    }

    #[test]
    fn rejects_unknown_header_version() {
        let hdr = [2, 0x1b, 0x03, 0x3b];
        let space = Snapshot::native().with_region(HDR, &hdr);
        assert_eq!(
            EhFrameHeader::parse(&space, HDR),
            Err(CfiError::UnsupportedHdrVersion(2))
        );
    }
}
