//! Bounds-checked access to the memory of the thread being unwound.
//!
//! Nothing in the stepper or the expression evaluator touches a raw pointer.
//! Every read goes through an [`AddressSpace`], which reports unreadable memory
//! as a [`MemoryError`] instead of faulting. That matters when walking a
//! corrupted stack or a stack that another thread is still writing.

use alloc::vec::Vec;

use crate::dwarf::parse::{Encoding, EncodingBases};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("{len} bytes at {addr:#x} are not readable")]
    Unmapped { addr: usize, len: usize },
    #[error("read of {len} bytes at {addr:#x} runs past the limit {limit:#x}")]
    PastLimit { addr: usize, len: usize, limit: usize },
    #[error("LEB128 value at {addr:#x} does not fit into 64 bits")]
    LebOverflow { addr: usize },
    #[error("unsupported pointer encoding {0:#04x}")]
    UnsupportedEncoding(u8),
    #[error("pointer encoding {0:#04x} needs a base address that is not known")]
    MissingBase(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    #[cfg(target_endian = "little")]
    pub const NATIVE: Endian = Endian::Little;
    #[cfg(target_endian = "big")]
    pub const NATIVE: Endian = Endian::Big;
}

/// Read-only view of a process' memory.
pub trait AddressSpace {
    /// Fills `buf` with the bytes at `addr`. Fails without partially
    /// succeeding if any of them can't be read.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError>;

    fn endian(&self) -> Endian {
        Endian::NATIVE
    }

    fn get8(&self, addr: usize) -> Result<u8, MemoryError> {
        let mut b = [0; 1];
        self.read(addr, &mut b)?;
        Ok(b[0])
    }

    fn get16(&self, addr: usize) -> Result<u16, MemoryError> {
        let mut b = [0; 2];
        self.read(addr, &mut b)?;
        Ok(match self.endian() {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    fn get32(&self, addr: usize) -> Result<u32, MemoryError> {
        let mut b = [0; 4];
        self.read(addr, &mut b)?;
        Ok(match self.endian() {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    fn get64(&self, addr: usize) -> Result<u64, MemoryError> {
        let mut b = [0; 8];
        self.read(addr, &mut b)?;
        Ok(match self.endian() {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    fn get128(&self, addr: usize) -> Result<u128, MemoryError> {
        let mut b = [0; 16];
        self.read(addr, &mut b)?;
        Ok(match self.endian() {
            Endian::Little => u128::from_le_bytes(b),
            Endian::Big => u128::from_be_bytes(b),
        })
    }

    /// Reads a pointer-width value.
    fn get_pointer(&self, addr: usize) -> Result<usize, MemoryError> {
        #[cfg(target_pointer_width = "64")]
        return self.get64(addr).map(|v| v as usize);
        #[cfg(target_pointer_width = "32")]
        return self.get32(addr).map(|v| v as usize);
    }

    /// Reads a register value that was spilled to memory.
    fn get_register(&self, addr: usize) -> Result<usize, MemoryError> {
        self.get_pointer(addr)
    }
}

impl<S: AddressSpace + ?Sized> AddressSpace for &S {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        (**self).read(addr, buf)
    }

    fn endian(&self) -> Endian {
        (**self).endian()
    }
}

/// A forward cursor over `[pos, limit)` of an address space.
pub struct Reader<'s, S: ?Sized> {
    space: &'s S,
    pub(crate) pos: usize,
    pub(crate) limit: usize,
}

impl<'s, S: AddressSpace + ?Sized> Reader<'s, S> {
    pub fn new(space: &'s S, pos: usize, limit: usize) -> Self {
        Self { space, pos, limit }
    }

    /// A reader without a known end. Reads are still checked by the space.
    pub fn unbounded(space: &'s S, pos: usize) -> Self {
        Self::new(space, pos, usize::MAX)
    }

    pub fn space(&self) -> &'s S {
        self.space
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.limit
    }

    fn claim(&mut self, len: usize) -> Result<usize, MemoryError> {
        let addr = self.pos;
        match addr.checked_add(len) {
            Some(end) if end <= self.limit => {
                self.pos = end;
                Ok(addr)
            }
            _ => Err(MemoryError::PastLimit {
                addr,
                len,
                limit: self.limit,
            }),
        }
    }

    pub fn skip(&mut self, len: usize) -> Result<(), MemoryError> {
        self.claim(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, MemoryError> {
        let addr = self.claim(1)?;
        self.space.get8(addr)
    }

    pub fn u16(&mut self) -> Result<u16, MemoryError> {
        let addr = self.claim(2)?;
        self.space.get16(addr)
    }

    pub fn u32(&mut self) -> Result<u32, MemoryError> {
        let addr = self.claim(4)?;
        self.space.get32(addr)
    }

    pub fn u64(&mut self) -> Result<u64, MemoryError> {
        let addr = self.claim(8)?;
        self.space.get64(addr)
    }

    pub fn i8(&mut self) -> Result<i8, MemoryError> {
        self.u8().map(|v| v as i8)
    }

    pub fn i16(&mut self) -> Result<i16, MemoryError> {
        self.u16().map(|v| v as i16)
    }

    pub fn i32(&mut self) -> Result<i32, MemoryError> {
        self.u32().map(|v| v as i32)
    }

    pub fn i64(&mut self) -> Result<i64, MemoryError> {
        self.u64().map(|v| v as i64)
    }

    pub fn pointer(&mut self) -> Result<usize, MemoryError> {
        let addr = self.claim(core::mem::size_of::<usize>())?;
        self.space.get_pointer(addr)
    }

    pub fn uleb128(&mut self) -> Result<u64, MemoryError> {
        let start = self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            let bits = u64::from(byte & 0x7f);
            if shift < 64 {
                if shift > 0 && bits >> (64 - shift) != 0 {
                    return Err(MemoryError::LebOverflow { addr: start });
                }
                result |= bits << shift;
            } else if bits != 0 {
                return Err(MemoryError::LebOverflow { addr: start });
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    pub fn sleb128(&mut self) -> Result<i64, MemoryError> {
        let start = self.pos;
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            } else if byte & 0x7f != 0 && byte & 0x7f != 0x7f {
                return Err(MemoryError::LebOverflow { addr: start });
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Reads a `DW_EH_PE_*` encoded pointer.
    pub fn encoded_pointer(
        &mut self,
        encoding: Encoding,
        bases: &EncodingBases,
    ) -> Result<usize, MemoryError> {
        let field = self.pos;
        let value = match encoding.format() {
            Encoding::DW_EH_PE_absptr => self.pointer()?,
            Encoding::DW_EH_PE_uleb128 => self.uleb128()? as usize,
            Encoding::DW_EH_PE_udata2 => self.u16()? as usize,
            Encoding::DW_EH_PE_udata4 => self.u32()? as usize,
            Encoding::DW_EH_PE_udata8 => self.u64()? as usize,
            Encoding::DW_EH_PE_sleb128 => self.sleb128()? as usize,
            Encoding::DW_EH_PE_sdata2 => self.i16()? as isize as usize,
            Encoding::DW_EH_PE_sdata4 => self.i32()? as isize as usize,
            Encoding::DW_EH_PE_sdata8 => self.i64()? as isize as usize,
            _ => return Err(MemoryError::UnsupportedEncoding(encoding.0)),
        };

        let base = match encoding.application() {
            Encoding::DW_EH_PE_absptr => 0,
            Encoding::DW_EH_PE_pcrel => field,
            Encoding::DW_EH_PE_textrel => bases
                .text
                .ok_or(MemoryError::MissingBase(encoding.0))?,
            Encoding::DW_EH_PE_datarel => bases
                .data
                .ok_or(MemoryError::MissingBase(encoding.0))?,
            Encoding::DW_EH_PE_funcrel => bases
                .func
                .ok_or(MemoryError::MissingBase(encoding.0))?,
            _ => return Err(MemoryError::UnsupportedEncoding(encoding.0)),
        };
        let value = value.wrapping_add(base);

        if encoding.is_indirect() {
            self.space.get_pointer(value)
        } else {
            Ok(value)
        }
    }
}

/// A single captured range of memory.
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    pub base: usize,
    pub bytes: &'a [u8],
}

impl Region<'_> {
    fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base
            && addr
                .checked_add(len)
                .zip(self.base.checked_add(self.bytes.len()))
                .is_some_and(|(end, region_end)| end <= region_end)
    }
}

/// Memory captured ahead of time: a stack copy, a section dump, a core file.
/// Anything outside the regions is unmapped.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    regions: Vec<Region<'a>>,
    endian: Endian,
}

impl<'a> Snapshot<'a> {
    pub fn new(endian: Endian) -> Self {
        Self {
            regions: Vec::new(),
            endian,
        }
    }

    pub fn native() -> Self {
        Self::new(Endian::NATIVE)
    }

    pub fn with_region(mut self, base: usize, bytes: &'a [u8]) -> Self {
        self.add_region(base, bytes);
        self
    }

    pub fn add_region(&mut self, base: usize, bytes: &'a [u8]) {
        self.regions.push(Region { base, bytes });
    }
}

impl AddressSpace for Snapshot<'_> {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr, buf.len()))
            .ok_or(MemoryError::Unmapped {
                addr,
                len: buf.len(),
            })?;
        let start = addr - region.base;
        buf.copy_from_slice(&region.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn endian(&self) -> Endian {
        self.endian
    }
}

/// The memory of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAddressSpace {
    validate: bool,
}

impl LocalAddressSpace {
    /// Trusts every address handed to it. Only sound when the unwind
    /// information and the stack are known to be intact.
    pub fn new() -> Self {
        Self { validate: false }
    }

    /// Checks every read with the kernel so that bad addresses become errors.
    pub fn validated() -> Self {
        Self { validate: true }
    }

    #[cfg(target_os = "linux")]
    fn checked_read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: core::ptr::with_exposed_provenance_mut(addr),
            iov_len: buf.len(),
        };
        // SAFETY: both iovecs describe `buf.len()` bytes, the local one is our buffer,
        // and the kernel validates the remote one for us.
        let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
        if read < 0 || read as usize != buf.len() {
            crate::stdext::with_last_os_error_str(|err| {
                trace!("process_vm_readv({addr:#x}, {}) failed: {err}", buf.len())
            });
            return Err(MemoryError::Unmapped {
                addr,
                len: buf.len(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn checked_read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        // SAFETY: no kernel-assisted validation available, same contract as `new`.
        unsafe { Self::raw_read(addr, buf) };
        Ok(())
    }

    unsafe fn raw_read(addr: usize, buf: &mut [u8]) {
        let src = core::ptr::with_exposed_provenance::<u8>(addr);
        // SAFETY: the caller promises that `addr..addr + buf.len()` is mapped.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }
}

impl AddressSpace for LocalAddressSpace {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        if addr == 0 {
            return Err(MemoryError::Unmapped {
                addr,
                len: buf.len(),
            });
        }
        if buf.is_empty() {
            return Ok(());
        }
        if self.validate {
            self.checked_read(addr, buf)
        } else {
            // SAFETY: unvalidated spaces trust the unwind info, see `LocalAddressSpace::new`.
            unsafe { Self::raw_read(addr, buf) };
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leb128() {
        #[rustfmt::skip]
        let data = [
            0xe5, 0x8e, 0x26, // uleb 624485
            0xc0, 0xbb, 0x78, // sleb -123456
            0x7f,             // sleb -1
            0x02,             // uleb 2
        ];
        let space = Snapshot::native().with_region(0x1000, &data);
        let mut r = Reader::new(&space, 0x1000, 0x1000 + data.len());
        assert_eq!(r.uleb128().unwrap(), 624485);
        assert_eq!(r.sleb128().unwrap(), -123456);
        assert_eq!(r.sleb128().unwrap(), -1);
        assert_eq!(r.uleb128().unwrap(), 2);
        assert!(r.is_empty());
        assert!(matches!(r.u8(), Err(MemoryError::PastLimit { .. })));
    }

    #[test]
    fn uleb_overflow_is_an_error() {
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let space = Snapshot::native().with_region(0x10, &data);
        let mut r = Reader::new(&space, 0x10, 0x10 + data.len());
        assert_eq!(r.uleb128(), Err(MemoryError::LebOverflow { addr: 0x10 }));
    }

    #[test]
    fn limit_stops_leb_in_the_middle() {
        let data = [0x80, 0x80, 0x01];
        let space = Snapshot::native().with_region(0x10, &data);
        let mut r = Reader::new(&space, 0x10, 0x12);
        assert!(matches!(r.uleb128(), Err(MemoryError::PastLimit { .. })));
    }

    #[test]
    fn snapshot_reads_respect_regions_and_endianness() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let le = Snapshot::new(Endian::Little).with_region(0x100, &data);
        let be = Snapshot::new(Endian::Big).with_region(0x100, &data);
        assert_eq!(le.get32(0x100).unwrap(), 0x7856_3412);
        assert_eq!(be.get32(0x100).unwrap(), 0x1234_5678);
        assert_eq!(be.get16(0x102).unwrap(), 0x5678);
        assert_eq!(
            le.get32(0x101),
            Err(MemoryError::Unmapped { addr: 0x101, len: 4 })
        );
        assert!(le.get8(0xff).is_err());

        // A region running past the end of the address space maps nothing.
        let wrapped = Snapshot::native().with_region(usize::MAX - 1, &data);
        assert_eq!(
            wrapped.get8(usize::MAX - 1),
            Err(MemoryError::Unmapped {
                addr: usize::MAX - 1,
                len: 1
            })
        );
    }

    #[test]
    fn encoded_pointers() {
        #[rustfmt::skip]
        let data = [
            0xf0, 0xff, 0xff, 0xff, // sdata4 -16
            0x10, 0x00,             // udata2 16
            0x20, 0x00, 0x00, 0x00, // udata4 0x20
        ];
        let space = Snapshot::native().with_region(0x2000, &data);
        let bases = EncodingBases {
            data: Some(0x8000),
            ..EncodingBases::default()
        };
        let mut r = Reader::new(&space, 0x2000, 0x2000 + data.len());
        // pcrel | sdata4
        assert_eq!(r.encoded_pointer(Encoding(0x1b), &bases).unwrap(), 0x2000 - 16);
        // datarel | udata2
        assert_eq!(r.encoded_pointer(Encoding(0x32), &bases).unwrap(), 0x8010);
        // textrel | udata4 without a text base
        assert_eq!(
            r.encoded_pointer(Encoding(0x23), &bases),
            Err(MemoryError::MissingBase(0x23))
        );
    }

    #[test]
    fn local_space_rejects_null_and_reads_own_memory() {
        let value: u64 = 0xdead_beef_cafe_f00d;
        let addr = (&raw const value).expose_provenance();
        let space = LocalAddressSpace::validated();
        assert_eq!(space.get64(addr).unwrap(), value);
        assert!(space.get64(0).is_err());
    }
}
