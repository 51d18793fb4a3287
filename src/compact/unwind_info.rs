//! Lookup in the Mach-O `__unwind_info` section.
//!
//! The section is a two level index. The first level is a sorted array of
//! function offsets (relative to the image base), each pointing to a second
//! level page and to the slice of the LSDA index for the same functions. A
//! sentinel entry at the end holds the end of the last function. Second level
//! pages come in two kinds: regular pages store `(function offset, encoding)`
//! pairs, compressed pages store 24 bit offsets relative to the first level
//! entry and an 8 bit index into the common or page-local encoding table.

use super::{CompactEncoding, CompactError};
use crate::addr_space::{AddressSpace, Reader};

const UNWIND_SECTION_VERSION: u32 = 1;
const REGULAR_PAGE_KIND: u32 = 2;
const COMPRESSED_PAGE_KIND: u32 = 3;

const INDEX_ENTRY_SIZE: usize = 12;
const LSDA_ENTRY_SIZE: usize = 8;
const REGULAR_ENTRY_SIZE: usize = 8;

/// Where an `__unwind_info` section is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSection {
    pub address: usize,
    pub len: usize,
    /// The Mach-O header of the image, which all offsets are relative to.
    pub image_base: usize,
}

/// The entry covering a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactEntry {
    pub start_ip: usize,
    pub end_ip: usize,
    pub encoding: CompactEncoding,
    pub personality: Option<usize>,
    pub lsda: Option<usize>,
}

#[derive(Debug)]
struct Header {
    common_encodings: usize,
    common_encodings_count: u32,
    personalities: usize,
    personalities_count: u32,
    index: usize,
    index_count: u32,
}

#[derive(Debug)]
struct IndexEntry {
    function_offset: u32,
    second_level_page: usize,
    lsda_index: usize,
}

fn header<S: AddressSpace + ?Sized>(
    space: &S,
    section: &CompactSection,
) -> Result<Header, CompactError> {
    let end = section.address + section.len;
    let mut reader = Reader::new(space, section.address, end);
    let version = reader.u32()?;
    if version != UNWIND_SECTION_VERSION {
        return Err(CompactError::UnsupportedVersion(version));
    }
    let base = section.address;
    let common_encodings = base + reader.u32()? as usize;
    let common_encodings_count = reader.u32()?;
    let personalities = base + reader.u32()? as usize;
    let personalities_count = reader.u32()?;
    let index = base + reader.u32()? as usize;
    let index_count = reader.u32()?;
    Ok(Header {
        common_encodings,
        common_encodings_count,
        personalities,
        personalities_count,
        index,
        index_count,
    })
}

fn index_entry<S: AddressSpace + ?Sized>(
    space: &S,
    section: &CompactSection,
    header: &Header,
    n: u32,
) -> Result<IndexEntry, CompactError> {
    let mut reader = Reader::unbounded(space, header.index + n as usize * INDEX_ENTRY_SIZE);
    Ok(IndexEntry {
        function_offset: reader.u32()?,
        second_level_page: section.address + reader.u32()? as usize,
        lsda_index: section.address + reader.u32()? as usize,
    })
}

/// Binary search over `count` sorted keys for the last one `<= target`.
fn last_at_or_before(
    count: u32,
    target: u32,
    mut key: impl FnMut(u32) -> Result<u32, CompactError>,
) -> Result<Option<u32>, CompactError> {
    let mut low = 0;
    let mut high = count;
    while low < high {
        let mid = low + (high - low) / 2;
        if key(mid)? <= target {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    Ok(low.checked_sub(1))
}

/// Finds the compact unwind entry of the function containing `pc`.
#[instrument(level = "trace", skip(space), err)]
pub fn find_entry<S: AddressSpace + ?Sized>(
    space: &S,
    section: &CompactSection,
    pc: usize,
) -> Result<Option<CompactEntry>, CompactError> {
    let header = header(space, section)?;
    let Some(target) = pc
        .checked_sub(section.image_base)
        .and_then(|offset| u32::try_from(offset).ok())
    else {
        return Ok(None);
    };
    if header.index_count < 2 {
        return Ok(None);
    }

    // The last entry is the sentinel and never a candidate itself.
    let pages = header.index_count - 1;
    let Some(page) = last_at_or_before(pages, target, |n| {
        Ok(index_entry(space, section, &header, n)?.function_offset)
    })?
    else {
        return Ok(None);
    };
    let first = index_entry(space, section, &header, page)?;
    let next = index_entry(space, section, &header, page + 1)?;
    if target >= next.function_offset {
        return Ok(None);
    }
    trace!(?first, "first level entry");

    let mut reader = Reader::unbounded(space, first.second_level_page);
    let kind = reader.u32()?;
    let entries = first.second_level_page + reader.u16()? as usize;
    let count = u32::from(reader.u16()?);

    let (start, end, encoding) = match kind {
        REGULAR_PAGE_KIND => {
            let entry = |n: u32| entries + n as usize * REGULAR_ENTRY_SIZE;
            let Some(n) = last_at_or_before(count, target, |n| Ok(space.get32(entry(n))?))? else {
                return Ok(None);
            };
            let start = space.get32(entry(n))?;
            let encoding = space.get32(entry(n) + 4)?;
            let end = if n + 1 < count {
                space.get32(entry(n + 1))?
            } else {
                next.function_offset
            };
            (start, end, encoding)
        }
        COMPRESSED_PAGE_KIND => {
            let encodings = first.second_level_page + reader.u16()? as usize;
            let encodings_count = u32::from(reader.u16()?);
            let function = |n: u32| -> Result<u32, CompactError> {
                Ok(space.get32(entries + n as usize * 4)? & 0x00FF_FFFF)
            };
            let page_target = target - first.function_offset;
            let Some(n) = last_at_or_before(count, page_target, &function)? else {
                return Ok(None);
            };
            let raw = space.get32(entries + n as usize * 4)?;
            let start = first.function_offset + (raw & 0x00FF_FFFF);
            let end = if n + 1 < count {
                first.function_offset + function(n + 1)?
            } else {
                next.function_offset
            };

            let index = raw >> 24;
            let encoding = if index < header.common_encodings_count {
                space.get32(header.common_encodings + index as usize * 4)?
            } else {
                let local = index - header.common_encodings_count;
                if local >= encodings_count {
                    return Err(CompactError::BadEncodingIndex(index));
                }
                space.get32(encodings + local as usize * 4)?
            };
            (start, end, encoding)
        }
        kind => return Err(CompactError::BadPageKind(kind)),
    };
    if target < start || target >= end {
        return Ok(None);
    }
    let encoding = CompactEncoding(encoding);

    let lsda = if encoding.has_lsda() {
        let count = (next.lsda_index.saturating_sub(first.lsda_index) / LSDA_ENTRY_SIZE) as u32;
        let entry = |n: u32| first.lsda_index + n as usize * LSDA_ENTRY_SIZE;
        let found = last_at_or_before(count, start, |n| Ok(space.get32(entry(n))?))?
            .filter(|&n| space.get32(entry(n)).is_ok_and(|function| function == start));
        let Some(n) = found else {
            return Err(CompactError::MissingLsda(section.image_base + start as usize));
        };
        Some(section.image_base + space.get32(entry(n) + 4)? as usize)
    } else {
        None
    };

    let personality = match encoding.personality_index() {
        0 => None,
        index if index > header.personalities_count => {
            return Err(CompactError::BadPersonalityIndex(index))
        }
        index => {
            // The table holds the offset of a GOT slot with the pointer.
            let delta = space.get32(header.personalities + (index as usize - 1) * 4)?;
            Some(space.get_pointer(section.image_base + delta as usize)?)
        }
    };

    let entry = CompactEntry {
        start_ip: section.image_base + start as usize,
        end_ip: section.image_base + end as usize,
        encoding,
        personality,
        lsda,
    };
    debug!(?entry, "found compact unwind entry");
    Ok(Some(entry))
}
