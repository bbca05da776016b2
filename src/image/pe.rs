//! PE section table translation

use std::mem;

use object::pe::{
    ImageDosHeader, ImageFileHeader, ImageSectionHeader, IMAGE_DOS_SIGNATURE, IMAGE_NT_SIGNATURE,
};
use object::{LittleEndian as LE, U32};

use super::{read_header, read_headers, ImageError};

/// Leading bytes of every PE image
pub const DOS_MAGIC: &[u8] = b"MZ";

/// Maps a file offset to an offset from the image base.
///
/// Offsets before the first section's raw data are in the headers, which are mapped 1:1.
/// Otherwise the first section whose raw data contains the offset decides.
///
/// # Safety
///
/// `base` must point to a mapped PE image whose headers are readable
pub unsafe fn file_offset_to_rva(base: *const u8, offset: usize) -> Result<usize, ImageError> {
    let dos = read_header::<ImageDosHeader>(base, 0, "DOS")?;
    if dos.e_magic.get(LE) != IMAGE_DOS_SIGNATURE {
        return Err(ImageError::BadHeader("DOS"));
    }

    let nt_offset = dos.e_lfanew.get(LE) as usize;
    let signature = read_header::<U32<LE>>(base, nt_offset, "NT")?;
    if signature.get(LE) != IMAGE_NT_SIGNATURE {
        return Err(ImageError::BadHeader("NT"));
    }

    let file_header_offset = nt_offset + mem::size_of::<U32<LE>>();
    let file_header = read_header::<ImageFileHeader>(base, file_header_offset, "file")?;

    // section headers follow the optional header, whatever its size
    let sections_offset = file_header_offset
        + mem::size_of::<ImageFileHeader>()
        + file_header.size_of_optional_header.get(LE) as usize;
    let count = file_header.number_of_sections.get(LE) as usize;
    let sections = read_headers::<ImageSectionHeader>(base, sections_offset, count, "section")?;

    let first = sections.first().ok_or(ImageError::OutOfRange(offset))?;
    if offset < first.pointer_to_raw_data.get(LE) as usize {
        return Ok(offset);
    }

    sections
        .iter()
        .find_map(|section| {
            // raw pointers and RVAs are 32-bit fields, so ranges wrapping past them are malformed
            let start = section.pointer_to_raw_data.get(LE);
            let end = start.checked_add(section.size_of_raw_data.get(LE))?;
            if !(start as usize..end as usize).contains(&offset) {
                return None;
            }
            let delta = u32::try_from(offset - start as usize).ok()?;
            let rva = section.virtual_address.get(LE).checked_add(delta)?;
            Some(rva as usize)
        })
        .ok_or(ImageError::OutOfRange(offset))
}
