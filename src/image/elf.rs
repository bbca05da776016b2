//! ELF program header translation
//!
//! The image base is where the first `PT_LOAD` segment is mapped, which is also where the ELF header lives.
//! Offsets returned here are relative to that base, not to the load bias.

use std::mem;

use object::elf::{ELFMAG, PT_LOAD};
use object::NativeEndian;

use super::{read_header, read_headers, ImageError};

#[cfg(target_pointer_width = "64")]
use object::elf::{
    FileHeader64 as FileHeader, ProgramHeader64 as ProgramHeader, ELFCLASS64 as ELFCLASS,
};

#[cfg(target_pointer_width = "32")]
use object::elf::{
    FileHeader32 as FileHeader, ProgramHeader32 as ProgramHeader, ELFCLASS32 as ELFCLASS,
};

/// Leading bytes of every ELF image
pub const ELF_MAGIC: [u8; 4] = ELFMAG;

/// Maps a file offset to an offset from the first `PT_LOAD` segment
///
/// # Safety
///
/// `base` must point to a mapped ELF image whose file and program headers are readable
pub unsafe fn file_offset_to_rva(base: *const u8, offset: usize) -> Result<usize, ImageError> {
    let header = read_header::<FileHeader<NativeEndian>>(base, 0, "ELF")?;
    if header.e_ident.magic != ELFMAG || header.e_ident.class != ELFCLASS {
        return Err(ImageError::BadHeader("ELF"));
    }
    let entry_size = header.e_phentsize.get(NativeEndian) as usize;
    if entry_size != mem::size_of::<ProgramHeader<NativeEndian>>() {
        return Err(ImageError::BadHeader("program"));
    }

    let phdrs = read_headers::<ProgramHeader<NativeEndian>>(
        base,
        header.e_phoff.get(NativeEndian) as usize,
        header.e_phnum.get(NativeEndian) as usize,
        "program",
    )?;

    let mut loads = phdrs
        .iter()
        .filter(|phdr| phdr.p_type.get(NativeEndian) == PT_LOAD)
        .peekable();
    let first_vaddr = match loads.peek() {
        Some(phdr) => phdr.p_vaddr.get(NativeEndian) as usize,
        None => return Err(ImageError::OutOfRange(offset)),
    };

    loads
        .find_map(|phdr| {
            let start = phdr.p_offset.get(NativeEndian) as usize;
            let size = phdr.p_filesz.get(NativeEndian) as usize;
            if !(start..start.checked_add(size)?).contains(&offset) {
                return None;
            }
            (phdr.p_vaddr.get(NativeEndian) as usize)
                .checked_sub(first_vaddr)?
                .checked_add(offset - start)
        })
        .ok_or(ImageError::OutOfRange(offset))
}
