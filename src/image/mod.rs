//! # Image
//!
//! Translates offsets into an image file on disk into pointers into the same image as it is mapped in memory.
//! Only the headers are read, and only images mapped with their section layout intact can be translated.

pub mod elf;
pub mod pe;

use std::slice;

use object::pod::{self, Pod};
use thiserror::Error;

/// Errors while translating a file offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImageError {
    /// No image base was supplied
    #[error("image base is null")]
    NullBase,
    /// The image starts with neither a PE nor an ELF signature
    #[error("image has an unrecognized header")]
    UnknownFormat,
    /// A header signature or size did not check out
    #[error("image has an invalid {0} header")]
    BadHeader(&'static str),
    /// The offset lies outside every section's on-disk range
    #[error("file offset 0x{0:X} is not inside any section")]
    OutOfRange(usize),
}

/// Reads a header structure at `offset` bytes from `base`
///
/// # Safety
///
/// `base + offset` must be readable for `size_of::<T>()` bytes
unsafe fn read_header<'a, T: Pod>(
    base: *const u8,
    offset: usize,
    name: &'static str,
) -> Result<&'a T, ImageError> {
    let data = slice::from_raw_parts(base.wrapping_add(offset), std::mem::size_of::<T>());
    pod::from_bytes::<T>(data)
        .map(|(header, _)| header)
        .map_err(|()| ImageError::BadHeader(name))
}

/// Reads `count` consecutive header structures at `offset` bytes from `base`
///
/// # Safety
///
/// `base + offset` must be readable for `count * size_of::<T>()` bytes
unsafe fn read_headers<'a, T: Pod>(
    base: *const u8,
    offset: usize,
    count: usize,
    name: &'static str,
) -> Result<&'a [T], ImageError> {
    let data = slice::from_raw_parts(
        base.wrapping_add(offset),
        count * std::mem::size_of::<T>(),
    );
    pod::slice_from_bytes::<T>(data, count)
        .map(|(headers, _)| headers)
        .map_err(|()| ImageError::BadHeader(name))
}

/// Maps `offset` within the on-disk image to the live pointer inside the image mapped at `base`.
///
/// The header format is detected from the leading signature.
///
/// # Safety
///
/// `base` must be null or point to a mapped image whose headers are readable
pub unsafe fn file_offset_to_ptr(base: *mut u8, offset: usize) -> Result<*mut u8, ImageError> {
    if base.is_null() {
        return Err(ImageError::NullBase);
    }

    let magic = slice::from_raw_parts(base, 4);
    let rva = if magic.starts_with(pe::DOS_MAGIC) {
        pe::file_offset_to_rva(base, offset)?
    } else if *magic == elf::ELF_MAGIC {
        elf::file_offset_to_rva(base, offset)?
    } else {
        return Err(ImageError::UnknownFormat);
    };

    Ok(base.wrapping_add(rva))
}
