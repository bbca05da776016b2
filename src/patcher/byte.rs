//! This module contains the byte-level reads, comparisons and writes behind a patch

use std::{ptr, slice};

/// Result of comparing live memory against a patch's expected bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Live memory holds the expected bytes
    Matches,
    /// Live memory already holds the replacement bytes
    AlreadyApplied,
    /// Live memory holds neither. Carries what was actually there
    Mismatch(Vec<u8>),
}

/// Copies `len` bytes out of `location`
///
/// # Safety
///
/// `location` must be readable for `len` bytes
pub unsafe fn read(location: *const u8, len: usize) -> Vec<u8> {
    slice::from_raw_parts(location, len).to_vec()
}

/// Compares memory at `location` against `expected`, falling back to `replacement` so re-runs are idempotent.
/// An empty `replacement` never counts as already applied.
///
/// # Safety
///
/// `location` must be readable for the length of both `expected` and `replacement`
pub unsafe fn check(location: *const u8, expected: &[u8], replacement: &[u8]) -> Precondition {
    if slice::from_raw_parts(location, expected.len()) == expected {
        return Precondition::Matches;
    }

    if !replacement.is_empty() && slice::from_raw_parts(location, replacement.len()) == replacement
    {
        return Precondition::AlreadyApplied;
    }

    Precondition::Mismatch(read(location, expected.len()))
}

/// Copies `data` to `location`
///
/// # Safety
///
/// `location` must be writable for `data.len()` bytes and must not overlap `data`
pub unsafe fn write(location: *mut u8, data: &[u8]) {
    ptr::copy_nonoverlapping(data.as_ptr(), location, data.len());
}
