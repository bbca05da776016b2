//! This module contains a guard which adjusts memory permissions to patch read-only code and data

use region::Protection;

/// Makes a range of memory writable (and executable, since the range is usually code) until dropped.
/// The original protection is restored when the guard goes out of scope, including on early returns.
///
/// # Safety
///
/// Protection changes apply to whole pages. Two guards over the same pages restore in drop order,
/// so overlapping guards on different threads can leave a page with the wrong protection.
#[must_use = "the protection is restored as soon as the guard is dropped"]
pub struct ProtectionGuard {
    /// Handle restoring the previous protection on drop
    _handle: region::ProtectGuard,
    /// Start of the unprotected range
    location: *mut u8,
}

impl ProtectionGuard {
    /// Makes `[location, location + len)` readable, writable and executable.
    ///
    /// # Safety
    ///
    /// `location` must point into mapped memory valid for `len` bytes.
    /// The caller must not let code running elsewhere depend on the current protection of those pages while the guard is alive.
    pub unsafe fn acquire(location: *mut u8, len: usize) -> Result<Self, region::Error> {
        let handle =
            region::protect_with_handle(location as *const u8, len, Protection::READ_WRITE_EXECUTE)?;
        Ok(Self {
            _handle: handle,
            location,
        })
    }

    /// Start of the writable range
    pub fn location(&self) -> *mut u8 {
        self.location
    }
}
