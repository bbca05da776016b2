//! # Patcher
//!
//! This module resolves patch descriptors to live memory, checks their preconditions and writes them.
//! The patcher keeps no state between calls; every call resolves from scratch and either fully succeeds or fails without writing.

pub mod byte;
pub mod mem;

use thiserror::Error;

use crate::descriptor::{AddressKind, PatchDescriptor};
use crate::image::{self, ImageError};
use crate::logger::{format_hex, SharedLogger};

use self::byte::Precondition;
use self::mem::ProtectionGuard;

/// Hard failures while applying a patch. Each is logged before it is returned
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The declared offset could not be turned into a pointer
    #[error("failed to resolve offset 0x{address:X}: {source}")]
    Resolve {
        /// Offset that failed to resolve
        address: usize,
        /// Why it failed
        #[source]
        source: ImageError,
    },
    /// Live memory matched neither the expected nor the replacement bytes
    #[error("data validation failed, expected {expected:02X?} but found {actual:02X?}")]
    Mismatch {
        /// Bytes the patch expected
        expected: Vec<u8>,
        /// Bytes that were there
        actual: Vec<u8>,
    },
    /// The target range could not be made writable
    #[error("error setting memory protections: {0}")]
    Protection(#[from] region::Error),
}

/// Successful outcomes of [`Patcher::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Replacement bytes were written at `address`
    Written {
        /// Resolved address of the write
        address: usize,
    },
    /// Validate-only patch whose expected bytes matched
    Validated,
    /// The replacement bytes were already in place, nothing was written
    AlreadyApplied,
}

/// Applies patch descriptors to memory
#[derive(Clone)]
pub struct Patcher {
    /// Sink for every outcome
    logger: SharedLogger,
}

impl Patcher {
    /// Creates a new patcher logging to `logger`
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }

    /// Resolves `patch` against the image mapped at `base`, validates it and writes it.
    ///
    /// `base` is ignored for absolute patches and may be null for them.
    ///
    /// # Safety
    ///
    /// The resolved range must be mapped memory that is valid to read for the expected and replacement lengths.
    /// Writing the replacement bytes there must not break any invariant that code running in the process relies on.
    pub unsafe fn apply(
        &self,
        base: *mut u8,
        patch: &PatchDescriptor,
    ) -> Result<Applied, ApplyError> {
        let location = self.resolve(base, patch)?;

        if !patch.expected.is_empty() {
            match byte::check(location, &patch.expected, &patch.replacement) {
                Precondition::Matches => {}
                Precondition::AlreadyApplied => {
                    self.logger.warn(&format!(
                        "Patch from {}  at {}  0x{:X} has already been applied",
                        patch.origin(),
                        patch.address_kind.name(),
                        patch.address
                    ));
                    return Ok(Applied::AlreadyApplied);
                }
                Precondition::Mismatch(actual) => {
                    self.logger.error(&format!(
                        "Data validation failed  ({}  at {}  0x{:X})\n     expected [{}]: {}\n     actual   [{}]: {}",
                        patch.origin(),
                        patch.address_kind.name(),
                        patch.address,
                        patch.expected.len(),
                        format_hex(&patch.expected),
                        actual.len(),
                        format_hex(&actual)
                    ));
                    return Err(ApplyError::Mismatch {
                        expected: patch.expected.clone(),
                        actual,
                    });
                }
            }
        }

        if patch.is_check() {
            self.logger.info(&format!(
                "Validated data from {}  at {}  {} (0x{:X})",
                patch.origin(),
                patch.address_kind.name(),
                patch.target_name(),
                location as usize
            ));
            return Ok(Applied::Validated);
        }

        self.write(location, patch)
    }

    /// Computes the live pointer a patch refers to
    ///
    /// # Safety
    ///
    /// For file relative patches, `base` must be null or point to a mapped image with readable headers
    unsafe fn resolve(
        &self,
        base: *mut u8,
        patch: &PatchDescriptor,
    ) -> Result<*mut u8, ApplyError> {
        let resolved = match patch.address_kind {
            AddressKind::Absolute => return Ok(patch.address as *mut u8),
            AddressKind::ImageRelative if base.is_null() => Err(ImageError::NullBase),
            AddressKind::ImageRelative => Ok(base.wrapping_add(patch.address)),
            AddressKind::FileRelative => image::file_offset_to_ptr(base, patch.address),
        };

        resolved.map_err(|source| {
            self.logger.error(&format!(
                "Failed to convert {} offset 0x{:X} to an address: {}  ({})",
                patch.address_kind.name(),
                patch.address,
                source,
                patch.origin()
            ));
            ApplyError::Resolve {
                address: patch.address,
                source,
            }
        })
    }

    /// Writes the replacement bytes with the page temporarily unprotected
    ///
    /// # Safety
    ///
    /// `location` must be mapped for the length of the replacement bytes
    unsafe fn write(
        &self,
        location: *mut u8,
        patch: &PatchDescriptor,
    ) -> Result<Applied, ApplyError> {
        let guard = match ProtectionGuard::acquire(location, patch.replacement.len()) {
            Ok(guard) => guard,
            Err(error) => {
                self.logger.error(&format!(
                    "Changing memory protection failed for patch {}  at {}  0x{:X}: {}",
                    patch.origin(),
                    patch.address_kind.name(),
                    patch.address,
                    error
                ));
                return Err(error.into());
            }
        };

        byte::write(guard.location(), &patch.replacement);
        drop(guard);

        let mut message = format!(
            "Applied patch from {}  at {}  {}",
            patch.origin(),
            patch.address_kind.name(),
            patch.target_name()
        );
        if patch.address_kind != AddressKind::Absolute {
            message.push_str(&format!(" -> 0x{:X}", location as usize));
        }
        self.logger.info(&message);

        Ok(Applied::Written {
            address: location as usize,
        })
    }
}
