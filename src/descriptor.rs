//! # Descriptor
//!
//! A [`PatchDescriptor`] is one requested byte edit, as read from a patch file

use std::fmt::{self, Display};
use std::ops::Range;

/// Target token meaning "not bound to any image"
pub const UNBOUND_TOKEN: &str = "-";
/// Target token naming the primary executable of the process
pub const HOST_TOKEN: &str = "<host>";

/// How [`PatchDescriptor::address`] is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// The address is a pointer, no image base is involved
    Absolute,
    /// Offset from the base of the image as it is mapped in memory
    ImageRelative,
    /// Offset into the image file on disk, translated through the section table
    FileRelative,
}

impl AddressKind {
    /// Human readable name used in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Self::Absolute => "absolute address",
            Self::ImageRelative => "RVA",
            Self::FileRelative => "file",
        }
    }
}

/// Image a patch applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// `-`: no image, the address is used as a literal pointer
    Unbound,
    /// `<host>`: the primary executable image of the process
    Host,
    /// Any other image, matched by its file name
    Image(String),
}

impl Target {
    /// Classifies a raw target token
    pub fn from_token(token: &str) -> Self {
        match token {
            UNBOUND_TOKEN => Self::Unbound,
            HOST_TOKEN => Self::Host,
            name => Self::Image(name.to_owned()),
        }
    }

    /// The token as it appears in a patch file
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unbound => UNBOUND_TOKEN,
            Self::Host => HOST_TOKEN,
            Self::Image(name) => name,
        }
    }

    /// Whether this target is the image reported under `name` by a load notification
    pub fn matches(&self, name: &str) -> bool {
        matches!(self, Self::Image(image) if image == name)
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declarative byte edit
///
/// `replacement` and `expected` are never both empty: a patch validates something, writes something, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescriptor {
    /// How `address` is interpreted
    pub address_kind: AddressKind,
    /// Offset or pointer value
    pub address: usize,
    /// Image the patch applies to
    pub target: Target,
    /// Bytes to write. Empty means validate only
    pub replacement: Vec<u8>,
    /// Bytes that must be present before writing. Empty means no precondition
    pub expected: Vec<u8>,
    /// File name the patch was read from
    pub source_file: String,
    /// 1-based line in `source_file`
    pub source_line: usize,
}

impl PatchDescriptor {
    /// Location description used in diagnostics: `0x1000` or `'game.dll'+0x1000`
    pub fn target_name(&self) -> String {
        match self.address_kind {
            AddressKind::Absolute => format!("0x{:X}", self.address),
            _ => format!("'{}'+0x{:X}", self.target, self.address),
        }
    }

    /// `'file':line` provenance used in diagnostics
    pub fn origin(&self) -> String {
        format!("'{}':{}", self.source_file, self.source_line)
    }

    /// Whether this patch only checks memory and never writes
    pub fn is_check(&self) -> bool {
        self.replacement.is_empty()
    }

    /// Declared range this patch writes, in its own address space
    pub fn write_range(&self) -> Range<usize> {
        self.address..self.address.saturating_add(self.replacement.len())
    }

    /// Whether both patches write to intersecting bytes of the same address space
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_check() || other.is_check() {
            return false;
        }
        if self.target != other.target || self.address_kind != other.address_kind {
            return false;
        }
        let (a, b) = (self.write_range(), other.write_range());
        a.start < b.end && b.start < a.end
    }
}

/// Writes the canonical line form, which parses back into an equal descriptor (minus provenance)
impl Display for PatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // a bare leading `#` would read back as a comment
        let target = self.target.as_str();
        if target.is_empty() || target.starts_with('#') || target.contains(char::is_whitespace) {
            write!(f, "\"{target}\"")?;
        } else {
            f.write_str(target)?;
        }

        match self.address_kind {
            AddressKind::FileRelative => write!(f, " f+{:X}", self.address)?,
            _ => write!(f, " {:X}", self.address)?,
        }

        if self.replacement.is_empty() {
            f.write_str(" -")?;
        } else {
            write!(f, " {}", hex::encode_upper(&self.replacement))?;
        }

        if !self.expected.is_empty() {
            write!(f, " {}", hex::encode_upper(&self.expected))?;
        }
        Ok(())
    }
}

/// Finds the first pair of patches whose writes intersect, as indices into `patches`
pub fn find_overlap(patches: &[PatchDescriptor]) -> Option<(usize, usize)> {
    patches.iter().enumerate().find_map(|(i, first)| {
        patches[i + 1..]
            .iter()
            .position(|second| first.overlaps(second))
            .map(|j| (i, i + 1 + j))
    })
}
