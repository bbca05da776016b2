//! # Parser
//!
//! Reads patch files. Each non-comment line describes one patch:
//!
//! ```text
//! <target> <offset> <on-bytes> [<off-bytes>]
//! ```
//!
//! - `target`: bare token or `"quoted string"`. `-` binds to no image, `<host>` is the main executable
//! - `offset`: hex, optionally prefixed with `f+` for an offset into the image file on disk
//! - `on-bytes`: hex bytes to write, or `-` to only validate
//! - `off-bytes`: hex bytes expected before writing

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hex::FromHexError;
use thiserror::Error;

use crate::descriptor::{AddressKind, PatchDescriptor, Target};

/// Token standing in for "no bytes"
const NO_DATA: &str = "-";

/// Errors for a single line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Blank or comment line. Not an error at file granularity
    #[error("line is empty or a comment")]
    LineEmpty,
    /// Missing target terminator, offset or data
    #[error("line does not contain enough arguments")]
    InsufficientArgs,
    /// More than three tokens after the target
    #[error("line contains too many arguments")]
    TooManyArgs,
    /// Quoted target without a closing quote
    #[error("target filename contains an unclosed quote")]
    TargetUnclosedQuote,
    /// Offset is not a hexadecimal number that fits in a pointer
    #[error("offset is not a valid hexadecimal number")]
    BadOffsetAddress,
    /// Odd number of hex digits
    #[error("data length is not a multiple of 2")]
    BadDataLength,
    /// Non-hex character in the data
    #[error("data contains invalid hex characters")]
    BadDataBytes,
}

/// Errors for a whole file. The first bad line aborts the file
#[derive(Debug, Error)]
pub enum FileError {
    /// Path does not exist
    #[error("input file '{}' does not exist", .0.display())]
    NotFound(PathBuf),
    /// Path exists but could not be read
    #[error("input file '{}' could not be opened: {source}", .path.display())]
    Open {
        /// File that failed to open
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: io::Error,
    },
    /// A line failed to parse
    #[error("parsing failed on line {line}: {error}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What was wrong with it
        error: ParseError,
    },
}

impl FileError {
    /// 1-based line of the failure, 0 when the file itself could not be read
    pub fn line(&self) -> usize {
        match self {
            Self::Parse { line, .. } => *line,
            _ => 0,
        }
    }
}

/// Splits the target off the front of `line`, returning it with the remainder
fn read_target(line: &str) -> Result<(&str, &str), ParseError> {
    if let Some(quoted) = line.strip_prefix('"') {
        let end = quoted.find('"').ok_or(ParseError::TargetUnclosedQuote)?;
        return Ok((&quoted[..end], &quoted[end + 1..]));
    }

    let end = line
        .find(char::is_whitespace)
        .ok_or(ParseError::InsufficientArgs)?;
    Ok((&line[..end], &line[end..]))
}

/// Parses an offset token into its kind and value
fn read_offset(token: &str) -> Result<(AddressKind, usize), ParseError> {
    let (kind, digits) = match token.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("f+") => {
            (AddressKind::FileRelative, &token[2..])
        }
        _ => (AddressKind::ImageRelative, token),
    };

    // `from_str_radix` alone would accept a leading sign
    if digits.is_empty() || !digits.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::BadOffsetAddress);
    }
    let address = usize::from_str_radix(digits, 16).map_err(|_| ParseError::BadOffsetAddress)?;
    Ok((kind, address))
}

/// Decodes a hex byte string, `-` meaning no bytes
pub fn read_data(token: &str) -> Result<Vec<u8>, ParseError> {
    if token == NO_DATA {
        return Ok(Vec::new());
    }
    hex::decode(token).map_err(|e| match e {
        FromHexError::OddLength => ParseError::BadDataLength,
        _ => ParseError::BadDataBytes,
    })
}

/// Parses one line. Provenance fields are left empty, see [`parse_file`]
pub fn parse_line(line: &str) -> Result<PatchDescriptor, ParseError> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') {
        return Err(ParseError::LineEmpty);
    }

    let (target, remainder) = read_target(line)?;
    let target = Target::from_token(target);

    let args: Vec<&str> = remainder.split_whitespace().collect();
    if args.len() < 2 {
        return Err(ParseError::InsufficientArgs);
    }
    if args.len() > 3 {
        return Err(ParseError::TooManyArgs);
    }

    let (mut address_kind, address) = read_offset(args[0])?;
    if target == Target::Unbound {
        address_kind = AddressKind::Absolute;
    }

    let replacement = read_data(args[1])?;
    let expected = match args.get(2) {
        Some(token) => read_data(token)?,
        None => Vec::new(),
    };

    if replacement.is_empty() && expected.is_empty() {
        return Err(ParseError::InsufficientArgs);
    }

    Ok(PatchDescriptor {
        address_kind,
        address,
        target,
        replacement,
        expected,
        source_file: String::new(),
        source_line: 0,
    })
}

/// Parses every line of `path`, in order.
///
/// Blank and comment lines are skipped; any other error aborts the file.
pub fn parse_file(path: impl AsRef<Path>) -> Result<Vec<PatchDescriptor>, FileError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FileError::NotFound(path.to_owned()));
    }

    let contents = fs::read_to_string(path).map_err(|source| FileError::Open {
        path: path.to_owned(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut patches = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let mut patch = match parse_line(line) {
            Ok(patch) => patch,
            Err(ParseError::LineEmpty) => continue,
            Err(error) => {
                return Err(FileError::Parse {
                    line: index + 1,
                    error,
                })
            }
        };
        patch.source_file = file_name.clone();
        patch.source_line = index + 1;
        patches.push(patch);
    }

    Ok(patches)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    /// Blank, whitespace-only and comment lines are classified as empty
    fn test_empty_lines() {
        for line in ["", "   ", "\t", "# comment", "   # indented comment"] {
            assert_eq!(parse_line(line), Err(ParseError::LineEmpty), "{line:?}");
        }
    }

    #[test]
    /// A full line with a quoted target and expected bytes
    fn test_full_line() {
        let patch = parse_line("\"kernel32.dll\" f+1A0 9090 7405").unwrap();
        assert_eq!(patch.target, Target::Image("kernel32.dll".into()));
        assert_eq!(patch.address_kind, AddressKind::FileRelative);
        assert_eq!(patch.address, 0x1a0);
        assert_eq!(patch.replacement, [0x90, 0x90]);
        assert_eq!(patch.expected, [0x74, 0x05]);
    }

    #[test]
    /// Quoted targets may contain spaces
    fn test_quoted_target_with_spaces() {
        let patch = parse_line("\"my game.exe\" 10 00").unwrap();
        assert_eq!(patch.target, Target::Image("my game.exe".into()));
        assert_eq!(patch.address_kind, AddressKind::ImageRelative);
    }

    #[test]
    /// `-` forces absolute addressing even with a file prefix
    fn test_unbound_is_absolute() {
        let patch = parse_line("- DEADBEEF 00").unwrap();
        assert_eq!(patch.target, Target::Unbound);
        assert_eq!(patch.address_kind, AddressKind::Absolute);
        assert_eq!(patch.address, 0xdeadbeef);

        let patch = parse_line("- F+10 00").unwrap();
        assert_eq!(patch.address_kind, AddressKind::Absolute);
        assert_eq!(patch.address, 0x10);
    }

    #[test]
    /// `<host>` names the main executable
    fn test_host_target() {
        let patch = parse_line("<host>\t400\t- C3").unwrap();
        assert_eq!(patch.target, Target::Host);
        assert!(patch.replacement.is_empty());
        assert_eq!(patch.expected, [0xc3]);
    }

    #[test]
    /// Argument count errors
    fn test_arg_counts() {
        assert_eq!(
            parse_line("game.dll 10 90 90 90"),
            Err(ParseError::TooManyArgs)
        );
        assert_eq!(parse_line("game.dll 10"), Err(ParseError::InsufficientArgs));
        assert_eq!(parse_line("game.dll"), Err(ParseError::InsufficientArgs));
        assert_eq!(parse_line("game.dll 10 -"), Err(ParseError::InsufficientArgs));
        assert_eq!(parse_line("game.dll 10 - -"), Err(ParseError::InsufficientArgs));
    }

    #[test]
    /// Unclosed quotes are reported as such
    fn test_unclosed_quote() {
        assert_eq!(
            parse_line("\"game.dll 10 90"),
            Err(ParseError::TargetUnclosedQuote)
        );
    }

    #[test]
    /// Offsets must be plain hex
    fn test_bad_offsets() {
        for line in [
            "game.dll 10g 90",
            "game.dll +10 90",
            "game.dll 0x10 90",
            "game.dll f+ 90",
            "game.dll f-10 90",
            "game.dll 1FFFFFFFFFFFFFFFFF 90",
        ] {
            assert_eq!(parse_line(line), Err(ParseError::BadOffsetAddress), "{line}");
        }
    }

    #[test]
    /// Data decoding errors
    fn test_bad_data() {
        assert_eq!(parse_line("game.dll 10 909"), Err(ParseError::BadDataLength));
        assert_eq!(parse_line("game.dll 10 9G"), Err(ParseError::BadDataBytes));
        assert_eq!(parse_line("game.dll 10 90 7"), Err(ParseError::BadDataLength));
        assert_eq!(parse_line("game.dll 10 90 zz"), Err(ParseError::BadDataBytes));
    }

    #[test]
    /// Hex data decodes pairwise regardless of casing
    fn test_read_data() {
        assert_eq!(read_data("deADbeEF").unwrap(), [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(read_data("-").unwrap(), Vec::<u8>::new());
        assert_eq!(read_data("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    /// The canonical form of a parsed line parses back to the same descriptor
    fn test_round_trip() {
        for line in [
            "game.dll 1A0 9090",
            "\"my game.exe\" f+400 EB - ",
            "<host> FF - C3C3",
            "- 7FF612340000 DEADBEEF 00000000",
            "\"#mod.dll\" 10 90",
            "\"\" 20 C3",
        ] {
            let patch = parse_line(line).unwrap();
            assert_eq!(parse_line(&patch.to_string()).unwrap(), patch, "{line}");
        }
    }

    #[test]
    /// Files skip comments and stamp provenance
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixes.mph");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# disable the intro").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "\"game.dll\" 1000 EB 74").unwrap();
        writeln!(file, "- 2000 90\r").unwrap();
        drop(file);

        let patches = parse_file(&path).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].source_file, "fixes.mph");
        assert_eq!(patches[0].source_line, 3);
        assert_eq!(patches[1].source_line, 4);
        assert_eq!(patches[1].replacement, [0x90]);
    }

    #[test]
    /// The first bad line aborts the file with its line number
    fn test_parse_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mph");
        fs::write(&path, "game.dll 10 90\n\ngame.dll 20 909\ngame.dll 30 90\n").unwrap();

        let err = parse_file(&path).unwrap_err();
        assert_eq!(err.line(), 3);
        assert!(matches!(
            err,
            FileError::Parse {
                line: 3,
                error: ParseError::BadDataLength
            }
        ));
    }

    #[test]
    /// Missing files are reported without a line
    fn test_parse_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_file(dir.path().join("nope.mph")).unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
        assert_eq!(err.line(), 0);
    }
}
