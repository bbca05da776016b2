//! # Discover
//!
//! Finds patch files and loads them into one ordered list.
//! Files named by the list file come first, in listed order, followed by the autopatch directory sorted by path.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::descriptor::PatchDescriptor;
use crate::logger::{format_hex, Logger};
use crate::parser::{self, FileError};

/// A patch file that could not be loaded. Loading stops at the first one
#[derive(Debug, Error)]
#[error("failed to load patch file '{}': {source}", .path.display())]
pub struct LoadError {
    /// File that failed
    pub path: PathBuf,
    /// Why it failed
    #[source]
    pub source: FileError,
}

impl LoadError {
    /// 1-based line of the failure, 0 when the file itself could not be read
    pub fn line(&self) -> usize {
        self.source.line()
    }
}

/// Reads the list file. Blank lines and lines starting with `#` or `;` are skipped, missing files are warned about and skipped
pub fn collect_from_config(config: &Config, logger: &dyn Logger) -> Vec<PathBuf> {
    if !config.list_file.exists() {
        return Vec::new();
    }

    let contents = match fs::read_to_string(&config.list_file) {
        Ok(contents) => contents,
        Err(error) => {
            logger.warn(&format!(
                "Could not open config file '{}': {error}",
                config.list_file.display()
            ));
            return Vec::new();
        }
    };

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let path = config.resolve(line);
            if path.exists() {
                Some(path)
            } else {
                logger.warn(&format!("Patch file '{}' does not exist", path.display()));
                None
            }
        })
        .collect()
}

/// Regular files in the autopatch directory with the configured extension, sorted by path
pub fn collect_from_directory(config: &Config) -> Vec<PathBuf> {
    let entries = match fs::read_dir(&config.autopatch_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map_or(false, |extension| extension == config.extension.as_str())
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

/// Every patch file, list file entries first
pub fn collect(config: &Config, logger: &dyn Logger) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if config.list_file.exists() {
        logger.info(&format!(
            "Loading patches from config: {}",
            config.list_file.display()
        ));
        files = collect_from_config(config, logger);
    }
    files.extend(collect_from_directory(config));
    files
}

/// Parses `files` in order into one list. The first file that fails aborts the whole load
pub fn load_all(
    files: &[PathBuf],
    logger: &dyn Logger,
) -> Result<Vec<PatchDescriptor>, LoadError> {
    let mut patches = Vec::new();
    for path in files {
        logger.info(&format!("Opening memory patch file '{}'", path.display()));

        let parsed = parser::parse_file(path).map_err(|source| {
            logger.error(&format!("{} ({})", source, path.display()));
            LoadError {
                path: path.clone(),
                source,
            }
        })?;

        for patch in parsed {
            log_patch(&patch, logger);
            patches.push(patch);
        }
    }
    Ok(patches)
}

/// Logs what a parsed patch will do
pub fn log_patch(patch: &PatchDescriptor, logger: &dyn Logger) {
    logger.info(&format!(
        "Parsed {} from {} at {} {}",
        if patch.is_check() { "check" } else { "patch" },
        patch.origin(),
        patch.address_kind.name(),
        patch.target_name()
    ));
    if !patch.expected.is_empty() {
        logger.info(&format!(
            "     expected data [{}]: {}",
            patch.expected.len(),
            format_hex(&patch.expected)
        ));
    }
    if !patch.replacement.is_empty() {
        logger.info(&format!(
            "  replacement data [{}]: {}",
            patch.replacement.len(),
            format_hex(&patch.replacement)
        ));
    }
}
