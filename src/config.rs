//! # Config
//!
//! Where patch files are looked up. Everything hangs off one base directory,
//! which defaults to the directory this library was loaded from.

use std::path::{Path, PathBuf};

use crate::platform;

/// Environment variable overriding [`Config::base_dir`]
pub const DIR_VAR: &str = "MODPATCH_DIR";
/// File listing patch files, one path per line
pub const LIST_FILE: &str = "patches.txt";
/// Directory scanned for patch files
pub const AUTOPATCH_DIR: &str = "autopatch";
/// Extension of patch files found by directory scan
pub const EXTENSION: &str = "mph";

/// Patch file locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory relative list entries are resolved against
    pub base_dir: PathBuf,
    /// Optional list of patch files
    pub list_file: PathBuf,
    /// Directory scanned for `*.mph` files
    pub autopatch_dir: PathBuf,
    /// Extension matched by the directory scan, without the dot
    pub extension: String,
}

impl Config {
    /// Default layout under `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            list_file: base_dir.join(LIST_FILE),
            autopatch_dir: base_dir.join(AUTOPATCH_DIR),
            extension: EXTENSION.to_owned(),
            base_dir,
        }
    }

    /// Reads [`DIR_VAR`], falling back to the directory of the loaded library and then the working directory
    pub fn from_env() -> Self {
        let base_dir = std::env::var_os(DIR_VAR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .or_else(module_dir)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base_dir)
    }

    /// Resolves a path from the list file. Relative entries are taken relative to [`Config::base_dir`]
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.base_dir.join(path)
    }
}

/// Directory containing the library
fn module_dir() -> Option<PathBuf> {
    let module = platform::current_module()?;
    module
        .path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}
