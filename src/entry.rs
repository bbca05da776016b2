//! Runs when the library is mapped into a process, with the `autoload` feature.
//!
//! Patch files are discovered from [`Config::from_env`], everything already mapped is patched right away,
//! and the coordinator stays alive in a global until every image it waits for has loaded.

use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use thiserror::Error;

use crate::config::Config;
use crate::coordinator::{Coordinator, PlaceError};
use crate::discover::{self, LoadError};
use crate::logger::{self, SharedLogger, TracingLogger};
use crate::platform::{self, NativeLoader};

lazy_static! {
    /// Coordinator of the running process, kept alive while patches are pending
    static ref ATTACHED: Mutex<Option<Coordinator<NativeLoader>>> = Mutex::new(None);
}

/// Reasons attaching gives up
#[derive(Debug, Error)]
enum AttachError {
    /// Neither the list file nor the autopatch directory named a patch file
    #[error("no patch files could be found")]
    NoFiles,
    /// A patch file failed to load
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Placing the patches failed
    #[error(transparent)]
    Place(#[from] PlaceError),
}

#[ctor::ctor]
fn attach() {
    logger::init();
    let logger = TracingLogger::shared();

    if let Err(error) = run(&logger) {
        logger.error(&format!("Giving up: {error}"));
    }
}

/// Discovers, loads and places every patch
fn run(logger: &SharedLogger) -> Result<(), AttachError> {
    let host = std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.file_name()?.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "<unknown>".to_owned());
    let base = platform::current_module().map_or(0, |module| module.base);
    logger.info(&format!("modpatch loaded in '{host}' at 0x{base:X}"));

    let config = Config::from_env();
    let files = discover::collect(&config, logger.as_ref());
    if files.is_empty() {
        logger.warn("No patch files could be found");
        logger.warn(&format!(
            "Create a '{}' file in '{}' with paths to .{} files",
            crate::config::LIST_FILE,
            config.base_dir.display(),
            config.extension
        ));
        logger.warn(&format!(
            "Or place .{} files in '{}'",
            config.extension,
            config.autopatch_dir.display()
        ));
        return Err(AttachError::NoFiles);
    }

    let patches = discover::load_all(&files, logger.as_ref())?;
    let coordinator = Coordinator::new(
        NativeLoader,
        patches,
        logger.clone(),
        Box::new(platform::unload_self),
    );

    // patch files are trusted input describing the host's own memory
    unsafe { coordinator.place() }?;

    *ATTACHED.lock().unwrap_or_else(PoisonError::into_inner) = Some(coordinator);
    Ok(())
}
