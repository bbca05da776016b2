//! # Logger
//!
//! Every component receives its logger at construction time instead of reaching for a global.
//! [`TracingLogger`] forwards to [`tracing`], which is what the injected library uses in a host.

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

/// Environment variable naming a file that receives log output instead of stderr
pub const LOG_FILE_VAR: &str = "MODPATCH_LOG";
/// Environment variable holding an [`EnvFilter`] directive, `info` when unset
pub const LOG_LEVEL_VAR: &str = "MODPATCH_LOG_LEVEL";

/// Line-oriented, severity-leveled diagnostics sink
pub trait Logger: Send + Sync {
    /// Progress and successful outcomes
    fn info(&self, message: &str);
    /// Recoverable oddities, e.g. a patch that was already applied
    fn warn(&self, message: &str);
    /// Hard failures. Always emitted before the failure is surfaced to the caller
    fn error(&self, message: &str);
}

/// Shared handle to a logger, cloned into every component that needs one
pub type SharedLogger = Arc<dyn Logger>;

/// Logger backed by the [`tracing`] macros
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl TracingLogger {
    /// Creates a shareable tracing logger
    pub fn shared() -> SharedLogger {
        Arc::new(Self)
    }
}

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "modpatch", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "modpatch", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "modpatch", "{message}");
    }
}

/// Installs a `fmt` subscriber for the injected library.
///
/// Output goes to the file named by [`LOG_FILE_VAR`] when it can be opened, stderr otherwise.
/// If the host already installed a global subscriber, that one is left in place.
pub fn init() {
    let filter =
        EnvFilter::try_from_env(LOG_LEVEL_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);

    let file = std::env::var_os(LOG_FILE_VAR).and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    // a failed `try_init` means somebody else owns the global subscriber, which is fine
    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Formats bytes as space separated uppercase hex pairs, e.g. `DE AD BE EF`
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
