//! # modpatch
//!
//! In-process byte patcher. Patch files describe byte edits against images of the running process,
//! and each edit is applied once its image is mapped.
//!
//! A patch file has one edit per line:
//!
//! ```text
//! # target        offset   replacement  [expected]
//! "kernel32.dll"  f+1A0    9090         7405
//! <host>          4A10     EB
//! -               7FF61000 DEADBEEF
//! ```
//!
//! The target is an image file name, `<host>` for the main executable, or `-` for an absolute address.
//! Offsets are hex, relative to the mapped image or, with an `f+` prefix, to the image file on disk.
//! A replacement of `-` only validates the expected bytes.
//!
//! ```no_run
//! use modpatch::coordinator::Coordinator;
//! use modpatch::logger::TracingLogger;
//! use modpatch::parser::parse_file;
//! use modpatch::platform::{self, NativeLoader};
//!
//! let patches = parse_file("autopatch/game.mph").unwrap();
//! let coordinator = Coordinator::new(
//!     NativeLoader,
//!     patches,
//!     TracingLogger::shared(),
//!     Box::new(platform::unload_self),
//! );
//! unsafe { coordinator.place() }.unwrap();
//! ```
//!
//! With the `autoload` feature the same happens automatically when the library is loaded,
//! using the files found through [`config::Config::from_env`].
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("modpatch supports Linux and Windows only");

pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod discover;
#[cfg(feature = "autoload")]
mod entry;
pub mod image;
pub mod logger;
pub mod parser;
pub mod patcher;
pub mod platform;
#[cfg(test)]
mod testing;
