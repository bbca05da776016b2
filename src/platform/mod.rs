//! # Platform
//!
//! Image lookup and load notifications for the running process.
//! The [`Loader`] trait is the seam between the coordinator and the operating system, so the coordinator can be driven by a fake in tests.

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

/// An image that was just mapped into the process
#[derive(Debug, Clone, Copy)]
pub struct LoadEvent<'a> {
    /// File name of the image, without directories
    pub name: &'a str,
    /// Address the image is mapped at
    pub base: *mut u8,
}

/// The module this library was loaded as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Path the module was loaded from
    pub path: PathBuf,
    /// Address the module is mapped at
    pub base: usize,
}

/// Callback invoked for every load event, on whatever thread the loader runs on
pub type LoadHandler = Arc<dyn Fn(&LoadEvent<'_>) + Send + Sync>;

/// Errors while setting up load notifications
#[derive(Debug, Error)]
pub enum ObserverError {
    /// A loader export could not be found
    #[error("failed to resolve {symbol} from {module}")]
    Resolve {
        /// Module the symbol was looked up in
        module: &'static str,
        /// Symbol that was missing
        symbol: &'static str,
    },
    /// The loader refused the registration
    #[error("failed to register load notification callback (0x{0:X})")]
    Register(i32),
}

/// Image lookup and load notifications
pub trait Loader: Send + Sync {
    /// Keeps the handler registered until dropped
    type Subscription: Send + 'static;

    /// Base of the primary executable image
    fn host_image(&self) -> Option<NonNull<u8>>;

    /// Base of an already mapped image, looked up by file name
    fn find_image(&self, name: &str) -> Option<NonNull<u8>>;

    /// Registers `handler` for every image mapped from now on
    fn subscribe(&self, handler: LoadHandler) -> Result<Self::Subscription, ObserverError>;
}

impl<L: Loader + ?Sized> Loader for Arc<L> {
    type Subscription = L::Subscription;

    fn host_image(&self) -> Option<NonNull<u8>> {
        (**self).host_image()
    }

    fn find_image(&self, name: &str) -> Option<NonNull<u8>> {
        (**self).find_image(name)
    }

    fn subscribe(&self, handler: LoadHandler) -> Result<Self::Subscription, ObserverError> {
        (**self).subscribe(handler)
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::{current_module, unload_self, NativeLoader};
#[cfg(windows)]
pub use self::windows::{current_module, unload_self, NativeLoader};
