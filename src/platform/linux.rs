//! Linux image lookup through `dl_iterate_phdr`
//!
//! The dynamic loader has no public load notification, so new images are found by diffing the loaded set.
//! With the `autoload` feature the library interposes `dlopen` and diffs after every successful call,
//! which requires it to be preloaded ahead of the caller's own `dlopen` binding.

use std::collections::HashSet;
use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use super::{LoadEvent, LoadHandler, Loader, ModuleInfo, ObserverError};

/// An image currently mapped in the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// File name without directories. The main executable is named after the current executable
    pub name: String,
    /// Address the first loadable segment is mapped at
    pub base: usize,
}

/// Enumerates every mapped image, the main executable first
pub fn loaded_images() -> Vec<Image> {
    let mut images: Vec<Image> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut images as *mut Vec<Image> as *mut c_void);
    }

    // the main executable is reported with an empty path
    if let Some(host) = images.first_mut() {
        if host.name.is_empty() {
            host.name = host_name().unwrap_or_default();
        }
    }
    images
}

/// `dl_iterate_phdr` callback pushing each image into the `Vec<Image>` behind `data`
unsafe extern "C" fn collect(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let images = &mut *(data as *mut Vec<Image>);
    let info = &*info;

    if info.dlpi_phdr.is_null() {
        return 0;
    }
    let phdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let first_load = match phdrs.iter().find(|phdr| phdr.p_type == libc::PT_LOAD) {
        Some(phdr) => phdr,
        None => return 0,
    };

    let path = if info.dlpi_name.is_null() {
        ""
    } else {
        CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
    };

    images.push(Image {
        name: file_name(path),
        base: (info.dlpi_addr as usize).wrapping_add(first_load.p_vaddr as usize),
    });
    0
}

/// Last path component, or the whole string if it has none
fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// File name of the running executable
fn host_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_name()?.to_string_lossy().into_owned())
}

/// Load listeners and the image set they have already seen
#[derive(Default)]
struct Registry {
    /// Id handed to the next listener
    next_id: u64,
    /// Registered handlers, keyed by listener id
    listeners: Vec<(u64, LoadHandler)>,
    /// Bases of every image seen by the last diff
    known: HashSet<usize>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Locks the registry. Handlers never run under this lock, so a poisoned lock still holds consistent data
fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Diffs the loaded images against the last known set and reports new ones to every listener
pub fn notify_new_images() {
    let images = loaded_images();

    let (fresh, listeners) = {
        let mut registry = registry();
        if registry.listeners.is_empty() {
            return;
        }
        let fresh = images
            .iter()
            .filter(|image| !registry.known.contains(&image.base))
            .cloned()
            .collect::<Vec<_>>();
        registry.known = images.iter().map(|image| image.base).collect();
        let listeners = registry
            .listeners
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect::<Vec<_>>();
        (fresh, listeners)
    };

    for image in &fresh {
        let event = LoadEvent {
            name: &image.name,
            base: image.base as *mut u8,
        };
        for handler in &listeners {
            handler(&event);
        }
    }
}

/// Keeps a handler registered. Dropping it removes the handler
#[derive(Debug)]
pub struct ListenerGuard {
    /// Id of the registered handler
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        registry().listeners.retain(|(id, _)| *id != self.id);
    }
}

/// [`Loader`] backed by the dynamic loader of the running process
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl Loader for NativeLoader {
    type Subscription = ListenerGuard;

    fn host_image(&self) -> Option<NonNull<u8>> {
        loaded_images()
            .first()
            .and_then(|image| NonNull::new(image.base as *mut u8))
    }

    fn find_image(&self, name: &str) -> Option<NonNull<u8>> {
        loaded_images()
            .into_iter()
            .find(|image| image.name == name)
            .and_then(|image| NonNull::new(image.base as *mut u8))
    }

    fn subscribe(&self, handler: LoadHandler) -> Result<Self::Subscription, ObserverError> {
        let images = loaded_images();
        let mut registry = registry();

        // images mapped before the first listener are not news to anyone
        if registry.listeners.is_empty() {
            registry.known = images.iter().map(|image| image.base).collect();
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, handler));
        Ok(ListenerGuard { id })
    }
}

/// Path and base of the object containing this code
pub fn current_module() -> Option<ModuleInfo> {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    let anchor = current_module as fn() -> Option<ModuleInfo> as *const c_void;
    if unsafe { libc::dladdr(anchor, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }

    let path = unsafe { CStr::from_ptr(info.dli_fname) }.to_str().ok()?;
    Some(ModuleInfo {
        path: PathBuf::from(path),
        base: info.dli_fbase as usize,
    })
}

/// Images cannot unmap themselves safely on Linux, so the library stays resident and idle
pub fn unload_self() {
    tracing::debug!(target: "modpatch", "unload requested, staying resident");
}

#[cfg(feature = "autoload")]
mod interpose {
    //! `dlopen` interposer feeding [`super::notify_new_images`]

    use std::os::raw::{c_char, c_int, c_void};
    use std::ptr;

    use lazy_static::lazy_static;

    /// Signature of `dlopen`
    type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

    lazy_static! {
        /// The next `dlopen` in lookup order, normally the one from libc
        static ref REAL_DLOPEN: Option<DlopenFn> = unsafe {
            let ptr = libc::dlsym(libc::RTLD_NEXT, b"dlopen\0".as_ptr() as *const _);
            if ptr.is_null() {
                None
            } else {
                Some(std::mem::transmute::<*mut c_void, DlopenFn>(ptr))
            }
        };
    }

    /// Forwards to the real `dlopen` and reports any image it mapped
    ///
    /// # Safety
    ///
    /// Same contract as `dlopen(3)`
    #[no_mangle]
    pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
        let real = match *REAL_DLOPEN {
            Some(real) => real,
            None => return ptr::null_mut(),
        };

        let handle = real(filename, flags);
        if !handle.is_null() {
            super::notify_new_images();
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::image;

    #[test]
    /// The main executable comes first and is named after the test binary
    fn test_loaded_images() {
        let images = loaded_images();
        assert!(!images.is_empty());
        assert_eq!(Some(images[0].name.clone()), host_name());
        assert!(images.iter().all(|image| image.base != 0));

        let loader = NativeLoader;
        assert_eq!(
            loader.host_image().map(|base| base.as_ptr() as usize),
            Some(images[0].base)
        );
        for image in images.iter().skip(1).filter(|image| !image.name.is_empty()) {
            assert!(loader.find_image(&image.name).is_some());
        }
        assert!(loader.find_image("definitely-not-loaded.so").is_none());
    }

    #[test]
    /// This code lives in a mapped object with a known base
    fn test_current_module() {
        let module = current_module().unwrap();
        assert_ne!(module.base, 0);
        assert!(loaded_images().iter().any(|image| image.base == module.base));
    }

    #[test]
    /// The reported base is the mapped ELF header, so file offset 0 maps onto it
    fn test_host_header() {
        let base = NativeLoader.host_image().unwrap().as_ptr();
        assert_eq!(unsafe { image::file_offset_to_ptr(base, 0) }, Ok(base));
    }

    #[test]
    /// Listeners only hear about images they have not seen, and stop hearing once dropped
    fn test_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: LoadHandler = {
            let seen = seen.clone();
            let calls = calls.clone();
            Arc::new(move |event: &LoadEvent<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(event.name.to_owned());
            })
        };

        let guard = NativeLoader.subscribe(handler).unwrap();
        notify_new_images();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // pretend the main executable was just mapped
        let host = loaded_images().remove(0);
        registry().known.remove(&host.base);
        notify_new_images();
        assert_eq!(*seen.lock().unwrap(), [host.name.clone()]);

        drop(guard);
        registry().known.remove(&host.base);
        notify_new_images();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
