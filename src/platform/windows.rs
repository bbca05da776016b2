//! Windows image lookup and `LdrRegisterDllNotification` load notifications

use std::ffi::{c_void, CString, OsString};
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::{mem, slice};

use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{
    FreeLibraryAndExitThread, GetModuleFileNameW, GetModuleHandleA, GetModuleHandleExW,
    GetModuleHandleW, GetProcAddress, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
};

use super::{LoadEvent, LoadHandler, Loader, ModuleInfo, ObserverError};

/// `LDR_DLL_NOTIFICATION_REASON_LOADED`
const REASON_LOADED: u32 = 1;

/// Counted UTF-16 string, as used by the native loader
#[repr(C)]
#[allow(dead_code)]
struct UnicodeString {
    /// Length in bytes, without a terminator
    length: u16,
    /// Capacity in bytes
    maximum_length: u16,
    /// Character data
    buffer: *const u16,
}

/// `LDR_DLL_LOADED_NOTIFICATION_DATA`. The unloaded variant has the same layout
#[repr(C)]
#[allow(dead_code)]
struct NotificationData {
    /// Reserved
    flags: u32,
    /// Full path of the image
    full_dll_name: *const UnicodeString,
    /// File name of the image
    base_dll_name: *const UnicodeString,
    /// Address the image is mapped at
    dll_base: *mut c_void,
    /// Size of the mapped image
    size_of_image: u32,
}

/// `LDR_DLL_NOTIFICATION_FUNCTION`
type NotificationFn = unsafe extern "system" fn(u32, *const NotificationData, *mut c_void);
/// `LdrRegisterDllNotification`
type RegisterFn =
    unsafe extern "system" fn(u32, NotificationFn, *mut c_void, *mut *mut c_void) -> i32;
/// `LdrUnregisterDllNotification`
type UnregisterFn = unsafe extern "system" fn(*mut c_void) -> i32;

/// Module exporting the notification functions
const NTDLL: &str = "ntdll.dll";

/// Looks up an export of an already loaded module
///
/// # Safety
///
/// `F` must be the function pointer type of the export
unsafe fn resolve<F>(module: &'static str, symbol: &'static str) -> Result<F, ObserverError> {
    let missing = || ObserverError::Resolve { module, symbol };
    let module_name = CString::new(module).map_err(|_| missing())?;
    let symbol_name = CString::new(symbol).map_err(|_| missing())?;

    let handle = GetModuleHandleA(module_name.as_ptr() as *const u8);
    if handle.is_null() {
        return Err(missing());
    }
    let proc = GetProcAddress(handle, symbol_name.as_ptr() as *const u8).ok_or_else(missing)?;
    Ok(mem::transmute_copy(&proc))
}

/// Forwards loader notifications to the [`LoadHandler`] behind `context`
unsafe extern "system" fn notification_callback(
    reason: u32,
    data: *const NotificationData,
    context: *mut c_void,
) {
    if reason != REASON_LOADED || data.is_null() || context.is_null() {
        return;
    }
    let data = &*data;
    if data.base_dll_name.is_null() {
        return;
    }

    let name = &*data.base_dll_name;
    let name = if name.buffer.is_null() {
        String::new()
    } else {
        String::from_utf16_lossy(slice::from_raw_parts(
            name.buffer,
            name.length as usize / mem::size_of::<u16>(),
        ))
    };

    let handler = &*(context as *const LoadHandler);
    handler(&LoadEvent {
        name: &name,
        base: data.dll_base as *mut u8,
    });
}

/// Registered loader notification. Dropping it unregisters the callback
pub struct Notification {
    /// Cookie returned by the loader
    cookie: *mut c_void,
    /// Boxed handler passed as the callback context
    context: *mut LoadHandler,
    /// Resolved `LdrUnregisterDllNotification`
    unregister: UnregisterFn,
}

// the context is only read through a `Send + Sync` handler and the cookie is an opaque token
unsafe impl Send for Notification {}

impl Drop for Notification {
    fn drop(&mut self) {
        let status = unsafe { (self.unregister)(self.cookie) };
        if status < 0 {
            // the loader may still call into the context, so it has to leak
            tracing::error!(
                target: "modpatch",
                "Failed to unregister DLL notification (0x{:X})",
                status
            );
            return;
        }
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// [`Loader`] backed by the Windows native loader
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl Loader for NativeLoader {
    type Subscription = Notification;

    fn host_image(&self) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { GetModuleHandleW(ptr::null()) } as *mut u8)
    }

    fn find_image(&self, name: &str) -> Option<NonNull<u8>> {
        let name = CString::new(name).ok()?;
        NonNull::new(unsafe { GetModuleHandleA(name.as_ptr() as *const u8) } as *mut u8)
    }

    fn subscribe(&self, handler: LoadHandler) -> Result<Self::Subscription, ObserverError> {
        let (register, unregister) = unsafe {
            (
                resolve::<RegisterFn>(NTDLL, "LdrRegisterDllNotification")?,
                resolve::<UnregisterFn>(NTDLL, "LdrUnregisterDllNotification")?,
            )
        };

        let context = Box::into_raw(Box::new(handler));
        let mut cookie = ptr::null_mut();
        let status =
            unsafe { register(0, notification_callback, context as *mut c_void, &mut cookie) };
        if status < 0 {
            drop(unsafe { Box::from_raw(context) });
            return Err(ObserverError::Register(status));
        }

        Ok(Notification {
            cookie,
            context,
            unregister,
        })
    }
}

/// Handle of the module containing this code, without taking a reference
fn own_handle() -> Option<HMODULE> {
    let mut module: HMODULE = ptr::null_mut();
    let anchor = own_handle as fn() -> Option<HMODULE> as usize as *const u16;
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            anchor,
            &mut module,
        )
    };
    (ok != 0 && !module.is_null()).then_some(module)
}

/// Path and base of the module containing this code
pub fn current_module() -> Option<ModuleInfo> {
    let module = own_handle()?;
    let mut buffer = vec![0u16; 1024];
    let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as u32) };
    if len == 0 {
        return None;
    }

    Some(ModuleInfo {
        path: PathBuf::from(OsString::from_wide(&buffer[..len as usize])),
        base: module as usize,
    })
}

/// Unmaps this library and ends the calling thread.
///
/// Must run on a thread this library owns, never on a loader callback.
pub fn unload_self() {
    match own_handle() {
        Some(module) => unsafe { FreeLibraryAndExitThread(module, 0) },
        None => tracing::error!(
            target: "modpatch",
            "Failed to resolve own module handle, staying resident"
        ),
    }
}
