//! Symbol resolution for hook targets.

use std::ffi::CString;
use std::ptr;

use libc::{c_char, c_void};

use crate::HookError;

extern "C" {
    // GNU extension, not exposed by the libc crate.
    fn dlvsym(handle: *mut c_void, symbol: *const c_char, version: *const c_char) -> *mut c_void;
}

fn dlerror_text() -> String {
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

unsafe fn sym_in(handle: *mut c_void, name: &CString, version: Option<&CString>) -> *mut c_void {
    match version {
        Some(v) => unsafe { dlvsym(handle, name.as_ptr(), v.as_ptr()) },
        None => unsafe { libc::dlsym(handle, name.as_ptr()) },
    }
}

/// Resolve `(function, version?, library?)` to an address. With a library,
/// that library is loaded and searched; otherwise the main program is
/// searched first and the next object in load order after us second.
pub(crate) fn lookup(
    function: &str,
    version: Option<&str>,
    library: Option<&str>,
) -> Result<usize, HookError> {
    let c_fn = CString::new(function).map_err(|_| HookError::SymbolNotFound(function.into()))?;
    let c_version = match version {
        Some(v) => Some(CString::new(v).map_err(|_| HookError::SymbolNotFound(function.into()))?),
        None => None,
    };

    let sym = if let Some(lib) = library {
        let c_lib =
            CString::new(lib).map_err(|_| HookError::LibraryNotFound(lib.into()))?;
        let handle =
            unsafe { libc::dlopen(c_lib.as_ptr(), libc::RTLD_LAZY | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            log::debug!("dlopen('{}'): {}", lib, dlerror_text());
            return Err(HookError::LibraryNotFound(lib.into()));
        }
        let sym = unsafe { sym_in(handle, &c_fn, c_version.as_ref()) };
        if sym.is_null() {
            log::debug!("dlsym('{}', '{}'): {}", lib, function, dlerror_text());
            return Err(HookError::SymbolNotFoundInLibrary(
                function.into(),
                lib.into(),
            ));
        }
        sym
    } else {
        let program = unsafe { libc::dlopen(ptr::null(), libc::RTLD_LAZY | libc::RTLD_GLOBAL) };
        let mut sym = unsafe { sym_in(program, &c_fn, c_version.as_ref()) };
        unsafe { libc::dlclose(program) };
        if sym.is_null() {
            sym = unsafe { sym_in(libc::RTLD_NEXT, &c_fn, c_version.as_ref()) };
        }
        if sym.is_null() {
            log::debug!("dlsym(self, '{}'): {}", function, dlerror_text());
            return Err(HookError::SymbolNotFound(function.into()));
        }
        sym
    };

    Ok(sym as usize)
}
