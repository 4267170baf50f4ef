//! The symboliser.
//!
//! Maps an instruction address to symbol name, module path and the two
//! offsets the dump format carries. This runs only on the dump path, where
//! allocation is fine, so `dladdr` is all it takes; addresses the dynamic
//! symbol table does not cover keep their module attribution and are
//! named by the dumper from the raw address.

use std::ffi::CStr;
use std::mem;

use graft_profile::dump::SymbolInfo;

pub fn resolve(address: u64) -> SymbolInfo {
    let mut info: libc::Dl_info = unsafe { mem::zeroed() };
    let found = unsafe { libc::dladdr(address as usize as *const libc::c_void, &mut info) };
    if found == 0 {
        return SymbolInfo::default();
    }

    let symbol = if info.dli_sname.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy().into_owned())
    };
    let library = if info.dli_fname.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned())
    };
    let sym_offset = if info.dli_saddr.is_null() {
        0
    } else {
        address as i64 - info.dli_saddr as i64
    };
    let lib_offset = if info.dli_fbase.is_null() {
        0
    } else {
        address as i64 - info.dli_fbase as i64
    };

    SymbolInfo {
        symbol,
        library,
        sym_offset,
        lib_offset,
    }
}
