//! Allocation profiling.
//!
//! Intercepts the allocator entry points and records three counters on
//! the allocating stack: total bytes ever requested, the largest single
//! request, and currently live bytes with each allocation tracked as a
//! live resource keyed by its address, so leaks stay attributed. All
//! threads share the master buffer; allocations routinely cross threads,
//! and a freeing thread must find the record the allocating thread made.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::{c_int, c_void, size_t};

use graft_profile::{CounterDef, CounterKind, MAX_DEPTH};

use crate::hooks::{self, hook_stub_dual};
use crate::walker::{cycles, stacktrace};
use crate::{config, profiler};

static TOTAL: CounterDef = CounterDef::new("MEM_TOTAL", CounterKind::Tick);
static LARGEST: CounterDef = CounterDef::new("MEM_MAX", CounterKind::Max);
static LIVE: CounterDef = CounterDef::new("MEM_LIVE", CounterKind::Tick);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Report requested bytes as-is.
const OVERHEAD_NONE: i32 = 0;
/// Report what the allocator actually reserved.
const OVERHEAD_WITH: i32 = 1;
/// Report only the allocator's bookkeeping overhead.
const OVERHEAD_DELTA: i32 = 2;
static OVERHEAD: AtomicI32 = AtomicI32::new(OVERHEAD_NONE);

/// Record an allocation of `size` bytes at `ptr` against the current
/// stack.
#[inline(never)]
fn add(ptr: u64, size: u64) {
    let Some(buf) = profiler::buffer() else { return };

    let mut size = size;
    let overhead = OVERHEAD.load(Ordering::Relaxed);
    if overhead != OVERHEAD_NONE {
        let actual = unsafe { libc::malloc_usable_size(ptr as *mut c_void) } as u64;
        if overhead == OVERHEAD_DELTA {
            size = actual.saturating_sub(size);
            if size == 0 {
                return;
            }
        } else {
            size = actual;
        }
    }

    let mut addresses = [0usize; MAX_DEPTH];
    let tstart = cycles();
    let depth = stacktrace(&mut addresses);
    let tend = cycles();

    // Drop the top two frames: this helper and the hook stub.
    let skip = depth.min(2);
    let mut guard = buf.lock();
    let frame = guard.push(&addresses[skip..depth]);
    guard.tick(frame, &TOTAL, size, 1);
    guard.tick(frame, &LARGEST, size, 1);
    if let Some(ctr) = guard.tick(frame, &LIVE, size, 1) {
        guard.acquire(ctr, ptr, size);
    }
    guard.trace_perf(depth, tstart, tend);
}

/// Forget an allocation again. Unknown pointers fall out silently: the
/// profiler was off when they were made.
fn remove(ptr: u64) {
    if ptr == 0 {
        return;
    }
    let Some(buf) = profiler::buffer() else { return };
    buf.lock().release(ptr);
}

/// Possibly start the memory profiler.
pub(crate) fn initialize(options: &str) {
    if INITIALIZED.swap(true, Ordering::Relaxed) {
        return;
    }
    let Some(suboptions) = config::find_token(options, "mem") else { return };
    for sub in suboptions.split(':').filter(|s| !s.is_empty()) {
        match sub.strip_prefix("overhead=") {
            Some("none") => OVERHEAD.store(OVERHEAD_NONE, Ordering::Relaxed),
            Some("include") => OVERHEAD.store(OVERHEAD_WITH, Ordering::Relaxed),
            Some("delta") => OVERHEAD.store(OVERHEAD_DELTA, Ordering::Relaxed),
            _ => log::debug!("mem: ignoring unknown option '{}'", sub),
        }
    }

    if !profiler::init("memory profiler", None, false, 0.0) {
        return;
    }

    profiler::disable(true);
    log::debug!(
        "memory profiler: reporting {}",
        match OVERHEAD.load(Ordering::Relaxed) {
            OVERHEAD_WITH => "memory use with allocation overhead",
            OVERHEAD_DELTA => "allocation overhead only",
            _ => "memory use without allocation overhead",
        }
    );

    // When the default binding is ambiguous the environment names the
    // allocator library; otherwise hook the libc copy alongside.
    let lib = std::env::var("IGPROF_MALLOC_LIB").unwrap_or_else(|_| "libc.so.6".to_string());
    hooks::install_dual("malloc", &lib,
        malloc_stub as *const (), &MALLOC_MAIN, malloc_stub_libc as *const (), &MALLOC_LIBC);
    hooks::install_dual("calloc", &lib,
        calloc_stub as *const (), &CALLOC_MAIN, calloc_stub_libc as *const (), &CALLOC_LIBC);
    hooks::install_dual("realloc", &lib,
        realloc_stub as *const (), &REALLOC_MAIN, realloc_stub_libc as *const (), &REALLOC_LIBC);
    hooks::install_dual("posix_memalign", &lib,
        pmemalign_stub as *const (), &PMEMALIGN_MAIN, pmemalign_stub_libc as *const (), &PMEMALIGN_LIBC);
    hooks::install_dual("memalign", &lib,
        memalign_stub as *const (), &MEMALIGN_MAIN, memalign_stub_libc as *const (), &MEMALIGN_LIBC);
    hooks::install_dual("valloc", &lib,
        valloc_stub as *const (), &VALLOC_MAIN, valloc_stub_libc as *const (), &VALLOC_LIBC);
    hooks::install_dual("pvalloc", &lib,
        pvalloc_stub as *const (), &PVALLOC_MAIN, pvalloc_stub_libc as *const (), &PVALLOC_LIBC);
    hooks::install_dual("free", &lib,
        free_stub as *const (), &FREE_MAIN, free_stub_libc as *const (), &FREE_LIBC);

    log::debug!("memory profiler enabled");
    profiler::enable(true);
}

// ------------------------------------------------------------------
// Allocator traps.

hook_stub_dual!(malloc_stub + malloc_stub_libc / MALLOC_MAIN + MALLOC_LIBC:
    fn(size: size_t) -> *mut c_void => do_malloc);
hook_stub_dual!(calloc_stub + calloc_stub_libc / CALLOC_MAIN + CALLOC_LIBC:
    fn(nmemb: size_t, size: size_t) -> *mut c_void => do_calloc);
hook_stub_dual!(realloc_stub + realloc_stub_libc / REALLOC_MAIN + REALLOC_LIBC:
    fn(ptr: *mut c_void, size: size_t) -> *mut c_void => do_realloc);
hook_stub_dual!(pmemalign_stub + pmemalign_stub_libc / PMEMALIGN_MAIN + PMEMALIGN_LIBC:
    fn(memptr: *mut *mut c_void, alignment: size_t, size: size_t) -> c_int => do_posix_memalign);
hook_stub_dual!(memalign_stub + memalign_stub_libc / MEMALIGN_MAIN + MEMALIGN_LIBC:
    fn(alignment: size_t, size: size_t) -> *mut c_void => do_memalign);
hook_stub_dual!(valloc_stub + valloc_stub_libc / VALLOC_MAIN + VALLOC_LIBC:
    fn(size: size_t) -> *mut c_void => do_valloc);
hook_stub_dual!(pvalloc_stub + pvalloc_stub_libc / PVALLOC_MAIN + PVALLOC_LIBC:
    fn(size: size_t) -> *mut c_void => do_pvalloc);
hook_stub_dual!(free_stub + free_stub_libc / FREE_MAIN + FREE_LIBC:
    fn(ptr: *mut c_void) -> () => do_free);

unsafe fn do_malloc(
    chain: unsafe extern "C" fn(size_t) -> *mut c_void,
    size: size_t,
) -> *mut c_void {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(size) };
    if enabled && !result.is_null() {
        add(result as u64, size as u64);
    }
    profiler::enable(false);
    result
}

unsafe fn do_calloc(
    chain: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
    nmemb: size_t,
    size: size_t,
) -> *mut c_void {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(nmemb, size) };
    if enabled && !result.is_null() {
        add(result as u64, (nmemb as u64).saturating_mul(size as u64));
    }
    profiler::enable(false);
    result
}

unsafe fn do_realloc(
    chain: unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void,
    ptr: *mut c_void,
    size: size_t,
) -> *mut c_void {
    let enabled = profiler::disable(false);

    // Drop the old record before the call: another thread may reuse the
    // address immediately and must not look like a double acquisition.
    if enabled && !ptr.is_null() {
        remove(ptr as u64);
    }

    let result = unsafe { chain(ptr, size) };

    if enabled {
        if !result.is_null() {
            add(result as u64, size as u64);
        } else if !ptr.is_null() {
            // The original size is gone at this point. Failed reallocs are
            // rare; re-record the block under the requested size and live
            // with the inconsistency.
            add(ptr as u64, size as u64);
        }
    }
    profiler::enable(false);
    result
}

unsafe fn do_posix_memalign(
    chain: unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int,
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(memptr, alignment, size) };
    if enabled && !memptr.is_null() && !unsafe { *memptr }.is_null() {
        add(unsafe { *memptr } as u64, size as u64);
    }
    profiler::enable(false);
    result
}

unsafe fn do_memalign(
    chain: unsafe extern "C" fn(size_t, size_t) -> *mut c_void,
    alignment: size_t,
    size: size_t,
) -> *mut c_void {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(alignment, size) };
    if enabled && !result.is_null() {
        add(result as u64, size as u64);
    }
    profiler::enable(false);
    result
}

unsafe fn do_valloc(
    chain: unsafe extern "C" fn(size_t) -> *mut c_void,
    size: size_t,
) -> *mut c_void {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(size) };
    if enabled && !result.is_null() {
        add(result as u64, size as u64);
    }
    profiler::enable(false);
    result
}

unsafe fn do_pvalloc(
    chain: unsafe extern "C" fn(size_t) -> *mut c_void,
    size: size_t,
) -> *mut c_void {
    // pvalloc rounds to whole pages; account for what it really hands out.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as size_t;
    let size = if size == 0 { page } else { (size + page - 1) & !(page - 1) };

    let enabled = profiler::disable(false);
    let result = unsafe { chain(size) };
    if enabled && !result.is_null() {
        add(result as u64, size as u64);
    }
    profiler::enable(false);
    result
}

unsafe fn do_free(chain: unsafe extern "C" fn(*mut c_void), ptr: *mut c_void) {
    profiler::disable(false);
    remove(ptr as u64);
    unsafe { chain(ptr) };
    profiler::enable(false);
}
