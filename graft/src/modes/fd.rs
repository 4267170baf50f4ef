//! File-descriptor profiling.
//!
//! Intercepts the descriptor-creating and -closing calls and tracks every
//! open descriptor as a live resource of size one, so descriptor leaks
//! point at the stack that opened them. Descriptors are process-global,
//! so this mode uses the shared master buffer.

use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_char, c_int};

use graft_profile::{CounterDef, CounterKind, MAX_DEPTH};

use crate::hooks::{self, hook_stub_dual};
use crate::walker::{cycles, stacktrace};
use crate::{config, profiler};

static USED: CounterDef = CounterDef::new("FD_USED", CounterKind::Tick);
static LIVE: CounterDef = CounterDef::new("FD_LIVE", CounterKind::Tick);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Record a newly created descriptor against the current stack.
#[inline(never)]
fn add(fd: c_int) {
    let Some(buf) = profiler::buffer() else { return };

    let mut addresses = [0usize; MAX_DEPTH];
    let tstart = cycles();
    let depth = stacktrace(&mut addresses);
    let tend = cycles();

    // Drop the top two frames: this helper and the hook stub.
    let skip = depth.min(2);
    let mut guard = buf.lock();
    let frame = guard.push(&addresses[skip..depth]);
    guard.tick(frame, &USED, 1, 1);
    if let Some(ctr) = guard.tick(frame, &LIVE, 1, 1) {
        guard.acquire(ctr, fd as u64, 1);
    }
    guard.trace_perf(depth, tstart, tend);
}

/// Forget a descriptor again.
fn remove(fd: c_int) {
    let Some(buf) = profiler::buffer() else { return };
    buf.lock().release(fd as u64);
}

/// Possibly start the file descriptor profiler.
pub(crate) fn initialize(options: &str) {
    if INITIALIZED.swap(true, Ordering::Relaxed) {
        return;
    }
    if config::find_token(options, "fd").is_none() {
        return;
    }

    if !profiler::init("file descriptor profiler", None, false, 0.0) {
        return;
    }

    profiler::disable(true);
    hooks::install_dual("open", "libc.so.6",
        open_stub as *const (), &OPEN_MAIN, open_stub_libc as *const (), &OPEN_LIBC);
    hooks::install_dual("__open64", "libc.so.6",
        open64_stub as *const (), &OPEN64_MAIN, open64_stub_libc as *const (), &OPEN64_LIBC);
    hooks::install_dual("close", "libc.so.6",
        close_stub as *const (), &CLOSE_MAIN, close_stub_libc as *const (), &CLOSE_LIBC);
    hooks::install_dual("dup", "libc.so.6",
        dup_stub as *const (), &DUP_MAIN, dup_stub_libc as *const (), &DUP_LIBC);
    hooks::install_dual("dup2", "libc.so.6",
        dup2_stub as *const (), &DUP2_MAIN, dup2_stub_libc as *const (), &DUP2_LIBC);
    hooks::install_dual("socket", "libc.so.6",
        socket_stub as *const (), &SOCKET_MAIN, socket_stub_libc as *const (), &SOCKET_LIBC);
    hooks::install_dual("accept", "libc.so.6",
        accept_stub as *const (), &ACCEPT_MAIN, accept_stub_libc as *const (), &ACCEPT_LIBC);
    log::debug!("file descriptor profiler enabled");
    profiler::enable(true);
}

// ------------------------------------------------------------------
// Descriptor traps. `open` is variadic in C; the three-argument form
// matches the call ABI for both spellings.

hook_stub_dual!(open_stub + open_stub_libc / OPEN_MAIN + OPEN_LIBC:
    fn(path: *const c_char, flags: c_int, mode: c_int) -> c_int => do_open);
hook_stub_dual!(open64_stub + open64_stub_libc / OPEN64_MAIN + OPEN64_LIBC:
    fn(path: *const c_char, flags: c_int, mode: c_int) -> c_int => do_open);
hook_stub_dual!(close_stub + close_stub_libc / CLOSE_MAIN + CLOSE_LIBC:
    fn(fd: c_int) -> c_int => do_close);
hook_stub_dual!(dup_stub + dup_stub_libc / DUP_MAIN + DUP_LIBC:
    fn(fd: c_int) -> c_int => do_dup);
hook_stub_dual!(dup2_stub + dup2_stub_libc / DUP2_MAIN + DUP2_LIBC:
    fn(fd: c_int, newfd: c_int) -> c_int => do_dup2);
hook_stub_dual!(socket_stub + socket_stub_libc / SOCKET_MAIN + SOCKET_LIBC:
    fn(domain: c_int, kind: c_int, protocol: c_int) -> c_int => do_socket);
hook_stub_dual!(accept_stub + accept_stub_libc / ACCEPT_MAIN + ACCEPT_LIBC:
    fn(fd: c_int, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) -> c_int => do_accept);

unsafe fn do_open(
    chain: unsafe extern "C" fn(*const c_char, c_int, c_int) -> c_int,
    path: *const c_char,
    flags: c_int,
    mode: c_int,
) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(path, flags, mode) };
    if enabled && result != -1 {
        add(result);
    }
    profiler::enable(false);
    result
}

unsafe fn do_close(chain: unsafe extern "C" fn(c_int) -> c_int, fd: c_int) -> c_int {
    profiler::disable(false);
    remove(fd);
    let result = unsafe { chain(fd) };
    profiler::enable(false);
    result
}

unsafe fn do_dup(chain: unsafe extern "C" fn(c_int) -> c_int, fd: c_int) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(fd) };
    if enabled && result != -1 {
        add(result);
    }
    profiler::enable(false);
    result
}

unsafe fn do_dup2(
    chain: unsafe extern "C" fn(c_int, c_int) -> c_int,
    fd: c_int,
    newfd: c_int,
) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(fd, newfd) };
    if result != -1 {
        // A descriptor previously open at newfd is implicitly closed.
        remove(result);
        if enabled {
            add(result);
        }
    }
    profiler::enable(false);
    result
}

unsafe fn do_socket(
    chain: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    domain: c_int,
    kind: c_int,
    protocol: c_int,
) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(domain, kind, protocol) };
    if enabled && result != -1 {
        add(result);
    }
    profiler::enable(false);
    result
}

unsafe fn do_accept(
    chain: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int,
    fd: c_int,
    addr: *mut libc::sockaddr,
    len: *mut libc::socklen_t,
) -> c_int {
    let enabled = profiler::disable(false);
    let result = unsafe { chain(fd, addr, len) };
    if enabled && result != -1 {
        add(result);
    }
    profiler::enable(false);
    result
}
