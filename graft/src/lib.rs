//! graft — an in-process sampling and instrumenting profiler.
//!
//! Inject the cdylib into an unmodified program with `LD_PRELOAD` and
//! select a profiling mode through the `IGPROF` environment variable
//! (`perf`, `mem`, `fd`, plus `igprof:out='...'` and `igprof:dump='...'`
//! engine options). The selected mode intercepts library entry points or
//! arms a timer signal, records per-thread call stacks tagged with
//! counter deltas and live resources, and serialises an interned
//! call-tree text stream at process exit or on demand.
//!
//! Embedding works too: link the rlib, implement a mode against
//! [`init`]/[`buffer`]/[`hook`], and drive dumps with [`dump_now`].
//!
//! Environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `IGPROF` | Mode tokens and engine options. |
//! | `IGPROF_TARGET` | Only profile processes whose image name contains this string. |
//! | `IGPROF_DEBUGGING` | Write internal diagnostics to stderr. |
//! | `IGPROF_MALLOC_LIB` | Library hint for resolving the allocator symbols. |

pub mod config;
mod dumper;
mod hooks;
mod logging;
mod modes;
mod profiler;
pub mod symbols;
pub mod walker;

pub use graft_hook::{hook, hook_at, hook_into, hook_with_options, Hook, HookError};
pub use graft_profile::{
    BufferGuard, CounterDef, CounterKind, CounterRef, FrameRef, ProfileBuffer, TraceBuf,
    TraceStats, MAX_COUNTERS, MAX_DEPTH,
};

/// Attach the profiler to this process: pick the mode `$IGPROF` asks for
/// and initialise it. Called automatically when the cdylib is preloaded;
/// embedders call it (or [`init`] directly) themselves.
pub fn attach() {
    logging::init();
    modes::attach();
}

/// Initialise the profiler core for a mode. `thread_init` runs in every
/// newly created thread; `per_thread` chooses between per-thread buffers
/// and the shared master buffer; `clock_res` is recorded in the dump
/// header. Returns whether profiling is active in this process — the
/// target filter or a previously initialised mode can refuse.
pub fn init(mode: &str, thread_init: Option<fn()>, per_thread: bool, clock_res: f64) -> bool {
    logging::init();
    profiler::init(mode, thread_init, per_thread, clock_res)
}

/// The raw profiling options from `$IGPROF`, if any.
pub fn options() -> Option<&'static str> {
    config::env_options()
}

/// Raise the enable count, thread-local or process-wide.
pub fn enable(global: bool) {
    profiler::enable(global);
}

/// Lower the enable count and report whether profiling was on before the
/// call. Hooks bracket their recording with
/// `let was = disable(false); if was { ... } enable(false);` to keep
/// their own work out of the profile. Safe in signal handlers.
pub fn disable(global: bool) -> bool {
    profiler::disable(global)
}

/// The current thread's profile buffer, or `None` when profiling is
/// inactive.
pub fn buffer() -> Option<&'static ProfileBuffer> {
    profiler::buffer()
}

/// Dump all profile data now, to `path` or the configured output.
/// Callable from the program under profile; the work runs on a separate
/// unprofiled thread.
pub fn dump_now(path: Option<&str>) {
    dumper::dump_now(path);
}

/// Clear all profile buffers; used after `fork` in the child unless the
/// configuration keeps inherited profiles.
pub fn reset_profiles() {
    profiler::reset_profiles();
}

// Run as early as possible when injected via LD_PRELOAD, by registering
// as an ELF constructor. Modes attach explicitly from here; nothing else
// happens at load time.
#[cfg(all(unix, not(test)))]
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static PRELOAD_ATTACH: extern "C" fn() = {
    extern "C" fn preload_attach() {
        attach();
    }
    preload_attach
};
