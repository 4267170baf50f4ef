//! The lifecycle controller.
//!
//! Owns the process-wide activation state, the per-thread enable counters
//! and trace buffers, the registry of live buffers, and the traps on
//! process structure: thread creation, `exit`/`_exit`, and `kill`. Modes
//! call [`init`] once, then route every recorded event through
//! [`buffer`] guarded by [`disable`]/[`enable`] pairs.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_void};
use parking_lot::Mutex;

use graft_profile::ProfileBuffer;

use crate::hooks::{self, hook_stub, hook_stub_dual};
use crate::{config, dumper};

extern "C" {
    fn atexit(callback: extern "C" fn()) -> c_int;
}

pub(crate) struct Controller {
    mode: String,
    pub(crate) per_thread: bool,
    pub(crate) thread_init: Option<fn()>,
    pub(crate) clock_res: f64,
    pub(crate) master: Arc<ProfileBuffer>,
    pub(crate) buffers: Mutex<Vec<Arc<ProfileBuffer>>>,
    pub(crate) out_path: Option<String>,
    pub(crate) dump_flag: Option<String>,
    pub(crate) reset_on_fork: bool,
}

static CONTROLLER: OnceLock<Controller> = OnceLock::new();
static ACTIVATED: AtomicBool = AtomicBool::new(false);
static ENABLED: AtomicI32 = AtomicI32::new(0);
/// Set at teardown; the dump thread bounds its exit delay with it.
pub(crate) static QUITTING: AtomicI32 = AtomicI32::new(0);
/// Once the final dump ran, any further init attempt must stay dead.
static POISONED: AtomicBool = AtomicBool::new(false);
/// Raised while the engine spawns its own service threads so the
/// thread-creation trap leaves them unprofiled.
pub(crate) static INTERNAL_SPAWN: AtomicBool = AtomicBool::new(false);
/// The thread that initialised the profiler.
static MAIN_THREAD: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Const-initialised and free of destructors so that reads compile to
    // plain TLS accesses, safe inside signal handlers.
    static THREAD_BUF: Cell<*const ProfileBuffer> = const { Cell::new(ptr::null()) };
    static THREAD_FLAG: AtomicI32 = const { AtomicI32::new(0) };
    static THREAD_REG: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

pub(crate) fn controller() -> Option<&'static Controller> {
    CONTROLLER.get()
}

pub(crate) fn activated() -> bool {
    ACTIVATED.load(Ordering::Relaxed)
}

/// Raise the enable count; thread-local or process-wide.
pub(crate) fn enable(global: bool) {
    if global {
        ENABLED.fetch_add(1, Ordering::Relaxed);
    } else {
        let _ = THREAD_FLAG.try_with(|flag| flag.fetch_add(1, Ordering::Relaxed));
    }
}

/// Lower the enable count and report whether profiling was on before the
/// call. The thread-local variant is how every hook keeps its own work
/// out of the profile:
/// `let was = disable(false); if was { record(); } enable(false);`
pub(crate) fn disable(global: bool) -> bool {
    if global {
        ENABLED.fetch_sub(1, Ordering::Relaxed) > 0
    } else {
        let was = THREAD_FLAG
            .try_with(|flag| flag.fetch_sub(1, Ordering::Relaxed) > 0)
            .unwrap_or(false);
        was && ENABLED.load(Ordering::Relaxed) > 0
    }
}

/// The current thread's trace buffer, or `None` when profiling is
/// inactive in this process or thread.
pub(crate) fn buffer() -> Option<&'static ProfileBuffer> {
    let raw = THREAD_BUF.try_with(|cell| cell.get()).unwrap_or(ptr::null());
    if raw.is_null() {
        None
    } else {
        // The pointer target is either the master buffer, which lives in
        // the controller for the rest of the process, or this thread's own
        // buffer, which stays alive until this thread's registration drops
        // and clears the cell first.
        Some(unsafe { &*raw })
    }
}

/// Ties a thread to its buffer; dropping it at thread exit merges the
/// per-thread data into the master buffer and retires the buffer.
struct Registration {
    buf: Arc<ProfileBuffer>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = THREAD_BUF.try_with(|cell| cell.set(ptr::null()));
        let Some(ctl) = CONTROLLER.get() else { return };
        if !Arc::ptr_eq(&self.buf, &ctl.master) {
            log::debug!(
                "merging profile buffer {:p} to master buffer {:p}",
                Arc::as_ptr(&self.buf),
                Arc::as_ptr(&ctl.master)
            );
            ctl.master.merge_from(&self.buf);
            ctl.buffers.lock().retain(|b| !Arc::ptr_eq(b, &self.buf));
        }
    }
}

/// Create (or share) a buffer for the calling thread and mark the thread
/// enabled.
pub(crate) fn register_thread() {
    let Some(ctl) = CONTROLLER.get() else { return };
    let buf = if ctl.per_thread {
        let buf = Arc::new(ProfileBuffer::new());
        ctl.buffers.lock().push(buf.clone());
        buf
    } else {
        ctl.master.clone()
    };
    let _ = THREAD_BUF.try_with(|cell| cell.set(Arc::as_ptr(&buf)));
    let _ = THREAD_REG.try_with(|reg| *reg.borrow_mut() = Some(Registration { buf }));
    let _ = THREAD_FLAG.try_with(|flag| flag.store(1, Ordering::Relaxed));
}

/// Merge and retire the calling thread's buffer; used by the exit traps
/// so the data survives even though thread-exit cleanup will not run.
fn retire_thread() {
    let reg = THREAD_REG
        .try_with(|reg| reg.borrow_mut().take())
        .unwrap_or(None);
    drop(reg);
}

/// The process image name, as the kernel reports it.
pub(crate) fn program_name() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| {
        std::fs::read("/proc/self/cmdline")
            .ok()
            .and_then(|bytes| {
                bytes
                    .split(|&b| b == 0)
                    .next()
                    .map(|arg0| String::from_utf8_lossy(arg0).into_owned())
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

/// Clear all profile buffers; used in the child after `fork` when the
/// configuration asks for a fresh profile.
pub(crate) fn reset_profiles() {
    let Some(ctl) = CONTROLLER.get() else { return };
    let buffers = ctl.buffers.lock();
    for buf in buffers.iter() {
        buf.lock().reset();
    }
    ctl.master.lock().reset();
}

/// Initialise the profiler core for `mode`. Captures the exit paths so a
/// dump is generated before the program goes away, prepares the master
/// buffer and this thread's buffer, and arms the dump thread when an
/// asynchronous dump trigger is configured.
///
/// Returns whether profiling is active in this process.
pub(crate) fn init(
    mode: &str,
    thread_init: Option<fn()>,
    per_thread: bool,
    clock_res: f64,
) -> bool {
    if POISONED.load(Ordering::Relaxed) {
        return false;
    }
    if let Some(ctl) = CONTROLLER.get() {
        log::error!("{} is already active, cannot also activate {}", ctl.mode, mode);
        return false;
    }

    let program = program_name();
    if let Ok(target) = std::env::var("IGPROF_TARGET") {
        if !program.contains(&target) {
            log::debug!(
                "current process not selected for profiling: '{}' does not match '{}'",
                program,
                target
            );
            return false;
        }
    }

    let options = match config::env_options() {
        Some(options) if !options.is_empty() => options,
        _ => {
            log::debug!("$IGPROF not set, not profiling this process ({})", program);
            return false;
        }
    };
    let parsed = config::parse(options);

    let controller = Controller {
        mode: mode.to_string(),
        per_thread,
        thread_init,
        clock_res,
        master: Arc::new(ProfileBuffer::new()),
        buffers: Mutex::new(Vec::new()),
        out_path: parsed.out,
        dump_flag: parsed.dump,
        reset_on_fork: parsed.reset_on_fork,
    };
    if CONTROLLER.set(controller).is_err() {
        return false;
    }

    // Dump when the application is about to exit normally.
    unsafe {
        atexit(exit_dump_handler);
    }

    register_thread();

    if CONTROLLER.get().map(|ctl| ctl.dump_flag.is_some()) == Some(true) {
        dumper::spawn_dump_thread();
    }

    install_process_traps();

    ENABLED.store(1, Ordering::Relaxed);
    ACTIVATED.store(true, Ordering::Relaxed);
    MAIN_THREAD.store(unsafe { libc::pthread_self() } as u64, Ordering::Relaxed);
    log::debug!(
        "profiler activated in {}, main thread id {:#x}",
        program,
        MAIN_THREAD.load(Ordering::Relaxed)
    );
    log::debug!("profiler options: {}", options);
    if clock_res > 0.0 {
        log::debug!("timing resolution is {} s", clock_res);
    }
    true
}

/// Final exit: disable everything, stop the timers, dump synchronously,
/// and poison re-initialisation.
extern "C" fn exit_dump_handler() {
    if !ACTIVATED.load(Ordering::Relaxed) {
        return;
    }
    log::debug!(
        "final exit in thread {:#x}, saving profile data",
        unsafe { libc::pthread_self() } as u64
    );
    ENABLED.store(0, Ordering::Relaxed);
    ACTIVATED.store(false, Ordering::Relaxed);
    QUITTING.store(1, Ordering::Relaxed);
    dumper::stop_interval_timers();
    dumper::dump_all(None, false);
    log::debug!("profiler quitting");
    POISONED.store(true, Ordering::Relaxed);
}

// ------------------------------------------------------------------
// Process-structure traps.

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

hook_stub_dual!(exit_trap + exit_trap_libc / EXIT_MAIN + EXIT_LIBC:
    fn(code: c_int) -> () => do_exit);
hook_stub_dual!(exit2_trap + exit2_trap_libc / EXIT2_MAIN + EXIT2_LIBC:
    fn(code: c_int) -> () => do_exit);
hook_stub_dual!(kill_trap + kill_trap_libc / KILL_MAIN + KILL_LIBC:
    fn(pid: libc::pid_t, sig: c_int) -> c_int => do_kill);
hook_stub!(pthread_create_trap / PTHREAD_CREATE:
    fn(
        thread: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start_routine: StartRoutine,
        arg: *mut c_void
    ) -> c_int => do_pthread_create);

fn install_process_traps() {
    hooks::install_dual(
        "exit",
        "libc.so.6",
        exit_trap as *const (),
        &EXIT_MAIN,
        exit_trap_libc as *const (),
        &EXIT_LIBC,
    );
    hooks::install_dual(
        "_exit",
        "libc.so.6",
        exit2_trap as *const (),
        &EXIT2_MAIN,
        exit2_trap_libc as *const (),
        &EXIT2_LIBC,
    );
    hooks::install_dual(
        "kill",
        "libc.so.6",
        kill_trap as *const (),
        &KILL_MAIN,
        kill_trap_libc as *const (),
        &KILL_LIBC,
    );
    let _ = hooks::install(
        "pthread_create",
        None,
        None,
        pthread_create_trap as *const (),
        &PTHREAD_CREATE,
    );
}

/// A thread leaving through `exit` or `_exit` takes the whole process
/// with it; fold its buffer into the master first, then forward.
unsafe fn do_exit(chain: unsafe extern "C" fn(c_int), code: c_int) {
    log::debug!(
        "exit({}) called in thread {:#x}",
        code,
        unsafe { libc::pthread_self() } as u64
    );
    retire_thread();
    unsafe { chain(code) };
}

/// Signals that usually end the process trigger a dump before the kill
/// proceeds; mostly this catches `abort()`.
unsafe fn do_kill(
    chain: unsafe extern "C" fn(libc::pid_t, c_int) -> c_int,
    pid: libc::pid_t,
    sig: c_int,
) -> c_int {
    let own = pid == 0 || pid == unsafe { libc::getpid() };
    let fatal = matches!(
        sig,
        libc::SIGHUP
            | libc::SIGINT
            | libc::SIGQUIT
            | libc::SIGILL
            | libc::SIGABRT
            | libc::SIGFPE
            | libc::SIGKILL
            | libc::SIGSEGV
            | libc::SIGPIPE
            | libc::SIGALRM
            | libc::SIGTERM
            | libc::SIGUSR1
            | libc::SIGUSR2
            | libc::SIGBUS
    );
    if own && fatal {
        if disable(false) {
            disable(true);
            log::debug!("kill({},{}) called, dumping state", pid, sig);
            dumper::dump_all(None, false);
            enable(true);
        }
        enable(false);
    }
    unsafe { chain(pid, sig) }
}

struct WrappedStart {
    start_routine: StartRoutine,
    arg: *mut c_void,
}

/// Every profiled thread starts here: set up its buffer and enable flag,
/// run the mode's per-thread setup, then hand over to the user routine.
extern "C" fn thread_wrapper(arg: *mut c_void) -> *mut c_void {
    let wrapped = unsafe { Box::from_raw(arg as *mut WrappedStart) };
    let start_routine = wrapped.start_routine;
    let start_arg = wrapped.arg;
    drop(wrapped);

    if activated() {
        log::debug!(
            "captured thread id {:#x} for profiling ({:p}({:p}))",
            unsafe { libc::pthread_self() } as u64,
            start_routine as *const (),
            start_arg
        );
        register_thread();
    }

    // Touch the stack walker once before any profile signal can arrive.
    let mut dummy = [0usize; 1];
    crate::walker::stacktrace(&mut dummy);

    if activated() {
        if let Some(thread_init) = CONTROLLER.get().and_then(|ctl| ctl.thread_init) {
            thread_init();
        }
    }

    let ret = start_routine(start_arg);

    if activated() {
        log::debug!(
            "leaving thread id {:#x} from profiling ({:p}({:p}))",
            unsafe { libc::pthread_self() } as u64,
            start_routine as *const (),
            start_arg
        );
        dumper::stop_interval_timers();
    }
    // The registration's destructor merges the buffer when thread-local
    // storage unwinds.
    ret
}

unsafe fn do_pthread_create(
    chain: unsafe extern "C" fn(
        *mut libc::pthread_t,
        *const libc::pthread_attr_t,
        StartRoutine,
        *mut c_void,
    ) -> c_int,
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    unsafe {
        // Profiled threads need room for the walker; bump tiny stacks.
        let mut stack_size: libc::size_t = 0;
        if !attr.is_null()
            && libc::pthread_attr_getstacksize(attr, &mut stack_size) == 0
            && stack_size < 64 * 1024
        {
            log::debug!("pthread_create increasing stack from {} to 64kB", stack_size);
            libc::pthread_attr_setstacksize(attr as *mut libc::pthread_attr_t, 64 * 1024);
        }

        if INTERNAL_SPAWN.load(Ordering::Acquire) {
            return chain(thread, attr, start_routine, arg);
        }

        // Ferry the real start routine through the heap with the profiler
        // off, so an allocation-tracking mode does not attribute it.
        disable(false);
        let wrapped = Box::into_raw(Box::new(WrappedStart { start_routine, arg }));
        enable(false);
        chain(thread, attr, thread_wrapper, wrapped as *mut c_void)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers both the per-thread counter and the global gate:
    // they share the process-wide ENABLED value, so interleaving across
    // test threads would make the assertions ambiguous.
    #[test]
    fn enable_counters_nest_and_gate() {
        std::thread::spawn(|| {
            // Globally off: the thread flag alone is not enough.
            enable(false);
            assert!(!disable(false));
            enable(false);

            enable(true);

            // Thread flag is 1 here: on, and pairs nest.
            assert!(disable(false));
            enable(false);
            enable(false);
            enable(false);
            assert!(disable(false));
            assert!(disable(false));
            assert!(disable(false));
            // Now the flag has dropped to zero.
            assert!(!disable(false));
            enable(false);

            disable(true);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn buffer_is_absent_without_activation() {
        std::thread::spawn(|| assert!(buffer().is_none())).join().unwrap();
    }

    #[test]
    fn program_name_is_nonempty() {
        assert!(!program_name().is_empty());
    }
}
