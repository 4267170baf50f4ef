//! Interval-timer CPU profiling.
//!
//! Arms one of the three interval timers and records a tick for the
//! sampled call stack on every timer signal. Because the timer signal and
//! the buffers are per thread, the handler only ever touches an
//! uncontended lock. The mode also guards its own machinery: attempts to
//! block the profiling signal or replace its handler are stripped, and
//! `fork`/`system` get the timer slowed down so the kernel's
//! restart-on-EINTR clone loop cannot diverge, with the elapsed time
//! billed back afterwards as a synthetic batch of ticks.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void};

use graft_profile::{CounterDef, CounterKind, MAX_DEPTH};

use crate::hooks::{self, hook_stub};
use crate::walker::{cycles, stacktrace};
use crate::{config, profiler};

static TICKS: CounterDef = CounterDef::new("PERF_TICKS", CounterKind::Tick);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SIGNAL: AtomicI32 = AtomicI32::new(libc::SIGPROF);
static ITIMER: AtomicI32 = AtomicI32::new(libc::ITIMER_PROF);
static FORK_ORIGINAL: AtomicUsize = AtomicUsize::new(0);
static SYSTEM_ORIGINAL: AtomicUsize = AtomicUsize::new(0);

/// Sampling period, microseconds.
const INTERVAL_USEC: libc::suseconds_t = 5000;

fn itv(
    int_sec: libc::time_t,
    int_usec: libc::suseconds_t,
    val_sec: libc::time_t,
    val_usec: libc::suseconds_t,
) -> libc::itimerval {
    libc::itimerval {
        it_interval: libc::timeval { tv_sec: int_sec, tv_usec: int_usec },
        it_value: libc::timeval { tv_sec: val_sec, tv_usec: val_usec },
    }
}

fn tv2sec(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 * 1e-6
}

/// Record a tick for the current program location. Runs as the signal
/// handler for the profiling signal in every profiled thread; skips the
/// sample when the profiler is not enabled.
unsafe extern "C" fn profile_signal_handler(
    _sig: c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut c_void,
) {
    let mut addresses = [0usize; MAX_DEPTH];
    if profiler::disable(false) {
        if let Some(buf) = profiler::buffer() {
            let tstart = cycles();
            let depth = stacktrace(&mut addresses);
            let tend = cycles();

            // Drop the top frames for the handler and the signal glue.
            let skip = depth.min(3);
            let mut guard = buf.lock();
            let frame = guard.push(&addresses[skip..depth]);
            guard.tick(frame, &TICKS, 1, 1);
            guard.trace_perf(depth, tstart, tend);
        }
    }
    profiler::enable(false);
}

/// Let the profiling signal through and route it to our handler. Needs to
/// run in every thread to be profiled.
fn enable_signal_handler() {
    unsafe {
        let sig = SIGNAL.load(Ordering::Relaxed);
        let mut sigs: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut sigs);
        libc::sigaddset(&mut sigs, sig);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &sigs, ptr::null_mut());

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = profile_signal_handler as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
        libc::sigaction(sig, &sa, ptr::null_mut());
    }
}

fn enable_timer() {
    let interval = itv(0, INTERVAL_USEC, 0, INTERVAL_USEC);
    unsafe {
        libc::setitimer(ITIMER.load(Ordering::Relaxed), &interval, ptr::null_mut());
    }
}

fn thread_init() {
    enable_signal_handler();
    enable_timer();
}

/// Arm the timer briefly to learn what period the kernel actually grants.
fn measure_clock_resolution() -> f64 {
    unsafe {
        let itimer = ITIMER.load(Ordering::Relaxed);
        let probe = itv(0, INTERVAL_USEC, 100, 0);
        let nullified = itv(0, 0, 0, 0);
        let mut precision: libc::itimerval = mem::zeroed();
        libc::setitimer(itimer, &probe, ptr::null_mut());
        libc::getitimer(itimer, &mut precision);
        libc::setitimer(itimer, &nullified, ptr::null_mut());
        tv2sec(&precision.it_interval)
    }
}

/// Possibly start the performance profiler.
pub(crate) fn initialize(options: &str) {
    if INITIALIZED.swap(true, Ordering::Relaxed) {
        return;
    }
    let Some(flavours) = config::find_token(options, "perf") else { return };
    for flavour in flavours.split(':').filter(|s| !s.is_empty()) {
        match flavour {
            "real" => {
                SIGNAL.store(libc::SIGALRM, Ordering::Relaxed);
                ITIMER.store(libc::ITIMER_REAL, Ordering::Relaxed);
            }
            "user" => {
                SIGNAL.store(libc::SIGVTALRM, Ordering::Relaxed);
                ITIMER.store(libc::ITIMER_VIRTUAL, Ordering::Relaxed);
            }
            "process" => {
                SIGNAL.store(libc::SIGPROF, Ordering::Relaxed);
                ITIMER.store(libc::ITIMER_PROF, Ordering::Relaxed);
            }
            other => log::debug!("perf: ignoring unknown option '{}'", other),
        }
    }

    let clock_res = measure_clock_resolution();
    if !profiler::init("performance profiler", Some(thread_init), true, clock_res) {
        return;
    }

    profiler::disable(true);
    match ITIMER.load(Ordering::Relaxed) {
        libc::ITIMER_REAL => log::debug!("perf: measuring real time"),
        libc::ITIMER_VIRTUAL => log::debug!("perf: profiling user time"),
        _ => log::debug!("perf: profiling process time"),
    }

    if let Some(hook) = hooks::install("fork", None, None, fork_trap as *const (), &FORK) {
        FORK_ORIGINAL.store(hook.original as usize, Ordering::Relaxed);
    }
    if let Some(hook) = hooks::install("system", None, None, system_trap as *const (), &SYSTEM) {
        SYSTEM_ORIGINAL.store(hook.original as usize, Ordering::Relaxed);
    }
    let _ = hooks::install(
        "pthread_sigmask",
        None,
        None,
        sigmask_trap as *const (),
        &SIGMASK,
    );
    let _ = hooks::install(
        "sigaction",
        None,
        None,
        sigaction_trap as *const (),
        &SIGACTION,
    );
    log::debug!("performance profiler enabled");

    enable_signal_handler();
    enable_timer();
    profiler::enable(true);
}

// ------------------------------------------------------------------
// Guard traps.

hook_stub!(fork_trap / FORK: fn() -> c_int => do_fork);
hook_stub!(system_trap / SYSTEM: fn(command: *const c_char) -> c_int => do_system);
hook_stub!(sigmask_trap / SIGMASK:
    fn(how: c_int, newmask: *mut libc::sigset_t, oldmask: *mut libc::sigset_t) -> c_int
    => do_pthread_sigmask);
hook_stub!(sigaction_trap / SIGACTION:
    fn(signum: c_int, act: *const libc::sigaction, oact: *mut libc::sigaction) -> c_int
    => do_sigaction);

/// Refuse to let application code block the profiling signal while the
/// timer is armed and our handler is in place.
unsafe fn do_pthread_sigmask(
    chain: unsafe extern "C" fn(c_int, *mut libc::sigset_t, *mut libc::sigset_t) -> c_int,
    how: c_int,
    newmask: *mut libc::sigset_t,
    oldmask: *mut libc::sigset_t,
) -> c_int {
    unsafe {
        let sig = SIGNAL.load(Ordering::Relaxed);
        if !newmask.is_null()
            && (how == libc::SIG_BLOCK || how == libc::SIG_SETMASK)
            && libc::sigismember(newmask, sig) == 1
        {
            let mut cursig: libc::sigaction = mem::zeroed();
            let mut curtimer: libc::itimerval = mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &mut cursig) == 0
                && cursig.sa_sigaction != 0
                && libc::getitimer(ITIMER.load(Ordering::Relaxed), &mut curtimer) == 0
                && (curtimer.it_interval.tv_sec != 0 || curtimer.it_interval.tv_usec != 0)
            {
                log::debug!(
                    "pthread_sigmask(): prevented profiling signal {} from being blocked \
                     in thread {:#x} [handler {:#x}, interval {:.0} us]",
                    sig,
                    libc::pthread_self() as u64,
                    cursig.sa_sigaction,
                    1e6 * curtimer.it_interval.tv_sec as f64
                        + curtimer.it_interval.tv_usec as f64
                );
                libc::sigdelset(newmask, sig);
            }
        }
        chain(how, newmask, oldmask)
    }
}

/// Refuse to let application code replace the profiling signal handler.
unsafe fn do_sigaction(
    chain: unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int,
    signum: c_int,
    act: *const libc::sigaction,
    oact: *mut libc::sigaction,
) -> c_int {
    unsafe {
        if signum == SIGNAL.load(Ordering::Relaxed)
            && !act.is_null()
            && (*act).sa_sigaction != profile_signal_handler as usize
        {
            log::debug!(
                "sigaction(): prevented profiling signal {} from being overridden \
                 in thread {:#x}",
                signum,
                libc::pthread_self() as u64
            );
            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_sigaction = profile_signal_handler as usize;
            sa.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO;
            return chain(signum, &sa, oact);
        }
        chain(signum, act, oact)
    }
}

/// Slows the profiling timer to a crawl for the duration of a fork-like
/// call; `finish` restores it and, when asked, bills the elapsed time to
/// the intercepted call as one synthetic batch of ticks.
struct TimerBlink {
    enabled: bool,
    dt: f64,
}

impl TimerBlink {
    fn begin() -> TimerBlink {
        let enabled = profiler::disable(false);
        let slow = itv(10, 0, 10, 0);
        let mut left: libc::itimerval = unsafe { mem::zeroed() };
        unsafe {
            libc::setitimer(ITIMER.load(Ordering::Relaxed), &slow, &mut left);
        }
        TimerBlink {
            enabled,
            dt: tv2sec(&left.it_interval) - tv2sec(&left.it_value),
        }
    }

    fn finish(mut self, original: usize, attribute: bool) {
        let itimer = ITIMER.load(Ordering::Relaxed);
        let fast = itv(0, INTERVAL_USEC, 0, INTERVAL_USEC);
        let mut slow: libc::itimerval = unsafe { mem::zeroed() };
        let mut left: libc::itimerval = unsafe { mem::zeroed() };
        unsafe {
            libc::setitimer(itimer, &fast, &mut slow);
            libc::getitimer(itimer, &mut left);
        }
        self.dt += tv2sec(&slow.it_interval) - tv2sec(&slow.it_value);
        let interval = tv2sec(&left.it_interval);
        let nticks = if interval > 0.0 {
            (self.dt / interval + 0.5) as u64
        } else {
            0
        };

        if attribute && self.enabled && nticks > 0 {
            if let Some(buf) = profiler::buffer() {
                let mut addresses = [0usize; MAX_DEPTH];
                let tstart = cycles();
                let depth = stacktrace(&mut addresses);
                let tend = cycles();
                // Drop this frame and blame the intercepted call itself.
                if depth > 1 {
                    addresses[1] = original;
                }
                let skip = depth.min(1);
                let mut guard = buf.lock();
                let frame = guard.push(&addresses[skip..depth]);
                guard.tick(frame, &TICKS, 1, nticks);
                guard.trace_perf(depth, tstart, tend);
            }
        }

        log::debug!(
            "resuming profiling after blinking for {:.3}ms, {} ticks",
            self.dt * 1000.0,
            nticks
        );
        profiler::enable(false);
    }
}

/// Large processes can take long enough to fork that a profiling signal
/// inside `clone` keeps restarting it; blink the timer around the call.
unsafe fn do_fork(chain: unsafe extern "C" fn() -> c_int) -> c_int {
    let blink = TimerBlink::begin();
    let ret = unsafe { chain() };
    if ret == 0 {
        // In the child the timer is gone either way; optionally start
        // over with empty profiles.
        let reset = profiler::controller().map(|ctl| ctl.reset_on_fork).unwrap_or(false);
        if reset {
            profiler::reset_profiles();
        }
        blink.finish(0, false);
    } else {
        blink.finish(FORK_ORIGINAL.load(Ordering::Relaxed), ret > 0);
    }
    ret
}

/// `system` reaches `clone` without passing through `fork`, so it gets
/// the same treatment.
unsafe fn do_system(
    chain: unsafe extern "C" fn(*const c_char) -> c_int,
    command: *const c_char,
) -> c_int {
    let blink = TimerBlink::begin();
    let ret = unsafe { chain(command) };
    blink.finish(SYSTEM_ORIGINAL.load(Ordering::Relaxed), true);
    ret
}
