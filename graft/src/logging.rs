//! Internal diagnostics.
//!
//! Everything in the engine logs through the `log` facade. When
//! `IGPROF_DEBUGGING` is set a minimal logger prints each line to stderr,
//! prefixed with the pid and a monotonic timestamp so interleaved output
//! from several profiled processes stays attributable.

use log::{LevelFilter, Log, Metadata, Record};

struct StderrLog;

impl Log for StderrLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        let seconds = ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9;
        eprintln!(
            "*** graft({}, {:.3}): {}",
            std::process::id(),
            seconds,
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: StderrLog = StderrLog;

/// Route the `log` macros to stderr if `IGPROF_DEBUGGING` is set; leave
/// logging off otherwise. Safe to call more than once.
pub(crate) fn init() {
    if std::env::var_os("IGPROF_DEBUGGING").is_some() {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    }
}
