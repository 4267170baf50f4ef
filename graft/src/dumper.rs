//! Dump environment: output targets, the asynchronous dump thread, and
//! the pass that serialises every live buffer.
//!
//! Dumps run on threads the engine never registers for profiling, so the
//! pass may allocate freely: the hooks see a disabled thread and record
//! nothing, which keeps buffer locks out of reach of the dumper's own
//! allocations. Mid-run recording on other threads continues; each buffer
//! is only held for the time it takes to stream it out.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::Ordering;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};

use graft_profile::dump::{dump_tree, reset_ids, DumpState};
use graft_profile::TraceStats;

use crate::profiler::{self, INTERNAL_SPAWN, QUITTING};
use crate::symbols;

/// Zero out all three interval timers.
pub(crate) fn stop_interval_timers() {
    let stopped = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    unsafe {
        libc::setitimer(libc::ITIMER_PROF, &stopped, std::ptr::null_mut());
        libc::setitimer(libc::ITIMER_VIRTUAL, &stopped, std::ptr::null_mut());
        libc::setitimer(libc::ITIMER_REAL, &stopped, std::ptr::null_mut());
    }
}

/// Holds all signals and timers off for the duration of a mid-run dump;
/// restores them on drop.
struct SignalQuiesce {
    prof: libc::itimerval,
    virt: libc::itimerval,
    real: libc::itimerval,
    mask: libc::sigset_t,
}

impl SignalQuiesce {
    fn begin() -> SignalQuiesce {
        unsafe {
            let stopped = libc::itimerval {
                it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
            };
            let mut quiesce = SignalQuiesce {
                prof: mem::zeroed(),
                virt: mem::zeroed(),
                real: mem::zeroed(),
                mask: mem::zeroed(),
            };
            libc::setitimer(libc::ITIMER_PROF, &stopped, &mut quiesce.prof);
            libc::setitimer(libc::ITIMER_VIRTUAL, &stopped, &mut quiesce.virt);
            libc::setitimer(libc::ITIMER_REAL, &stopped, &mut quiesce.real);

            let mut everything: libc::sigset_t = mem::zeroed();
            libc::sigfillset(&mut everything);
            libc::pthread_sigmask(libc::SIG_BLOCK, &everything, &mut quiesce.mask);
            quiesce
        }
    }
}

impl Drop for SignalQuiesce {
    fn drop(&mut self) {
        unsafe {
            libc::setitimer(libc::ITIMER_PROF, &self.prof, std::ptr::null_mut());
            libc::setitimer(libc::ITIMER_VIRTUAL, &self.virt, std::ptr::null_mut());
            libc::setitimer(libc::ITIMER_REAL, &self.real, std::ptr::null_mut());
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.mask, std::ptr::null_mut());
        }
    }
}

enum Output {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
    Pipe(BufWriter<ChildStdin>, Child),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(w) => w.write(buf),
            Output::Gz(w) => w.write(buf),
            Output::Pipe(w, _) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.flush(),
            Output::Gz(w) => w.flush(),
            Output::Pipe(w, _) => w.flush(),
        }
    }
}

impl Output {
    fn finish(self) -> io::Result<()> {
        match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gz(w) => {
                let mut inner = w.finish()?;
                inner.flush()
            }
            Output::Pipe(w, mut child) => {
                // Close the pipe so the child sees end of input.
                drop(w);
                child.wait()?;
                Ok(())
            }
        }
    }
}

/// Open the configured dump target. A leading `|` runs the rest as a
/// shell command with our preload stripped from its environment, so the
/// child does not instrument itself recursively; a `.gz` suffix selects
/// in-process compression.
fn open_output(target: &str) -> io::Result<Output> {
    if let Some(command) = target.strip_prefix('|') {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .env_remove("LD_PRELOAD")
            .stdin(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("no pipe to dump subprocess"))?;
        Ok(Output::Pipe(BufWriter::new(stdin), child))
    } else if target.ends_with(".gz") {
        let file = File::create(target)?;
        let gz = GzBuilder::new().write(BufWriter::new(file), Compression::default());
        Ok(Output::Gz(gz))
    } else {
        Ok(Output::Plain(BufWriter::new(File::create(target)?)))
    }
}

fn default_output_name() -> String {
    let program = profiler::program_name();
    let base = program.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("unnamed");
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    format!(
        "igprof.{}.{}.{}.{:06}.gz",
        base,
        std::process::id(),
        tv.tv_sec,
        tv.tv_usec
    )
}

/// Serialise all live buffers and the master buffer to `tofile` (or the
/// configured/default target). `quiesce` additionally blocks signals and
/// timers around the dump; the exit path has already done both.
pub(crate) fn dump_all(tofile: Option<&str>, quiesce: bool) {
    let Some(ctl) = profiler::controller() else { return };

    let _quiet = if quiesce { Some(SignalQuiesce::begin()) } else { None };

    let target = match tofile {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => match &ctl.out_path {
            Some(path) if !path.is_empty() => path.clone(),
            _ => default_output_name(),
        },
    };
    log::debug!("dumping state to {}", target);

    let mut out = match open_output(&target) {
        Ok(out) => out,
        Err(err) => {
            log::debug!("can't write to output {}: {}", target, err);
            return;
        }
    };

    let mut perf = TraceStats::default();
    let result = (|| -> io::Result<()> {
        writeln!(
            out,
            "P=(HEX ID={} N=({}) T={:.6})",
            std::process::id(),
            profiler::program_name(),
            ctl.clock_res
        )?;

        let mut state = DumpState::new();
        let mut resolve = |address: u64| symbols::resolve(address);

        // Per-thread buffers first, then the master: cheaper than merging
        // everything and a mid-run dump keeps its thread locality.
        let buffers = ctl.buffers.lock();
        for buf in buffers.iter() {
            let guard = buf.lock();
            dump_tree(&guard, &mut out, &mut state, &mut resolve)?;
            reset_ids(&guard);
            perf += guard.stats();
        }
        {
            let guard = ctl.master.lock();
            dump_tree(&guard, &mut out, &mut state, &mut resolve)?;
            reset_ids(&guard);
            perf += guard.stats();
        }
        Ok(())
    })();

    if let Err(err) = result.and_then(|()| out.finish()) {
        log::debug!("profile dump to {} failed: {}", target, err);
        return;
    }

    if perf.ntraces > 0 {
        let n = perf.ntraces as f64;
        let depth_avg = perf.sum_depth as f64 / n;
        let ticks_avg = perf.sum_ticks as f64 / n;
        let tperd_avg = perf.sum_tperd as f64 / 16.0 / n;
        log::debug!(
            "trace perf: ntraces={:.0} depth=[av {:.1}, rms {:.1}] ticks=[av {:.1}, rms {:.1}] \
             ticks-per-depth=[av {:.1}, rms {:.1}]",
            n,
            depth_avg,
            (perf.sum2_depth as f64 / n - depth_avg * depth_avg).sqrt(),
            ticks_avg,
            (perf.sum2_ticks as f64 / n - ticks_avg * ticks_avg).sqrt(),
            tperd_avg,
            (perf.sum2_tperd as f64 / 256.0 / n - tperd_avg * tperd_avg).sqrt()
        );
    }
}

/// Trigger a dump without blocking profiling on the calling thread: the
/// work runs on a fresh unprofiled thread so no buffer lock is ever
/// taken recursively.
pub(crate) fn dump_now(tofile: Option<&str>) {
    let tofile = tofile.map(str::to_string);
    INTERNAL_SPAWN.store(true, Ordering::Release);
    let worker = std::thread::Builder::new()
        .name("profile-dump".to_string())
        .spawn(move || dump_all(tofile.as_deref(), true));
    INTERNAL_SPAWN.store(false, Ordering::Release);
    if let Ok(worker) = worker {
        let _ = worker.join();
    }
}

/// Watch for the dump-trigger file and dump whenever it appears. Runs on
/// its own unprofiled thread so in-flight dumps never take a buffer lock
/// they already hold.
fn dump_thread_main() {
    let Some(ctl) = profiler::controller() else { return };
    let Some(flag) = ctl.dump_flag.clone() else { return };
    let mut countdown = 0u32;
    loop {
        // Once the process is quitting, give in-flight work about a
        // second and leave.
        if QUITTING.load(Ordering::Relaxed) > 0 && QUITTING.fetch_add(1, Ordering::Relaxed) > 100 {
            break;
        }

        countdown += 1;
        if countdown % 32 == 0 && Path::new(&flag).exists() {
            let _ = std::fs::remove_file(&flag);
            dump_all(None, true);
            countdown = 0;
        }

        std::thread::sleep(Duration::from_millis(10));
    }
}

pub(crate) fn spawn_dump_thread() {
    INTERNAL_SPAWN.store(true, Ordering::Release);
    let spawned = std::thread::Builder::new()
        .name("profile-dump".to_string())
        .spawn(dump_thread_main);
    INTERNAL_SPAWN.store(false, Ordering::Release);
    if let Err(err) = spawned {
        log::debug!("failed to start the dump thread: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn plain_target_writes_the_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.txt");
        let mut out = open_output(path.to_str().unwrap()).unwrap();
        out.write_all(b"P=(HEX ID=1 N=(x) T=0.000000)\n").unwrap();
        out.finish().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "P=(HEX ID=1 N=(x) T=0.000000)\n");
    }

    #[test]
    fn gz_target_compresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.gz");
        let mut out = open_output(path.to_str().unwrap()).unwrap();
        out.write_all(b"C1 FN0+0\n").unwrap();
        out.finish().unwrap();

        let file = File::open(&path).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        assert_eq!(text, "C1 FN0+0\n");
    }

    #[test]
    fn pipe_target_feeds_a_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piped.txt");
        let target = format!("|cat > {}", path.display());
        let mut out = open_output(&target).unwrap();
        out.write_all(b"C1 FN0+0\n").unwrap();
        out.finish().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "C1 FN0+0\n");
    }

    #[test]
    fn default_name_mentions_process_identity() {
        let name = default_output_name();
        assert!(name.starts_with("igprof."));
        assert!(name.ends_with(".gz"));
        assert!(name.contains(&std::process::id().to_string()));
    }
}
