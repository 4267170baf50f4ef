use graft_profile::dump::{dump_tree, reset_ids, DumpState, SymbolInfo};
use graft_profile::{CounterDef, CounterKind, ProfileBuffer};

// Counter definitions are declared per test: the dump-time id lives inside
// the definition, and tests run concurrently.

/// Deterministic stand-in for the symboliser: every address is its own
/// symbol in a single fake library, offset by one from the symbol start.
fn fake_resolver(address: u64) -> SymbolInfo {
    SymbolInfo {
        symbol: Some(format!("fn_{:x}", address)),
        library: Some("libtest.so".to_string()),
        sym_offset: 1,
        lib_offset: address as i64,
    }
}

fn dump_to_string(bufs: &[&ProfileBuffer]) -> String {
    let mut out = Vec::new();
    let mut state = DumpState::new();
    for buf in bufs {
        let guard = buf.lock();
        dump_tree(&guard, &mut out, &mut state, &mut fake_resolver).unwrap();
    }
    for buf in bufs {
        let guard = buf.lock();
        reset_ids(&guard);
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn tick_sequence_produces_one_line_per_depth() {
    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    let buf = ProfileBuffer::new();
    {
        let mut b = buf.lock();
        let frame = b.push(&[0xc, 0xb, 0xa]);
        for _ in 0..100 {
            b.tick(frame, &CPU, 1, 1);
        }
    }
    let text = dump_to_string(&[&buf]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "C1 FN0=(F0=(libtest.so)+10 N=(fn_a))+1");
    assert_eq!(lines[1], "C2 FN1=(F0+11 N=(fn_b))+1");
    assert_eq!(lines[2], "C3 FN2=(F0+12 N=(fn_c))+1 V0=(CPU):(100,100,100)");
}

#[test]
fn live_resources_are_emitted_as_leaks() {
    static MEM_LIVE: CounterDef = CounterDef::new("MEM_LIVE", CounterKind::Tick);
    let buf = ProfileBuffer::new();
    {
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        let ctr = b.tick(frame, &MEM_LIVE, 32, 1).unwrap();
        b.acquire(ctr, 0x1000, 32);
        let ctr = b.tick(frame, &MEM_LIVE, 64, 1).unwrap();
        b.acquire(ctr, 0x2000, 64);
        b.release(0x1000);
    }
    let text = dump_to_string(&[&buf]);
    let leaf = text.lines().last().unwrap();
    assert!(
        leaf.ends_with("V0=(MEM_LIVE):(1,64,96) ;LK=(0x2000,64)"),
        "unexpected leaf line: {leaf}"
    );
}

#[test]
fn derived_leak_size_replaces_nominal_size() {
    static PAGES: CounterDef = CounterDef::with_derived_leak_size(
        "MEM_PAGES",
        CounterKind::Tick,
        |_res, size| size / 4096,
    );
    let buf = ProfileBuffer::new();
    {
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        let ctr = b.tick(frame, &PAGES, 3 * 4096, 1).unwrap();
        b.acquire(ctr, 0x5000, 3 * 4096);
        // Sub-page allocation derives to zero and is omitted entirely.
        let ctr = b.tick(frame, &PAGES, 100, 1).unwrap();
        b.acquire(ctr, 0x9000, 100);
    }
    let text = dump_to_string(&[&buf]);
    let leaf = text.lines().last().unwrap();
    assert!(leaf.contains(";LK=(0x5000,3)"), "missing derived leak: {leaf}");
    assert!(!leaf.contains("0x9000"), "zero-sized leak not omitted: {leaf}");
}

#[test]
fn ids_are_interned_across_buffers_within_one_dump() {
    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    let a = ProfileBuffer::new();
    let b = ProfileBuffer::new();
    {
        let mut g = a.lock();
        let frame = g.push(&[0xa]);
        g.tick(frame, &CPU, 1, 1);
    }
    {
        let mut g = b.lock();
        let frame = g.push(&[0xa]);
        g.tick(frame, &CPU, 2, 2);
    }
    let text = dump_to_string(&[&a, &b]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    // First buffer defines the symbol, library and counter ids; the second
    // reuses all three without redefinition.
    assert_eq!(lines[0], "C1 FN0=(F0=(libtest.so)+10 N=(fn_a))+1 V0=(CPU):(1,1,1)");
    assert_eq!(lines[1], "C1 FN0+1 V0:(2,2,2)");
}

#[test]
fn redump_is_byte_identical() {
    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    static MEM_LIVE: CounterDef = CounterDef::new("MEM_LIVE", CounterKind::Tick);
    let buf = ProfileBuffer::new();
    {
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        b.tick(frame, &CPU, 5, 5);
        let ctr = b.tick(frame, &MEM_LIVE, 16, 1).unwrap();
        b.acquire(ctr, 0x8000, 16);
    }
    let first = dump_to_string(&[&buf]);
    let second = dump_to_string(&[&buf]);
    assert_eq!(first, second);
}

#[test]
fn counters_with_no_ticks_and_no_peak_are_skipped() {
    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    let buf = ProfileBuffer::new();
    {
        let mut b = buf.lock();
        let frame = b.push(&[0x7]);
        // Zero-amount, zero-tick update creates the counter but leaves it
        // with nothing to report.
        b.tick(frame, &CPU, 0, 0);
    }
    let text = dump_to_string(&[&buf]);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(!lines[0].contains('V'), "empty counter emitted: {}", lines[0]);
}

#[test]
fn shared_buffer_survives_concurrent_recording() {
    use std::sync::Arc;

    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    static LIVE: CounterDef = CounterDef::new("MEM_LIVE", CounterKind::Tick);

    let master = Arc::new(ProfileBuffer::new());
    let workers: Vec<_> = (0..4u64)
        .map(|t| {
            let master = Arc::clone(&master);
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    let mut guard = master.lock();
                    let frame = guard.push(&[(0x10 + t) as usize, 0x1]);
                    guard.tick(frame, &CPU, 1, 1);
                    // Acquire and release a thread-unique id, like an
                    // allocation would.
                    let id = (t << 32) | i;
                    if let Some(ctr) = guard.tick(frame, &LIVE, 8, 1) {
                        guard.acquire(ctr, id, 8);
                    }
                    drop(guard);
                    master.lock().release(id);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let guard = master.lock();
    let (ticks, value, _, _) = guard.totals(&CPU);
    assert_eq!((ticks, value), (4000, 4000));
    let (live_ticks, live_value, live_peak, live) = guard.totals(&LIVE);
    assert_eq!((live_ticks, live_value, live), (0, 0, 0));
    assert!(live_peak >= 8);
}

#[test]
fn per_thread_buffers_merge_into_a_master() {
    use std::sync::Arc;

    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);

    let master = Arc::new(ProfileBuffer::new());
    let workers: Vec<_> = (0..3u64)
        .map(|t| {
            let master = Arc::clone(&master);
            std::thread::spawn(move || {
                // Thread-local buffer, merged at the end like a thread
                // registration would on exit.
                let own = ProfileBuffer::new();
                {
                    let mut guard = own.lock();
                    for _ in 0..50 {
                        let frame = guard.push(&[0x30 + t as usize, 0x2, 0x1]);
                        guard.tick(frame, &CPU, 1, 1);
                    }
                }
                master.merge_from(&own);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let guard = master.lock();
    let (ticks, value, _, _) = guard.totals(&CPU);
    assert_eq!((ticks, value), (150, 150));
}

#[test]
fn merged_buffer_dumps_like_the_sum() {
    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    let a = ProfileBuffer::new();
    let b = ProfileBuffer::new();
    {
        let mut g = a.lock();
        let frame = g.push(&[0xf2, 0xf1]);
        g.tick(frame, &CPU, 3, 3);
    }
    {
        let mut g = b.lock();
        let frame = g.push(&[0xf2, 0xf1]);
        g.tick(frame, &CPU, 5, 5);
        let frame = g.push(&[0xf3, 0xf1]);
        g.tick(frame, &CPU, 2, 2);
    }
    a.merge_from(&b);
    let text = dump_to_string(&[&a]);
    assert!(
        text.contains("V0=(CPU):(8,8,8)"),
        "merged counter missing: {text}"
    );
    assert!(text.contains(":(2,2,2)"), "disjoint path lost: {text}");
}
