use std::cell::UnsafeCell;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::arena::{mix, Arena};

/// Deepest supported stack depth.
pub const MAX_DEPTH: usize = 800;

/// Maximum number of counters supported per stack frame.
pub const MAX_COUNTERS: usize = 3;

/// Linear probe budget in the resource hash; exceeding it forces expansion.
pub const MAX_HASH_PROBES: usize = 8;

/// Resource id used for the synthesised peak pulse during merges. It can
/// never clash with a real address or descriptor.
const PEAK_SENTINEL: u64 = u64::MAX;

const DEFAULT_HASH_LOG_SIZE: u32 = 20;

/// The behaviour of a counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
    /// Ticked cumulative counter: `tick` adds the amount.
    Tick,
    /// Maximum-value counter: `tick` keeps the running maximum.
    Max,
}

/// Immutable definition of a counter, created once per profiling mode.
pub struct CounterDef {
    pub name: &'static str,
    pub kind: CounterKind,
    /// Reference id assigned while dumping, -1 in between dumps.
    pub id: AtomicI32,
    /// Recomputes the effective size of a live resource at dump time, for
    /// modes where the interesting quantity is derived from the allocation
    /// (untouched pages, for example) rather than its nominal size.
    pub derived_leak_size: Option<fn(resource: u64, size: u64) -> u64>,
}

impl CounterDef {
    pub const fn new(name: &'static str, kind: CounterKind) -> CounterDef {
        CounterDef {
            name,
            kind,
            id: AtomicI32::new(-1),
            derived_leak_size: None,
        }
    }

    pub const fn with_derived_leak_size(
        name: &'static str,
        kind: CounterKind,
        derived: fn(u64, u64) -> u64,
    ) -> CounterDef {
        CounterDef {
            name,
            kind,
            id: AtomicI32::new(-1),
            derived_leak_size: Some(derived),
        }
    }
}

/// Stack trace node. Children are kept in an address-sorted singly linked
/// list; node memory lives in the buffer's arena and is never reclaimed
/// individually.
pub(crate) struct StackNode {
    pub(crate) address: u64,
    pub(crate) sibling: *mut StackNode,
    pub(crate) children: *mut StackNode,
    pub(crate) counters: [*mut Counter; MAX_COUNTERS],
}

/// Counter value attached to one stack node.
pub(crate) struct Counter {
    pub(crate) def: *const CounterDef,
    pub(crate) ticks: u64,
    pub(crate) value: u64,
    pub(crate) peak: u64,
    pub(crate) resources: *mut Resource,
}

/* Both the resource hash and a counter point at a live resource record.
   The hash slot holds a direct pointer and the record points back at its
   slot and at the owning counter; the records of one counter form a doubly
   linked list. Updating a resource always updates both structures.

   Acquiring a resource that is already live means the profiler missed the
   release; the stale record is dropped with a diagnostic and acquisition
   proceeds as if the id was unknown. Releasing an id that is not in the
   table is ignored on the assumption the acquisition was never observed. */

pub(crate) struct Resource {
    pub(crate) hashslot: *mut HashSlot,
    pub(crate) prevlive: *mut Resource,
    pub(crate) nextlive: *mut Resource,
    pub(crate) counter: *mut Counter,
    pub(crate) size: u64,
}

pub(crate) struct HashSlot {
    pub(crate) resource: u64,
    pub(crate) record: *mut Resource,
}

/// Per-depth hint for consecutive pushes of similar stacks.
struct CacheEntry {
    address: u64,
    frame: *mut StackNode,
}

/// Aggregated timing statistics about trace recording itself.
#[derive(Clone, Copy, Default)]
pub struct TraceStats {
    pub ntraces: u64,
    pub sum_depth: u64,
    pub sum2_depth: u64,
    pub sum_ticks: u64,
    pub sum2_ticks: u64,
    pub sum_tperd: u64,
    pub sum2_tperd: u64,
}

impl std::ops::AddAssign<&TraceStats> for TraceStats {
    fn add_assign(&mut self, other: &TraceStats) {
        self.add(other);
    }
}

impl TraceStats {
    fn add(&mut self, other: &TraceStats) {
        self.ntraces += other.ntraces;
        self.sum_depth += other.sum_depth;
        self.sum2_depth += other.sum2_depth;
        self.sum_ticks += other.sum_ticks;
        self.sum2_ticks += other.sum2_ticks;
        self.sum_tperd += other.sum_tperd;
        self.sum2_tperd += other.sum2_tperd;
    }
}

/// Handle to a stack node inside a buffer. Only meaningful for the buffer
/// that returned it, and only until that buffer is reset or dropped.
#[derive(Clone, Copy)]
pub struct FrameRef(pub(crate) NonNull<StackNode>);

/// Handle to a counter inside a buffer, with the same validity rules as
/// [`FrameRef`].
#[derive(Clone, Copy)]
pub struct CounterRef(pub(crate) NonNull<Counter>);

/// A resizeable profile trace buffer.
///
/// Tracks interned stack traces, the profiling counters linked to each
/// stack node, and the live resources charged against those counters. The
/// lock is a raw spin lock so that it can be taken from a signal handler;
/// per-thread buffers are uncontended by construction, the shared master
/// buffer pays the spin. All memory comes from a private arena, so no
/// operation ever calls the process allocator.
pub struct ProfileBuffer {
    locked: AtomicBool,
    inner: UnsafeCell<TraceBuf>,
}

// The spin lock serialises all access to the inner data.
unsafe impl Send for ProfileBuffer {}
unsafe impl Sync for ProfileBuffer {}

impl ProfileBuffer {
    pub fn new() -> ProfileBuffer {
        ProfileBuffer::with_hash_log_size(DEFAULT_HASH_LOG_SIZE)
    }

    /// Like [`ProfileBuffer::new`] with a chosen initial resource-hash size
    /// of `2^log_size` slots. The default is generous because memory-heavy
    /// programs keep millions of live allocations.
    pub fn with_hash_log_size(log_size: u32) -> ProfileBuffer {
        ProfileBuffer {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(TraceBuf::new(log_size)),
        }
    }

    /// Take the buffer lock, spinning until it is free. Safe inside a
    /// signal handler provided the interrupted thread does not already
    /// hold this buffer's lock; the lifecycle controller guarantees that
    /// by routing signal-driven recording to per-thread buffers.
    pub fn lock(&self) -> BufferGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        BufferGuard { buffer: self }
    }

    /// Merge `other` into `self`, taking both locks. Identical call paths
    /// collapse, counters accumulate according to their kind, and live
    /// resources keep their identity.
    pub fn merge_from(&self, other: &ProfileBuffer) {
        let mut into = self.lock();
        let from = other.lock();
        into.merge_buf(&from);
    }
}

impl Default for ProfileBuffer {
    fn default() -> ProfileBuffer {
        ProfileBuffer::new()
    }
}

pub struct BufferGuard<'a> {
    buffer: &'a ProfileBuffer,
}

impl Deref for BufferGuard<'_> {
    type Target = TraceBuf;
    fn deref(&self) -> &TraceBuf {
        unsafe { &*self.buffer.inner.get() }
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut TraceBuf {
        unsafe { &mut *self.buffer.inner.get() }
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.buffer.locked.store(false, Ordering::Release);
    }
}

/// The buffer state proper; reachable only through [`ProfileBuffer::lock`].
pub struct TraceBuf {
    arena: Arena,
    hash_log_size: u32,
    hash_used: usize,
    restable: *mut HashSlot,
    callcache: *mut CacheEntry,
    resfree: *mut Resource,
    pub(crate) root: *mut StackNode,
    stats: TraceStats,
}

enum Probe {
    Found(*mut HashSlot),
    Free(*mut HashSlot),
    Full,
}

impl Drop for TraceBuf {
    fn drop(&mut self) {
        // Everything else lives in the arena; the resource hash has a
        // mapping of its own.
        Arena::unmap_raw(
            self.restable as *mut u8,
            (1usize << self.hash_log_size) * mem::size_of::<HashSlot>(),
        );
    }
}

impl TraceBuf {
    fn new(hash_log_size: u32) -> TraceBuf {
        let mut arena = Arena::new();
        // The resource hash has to be big for large-memory applications, so
        // it gets a mapping of its own instead of pool space.
        let restable =
            Arena::map_raw((1usize << hash_log_size) * mem::size_of::<HashSlot>()) as *mut HashSlot;
        let callcache =
            arena.alloc_space(MAX_DEPTH * mem::size_of::<CacheEntry>()) as *mut CacheEntry;
        let root = arena.alloc::<StackNode>();
        TraceBuf {
            arena,
            hash_log_size,
            hash_used: 0,
            restable,
            callcache,
            resfree: ptr::null_mut(),
            root,
            stats: TraceStats::default(),
        }
    }

    /// Drop all recorded data and start over with a fresh arena. The
    /// resource hash keeps its mapping but is cleared.
    pub fn reset(&mut self) {
        let log_size = self.hash_log_size;
        self.arena = Arena::new();
        unsafe {
            ptr::write_bytes(self.restable, 0, 1usize << log_size);
        }
        self.callcache =
            self.arena.alloc_space(MAX_DEPTH * mem::size_of::<CacheEntry>()) as *mut CacheEntry;
        self.root = self.arena.alloc::<StackNode>();
        self.hash_used = 0;
        self.resfree = ptr::null_mut();
        self.stats = TraceStats::default();
    }

    /// Intern a call stack and return its deepest node. `addresses` is
    /// ordered innermost frame first, the way stack walkers produce it;
    /// frames beyond [`MAX_DEPTH`] are dropped from the innermost end.
    /// An empty stack returns the root. Never fails.
    pub fn push(&mut self, addresses: &[usize]) -> FrameRef {
        self.walk(addresses.iter().rev().map(|a| *a as u64))
    }

    /// Walk the tree from the root, outermost frame first, consulting the
    /// per-depth address cache. A cache hit skips the sibling scan; a miss
    /// invalidates the deeper cache levels by flagging them stale.
    fn walk(&mut self, addresses: impl Iterator<Item = u64>) -> FrameRef {
        let cache = self.callcache;
        let mut frame = self.root;
        let mut valid = true;
        for (level, address) in addresses.take(MAX_DEPTH).enumerate() {
            let entry = unsafe { &mut *cache.add(level) };
            if valid && entry.address == address {
                frame = entry.frame;
            } else {
                frame = self.child_node(frame, address);
                let entry = unsafe { &mut *cache.add(level) };
                entry.address = address;
                entry.frame = frame;
                valid = false;
            }
        }
        FrameRef(unsafe { NonNull::new_unchecked(frame) })
    }

    /// Find or insert the child of `parent` with the given call address,
    /// keeping the sibling chain address-sorted.
    fn child_node(&mut self, parent: *mut StackNode, address: u64) -> *mut StackNode {
        unsafe {
            let mut link = &mut (*parent).children as *mut *mut StackNode;
            while !(*link).is_null() {
                let kid = *link;
                if (*kid).address == address {
                    return kid;
                }
                if (*kid).address > address {
                    break;
                }
                link = &mut (*kid).sibling as *mut *mut StackNode;
            }

            let next = *link;
            let kid = self.arena.alloc::<StackNode>();
            (*kid).address = address;
            (*kid).sibling = next;
            *link = kid;
            kid
        }
    }

    /// Tick a counter on `frame`: locate the counter for `def`, creating it
    /// if the frame still has a free counter slot, and update it according
    /// to the counter kind. Returns `None` only when the frame's counter
    /// array is full and `def` is not among them; the sample is then
    /// dropped.
    pub fn tick(
        &mut self,
        frame: FrameRef,
        def: &'static CounterDef,
        amount: u64,
        ticks: u64,
    ) -> Option<CounterRef> {
        let node = frame.0.as_ptr();
        let mut counter = ptr::null_mut();
        unsafe {
            for slot in (*node).counters.iter_mut() {
                if slot.is_null() {
                    let c = self.arena.alloc::<Counter>();
                    (*c).def = def;
                    *slot = c;
                    counter = c;
                    break;
                }
                if ptr::eq((**slot).def, def) {
                    counter = *slot;
                    break;
                }
            }
            if counter.is_null() {
                log::debug!(
                    "no counter slot left for {} on frame {:#x}, dropping sample",
                    def.name,
                    (*node).address
                );
                return None;
            }

            let c = &mut *counter;
            match def.kind {
                CounterKind::Tick => c.value += amount,
                CounterKind::Max => c.value = c.value.max(amount),
            }
            c.peak = c.peak.max(c.value);
            c.ticks += ticks;
            Some(CounterRef(NonNull::new_unchecked(counter)))
        }
    }

    /// Record acquisition of `resource` with the given size against a
    /// counter. If the id is already live the stale record is released
    /// first with a diagnostic.
    pub fn acquire(&mut self, counter: CounterRef, resource: u64, size: u64) {
        unsafe {
            if let Probe::Found(slot) = self.find_resource(resource) {
                let record = (*slot).record;
                let def = &*(*(*record).counter).def;
                log::debug!(
                    "{} resource {:#x} of {} bytes was never released, dropping stale record",
                    def.name,
                    resource,
                    (*record).size
                );
                self.release_record(slot);
            }

            let slot = loop {
                match self.find_resource(resource) {
                    Probe::Free(slot) => break slot,
                    Probe::Full => self.expand_resource_hash(),
                    // Cannot happen, any live record was just released.
                    Probe::Found(slot) => break slot,
                }
            };

            let record = if !self.resfree.is_null() {
                let r = self.resfree;
                self.resfree = (*r).nextlive;
                r
            } else {
                self.arena.alloc::<Resource>()
            };

            let ctr = counter.0.as_ptr();
            (*record).hashslot = slot;
            (*record).prevlive = ptr::null_mut();
            (*record).nextlive = (*ctr).resources;
            (*record).counter = ctr;
            (*record).size = size;
            if !(*ctr).resources.is_null() {
                (*(*ctr).resources).prevlive = record;
            }
            (*ctr).resources = record;
            (*slot).resource = resource;
            (*slot).record = record;
            self.hash_used += 1;
        }
    }

    /// Record release of `resource`. Unknown ids are ignored: the profiler
    /// simply never saw the acquisition.
    pub fn release(&mut self, resource: u64) {
        if let Probe::Found(slot) = self.find_resource(resource) {
            self.release_record(slot);
        }
    }

    /// Scan the probe window for `resource`. Reports the record slot, the
    /// first free slot usable for insertion, or exhaustion of the window.
    fn find_resource(&mut self, resource: u64) -> Probe {
        let size = 1usize << self.hash_log_size;
        let home = mix(resource) as usize;
        let mut free: *mut HashSlot = ptr::null_mut();
        for probe in 0..MAX_HASH_PROBES {
            let slot = unsafe { self.restable.add((home + probe) & (size - 1)) };
            unsafe {
                if !(*slot).record.is_null() {
                    if (*slot).resource == resource {
                        return Probe::Found(slot);
                    }
                } else if free.is_null() {
                    free = slot;
                }
            }
        }
        if free.is_null() {
            Probe::Full
        } else {
            Probe::Free(free)
        }
    }

    /// Detach a live record: deduct it from its counter, unlink it from the
    /// hash and the counter's live list, and recycle it on the free list.
    fn release_record(&mut self, slot: *mut HashSlot) {
        unsafe {
            let record = (*slot).record;
            debug_assert!(!record.is_null());
            debug_assert_eq!((*record).hashslot, slot);

            let ctr = (*record).counter;
            debug_assert!((*ctr).value >= (*record).size);
            debug_assert!((*ctr).ticks > 0);
            (*ctr).value = (*ctr).value.saturating_sub((*record).size);
            (*ctr).ticks = (*ctr).ticks.saturating_sub(1);

            let prev = (*record).prevlive;
            let next = (*record).nextlive;
            if !prev.is_null() {
                debug_assert_eq!((*prev).nextlive, record);
                (*prev).nextlive = next;
            } else {
                debug_assert_eq!((*ctr).resources, record);
                (*ctr).resources = next;
            }
            if !next.is_null() {
                debug_assert_eq!((*next).prevlive, record);
                (*next).prevlive = prev;
            }

            (*slot).resource = 0;
            (*slot).record = ptr::null_mut();
            self.hash_used -= 1;

            ptr::write_bytes(record, 0, 1);
            (*record).nextlive = self.resfree;
            self.resfree = record;
        }
    }

    /// Replace the resource hash with one four times as large, rehashing
    /// every live record. If some record cannot be placed within the probe
    /// budget of the new table, expand again immediately.
    fn expand_resource_hash(&mut self) {
        let old_size = 1usize << self.hash_log_size;
        let mut new_log = self.hash_log_size;
        'retry: loop {
            new_log += 2;
            let new_size = 1usize << new_log;
            let new_table =
                Arena::map_raw(new_size * mem::size_of::<HashSlot>()) as *mut HashSlot;
            log::debug!(
                "expanding resource hash table from 2^{} to 2^{}, {} used",
                self.hash_log_size,
                new_log,
                self.hash_used
            );
            for i in 0..old_size {
                let old_slot = unsafe { self.restable.add(i) };
                unsafe {
                    if (*old_slot).record.is_null() {
                        continue;
                    }
                    let home = mix((*old_slot).resource) as usize;
                    let mut placed = false;
                    for probe in 0..MAX_HASH_PROBES {
                        let slot = new_table.add((home + probe) & (new_size - 1));
                        if (*slot).record.is_null() {
                            (*slot).resource = (*old_slot).resource;
                            (*slot).record = (*old_slot).record;
                            (*(*slot).record).hashslot = slot;
                            placed = true;
                            break;
                        }
                    }
                    if !placed {
                        log::debug!(
                            "rehash of {:#x} failed, re-expanding another time",
                            (*old_slot).resource
                        );
                        Arena::unmap_raw(
                            new_table as *mut u8,
                            new_size * mem::size_of::<HashSlot>(),
                        );
                        continue 'retry;
                    }
                }
            }
            Arena::unmap_raw(
                self.restable as *mut u8,
                old_size * mem::size_of::<HashSlot>(),
            );
            self.restable = new_table;
            self.hash_log_size = new_log;
            return;
        }
    }

    /// Account one recorded trace in the performance statistics.
    pub fn trace_perf(&mut self, depth: usize, tstart: u64, tend: u64) {
        let dep = depth.max(1) as u64;
        let nticks = tend.wrapping_sub(tstart);
        let tperd = (nticks << 4) / dep;
        self.stats.ntraces += 1;
        self.stats.sum_depth += dep;
        self.stats.sum2_depth += dep * dep;
        self.stats.sum_ticks += nticks;
        self.stats.sum2_ticks += nticks.wrapping_mul(nticks);
        self.stats.sum_tperd += tperd;
        self.stats.sum2_tperd += tperd.wrapping_mul(tperd);
    }

    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    pub fn root(&self) -> FrameRef {
        FrameRef(unsafe { NonNull::new_unchecked(self.root) })
    }

    /// Replay every call path of `other` into `self` so that identical
    /// addresses collapse and counters accumulate by kind. Resources keep
    /// their identity by id; `peak` survives through a synthesised
    /// tick/acquire/release pulse against a sentinel id.
    pub(crate) fn merge_buf(&mut self, other: &TraceBuf) {
        let mut path = [0u64; MAX_DEPTH];
        self.merge_node(other.root, 0, &mut path);
        self.stats.add(&other.stats);
    }

    fn merge_node(&mut self, node: *const StackNode, depth: usize, path: &mut [u64; MAX_DEPTH]) {
        let frame = self.walk(path[..depth].iter().copied());
        unsafe {
            for &counter in (*node).counters.iter() {
                if counter.is_null() {
                    break;
                }
                let c = &*counter;
                let def = &*c.def;
                if c.ticks > 0 && c.resources.is_null() {
                    self.tick(frame, def, c.value, c.ticks);
                } else if c.ticks > 0 {
                    let mut r = c.resources;
                    while !r.is_null() {
                        if let Some(ctr) = self.tick(frame, def, (*r).size, 1) {
                            self.acquire(ctr, (*(*r).hashslot).resource, (*r).size);
                        }
                        r = (*r).nextlive;
                    }
                }

                // Carry the running maximum over: pulse the difference
                // through a sentinel resource so value and ticks end up
                // unchanged while peak has seen the old high-water mark.
                if c.peak > c.value {
                    let delta = c.peak - c.value;
                    if let Some(ctr) = self.tick(frame, def, delta, 1) {
                        self.acquire(ctr, PEAK_SENTINEL, delta);
                        self.release(PEAK_SENTINEL);
                    }
                }
            }

            let mut kid = (*node).children;
            while !kid.is_null() {
                debug_assert!(depth < MAX_DEPTH);
                path[depth] = (*kid).address;
                self.merge_node(kid, depth + 1, path);
                kid = (*kid).sibling;
            }
        }
    }

    /// Look up a live resource; used by tests and debug assertions.
    pub fn live_size(&mut self, resource: u64) -> Option<u64> {
        match self.find_resource(resource) {
            Probe::Found(slot) => Some(unsafe { (*(*slot).record).size }),
            _ => None,
        }
    }

    /// Counter totals for `def` summed over the whole tree, as
    /// `(ticks, value, peak, live_resources)`.
    pub fn totals(&self, def: &CounterDef) -> (u64, u64, u64, usize) {
        fn visit(
            node: *const StackNode,
            def: &CounterDef,
            acc: &mut (u64, u64, u64, usize),
        ) {
            unsafe {
                for &counter in (*node).counters.iter() {
                    if counter.is_null() {
                        break;
                    }
                    if !ptr::eq((*counter).def, def) {
                        continue;
                    }
                    acc.0 += (*counter).ticks;
                    acc.1 += (*counter).value;
                    acc.2 = acc.2.max((*counter).peak);
                    let mut r = (*counter).resources;
                    while !r.is_null() {
                        acc.3 += 1;
                        r = (*r).nextlive;
                    }
                }
                let mut kid = (*node).children;
                while !kid.is_null() {
                    visit(kid, def, acc);
                    kid = (*kid).sibling;
                }
            }
        }
        let mut acc = (0, 0, 0, 0);
        visit(self.root, def, &mut acc);
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CPU: CounterDef = CounterDef::new("CPU", CounterKind::Tick);
    static LIVE: CounterDef = CounterDef::new("MEM_LIVE", CounterKind::Tick);
    static BIGGEST: CounterDef = CounterDef::new("MEM_MAX", CounterKind::Max);

    #[test]
    fn empty_push_returns_root() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[]);
        assert_eq!(frame.0.as_ptr(), b.root().0.as_ptr());
    }

    #[test]
    fn push_interns_identical_stacks() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let f1 = b.push(&[0xc, 0xb, 0xa]);
        let f2 = b.push(&[0xc, 0xb, 0xa]);
        assert_eq!(f1.0.as_ptr(), f2.0.as_ptr());
        let f3 = b.push(&[0xd, 0xb, 0xa]);
        assert_ne!(f1.0.as_ptr(), f3.0.as_ptr());
    }

    #[test]
    fn push_at_and_past_max_depth() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let full: Vec<usize> = (1..=MAX_DEPTH).collect();
        let f1 = b.push(&full);
        // One frame deeper with the same outer levels; the extra innermost
        // frame is dropped silently.
        let over: Vec<usize> = std::iter::once(0xbeef).chain(full.iter().copied()).collect();
        let f2 = b.push(&over);
        assert_eq!(f1.0.as_ptr(), f2.0.as_ptr());
    }

    #[test]
    fn tick_accumulates_by_kind() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x30, 0x20, 0x10]);
        for _ in 0..100 {
            b.tick(frame, &CPU, 1, 1);
        }
        let (ticks, value, peak, live) = b.totals(&CPU);
        assert_eq!((ticks, value, peak, live), (100, 100, 100, 0));

        b.tick(frame, &BIGGEST, 40, 1);
        b.tick(frame, &BIGGEST, 25, 1);
        let (ticks, value, peak, _) = b.totals(&BIGGEST);
        assert_eq!((ticks, value, peak), (2, 40, 40));
    }

    #[test]
    fn counter_slots_are_bounded() {
        static D1: CounterDef = CounterDef::new("D1", CounterKind::Tick);
        static D2: CounterDef = CounterDef::new("D2", CounterKind::Tick);
        static D3: CounterDef = CounterDef::new("D3", CounterKind::Tick);
        static D4: CounterDef = CounterDef::new("D4", CounterKind::Tick);
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x1]);
        assert!(b.tick(frame, &D1, 1, 1).is_some());
        assert!(b.tick(frame, &D2, 1, 1).is_some());
        assert!(b.tick(frame, &D3, 1, 1).is_some());
        assert!(b.tick(frame, &D4, 1, 1).is_none());
        // Existing counters still reachable.
        assert!(b.tick(frame, &D2, 1, 1).is_some());
    }

    #[test]
    fn acquire_release_pairing() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        let ctr = b.tick(frame, &LIVE, 32, 1).unwrap();
        b.acquire(ctr, 0x1000, 32);
        let ctr = b.tick(frame, &LIVE, 64, 1).unwrap();
        b.acquire(ctr, 0x2000, 64);
        b.release(0x1000);

        let (ticks, value, peak, live) = b.totals(&LIVE);
        assert_eq!((ticks, value, peak, live), (1, 64, 96, 1));
        assert_eq!(b.live_size(0x2000), Some(64));
        assert_eq!(b.live_size(0x1000), None);
    }

    #[test]
    fn acquire_release_is_idempotent_up_to_ticks() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        for _ in 0..10 {
            let ctr = b.tick(frame, &LIVE, 8, 1).unwrap();
            b.acquire(ctr, 0x42, 8);
            b.release(0x42);
        }
        let (ticks, value, _, live) = b.totals(&LIVE);
        assert_eq!((ticks, value, live), (0, 0, 0));
        // Ticks net to zero because release deducts one per pairing; the
        // peak keeps the high-water mark.
        let (_, _, peak, _) = b.totals(&LIVE);
        assert_eq!(peak, 8);
    }

    #[test]
    fn double_acquire_releases_stale_record() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        let ctr = b.tick(frame, &LIVE, 10, 1).unwrap();
        b.acquire(ctr, 0x4000, 10);
        let ctr = b.tick(frame, &LIVE, 20, 1).unwrap();
        b.acquire(ctr, 0x4000, 20);

        let (ticks, value, _, live) = b.totals(&LIVE);
        assert_eq!((ticks, value, live), (1, 20, 1));
        assert_eq!(b.live_size(0x4000), Some(20));
    }

    #[test]
    fn release_of_unknown_id_is_ignored() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x1]);
        let ctr = b.tick(frame, &LIVE, 4, 1).unwrap();
        b.acquire(ctr, 0x10, 4);
        b.release(0xdead);
        let (ticks, value, _, live) = b.totals(&LIVE);
        assert_eq!((ticks, value, live), (1, 4, 1));
    }

    #[test]
    fn resource_id_zero_is_a_valid_id() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x1]);
        let ctr = b.tick(frame, &LIVE, 4, 1).unwrap();
        b.acquire(ctr, 0, 4);
        assert_eq!(b.live_size(0), Some(4));
        b.release(0);
        assert_eq!(b.live_size(0), None);
    }

    #[test]
    fn hash_expansion_keeps_all_records() {
        let buf = ProfileBuffer::with_hash_log_size(4);
        let mut b = buf.lock();
        let frame = b.push(&[0x1]);
        let n = 200u64;
        for id in 1..=n {
            let ctr = b.tick(frame, &LIVE, id, 1).unwrap();
            b.acquire(ctr, id, id);
        }
        for id in 1..=n {
            assert_eq!(b.live_size(id), Some(id), "id {id} lost in expansion");
        }
        let (ticks, value, _, live) = b.totals(&LIVE);
        assert_eq!(ticks, n);
        assert_eq!(value, n * (n + 1) / 2);
        assert_eq!(live, n as usize);
    }

    #[test]
    fn merge_accumulates_and_collapses() {
        let a = ProfileBuffer::new();
        let b = ProfileBuffer::new();
        {
            let mut ga = a.lock();
            let f = ga.push(&[0xff2, 0xff1]);
            ga.tick(f, &CPU, 3, 3);
        }
        {
            let mut gb = b.lock();
            let f = gb.push(&[0xff2, 0xff1]);
            gb.tick(f, &CPU, 5, 5);
            let f = gb.push(&[0xff3, 0xff1]);
            gb.tick(f, &CPU, 2, 2);
        }
        a.merge_from(&b);
        let ga = a.lock();
        let (ticks, value, peak, _) = ga.totals(&CPU);
        assert_eq!((ticks, value), (10, 10));
        assert!(peak >= 8);
    }

    #[test]
    fn merge_preserves_live_resources_and_peak() {
        let a = ProfileBuffer::new();
        let b = ProfileBuffer::new();
        {
            let mut gb = b.lock();
            let f = gb.push(&[0xb2, 0xb1]);
            let ctr = gb.tick(f, &LIVE, 48, 1).unwrap();
            gb.acquire(ctr, 0x9000, 48);
            let ctr = gb.tick(f, &LIVE, 16, 1).unwrap();
            gb.acquire(ctr, 0xa000, 16);
            gb.release(0x9000);
            // value 16, ticks 1, peak 64, one live resource.
        }
        a.merge_from(&b);
        let mut ga = a.lock();
        let (ticks, value, peak, live) = ga.totals(&LIVE);
        assert_eq!((ticks, value, live), (1, 16, 1));
        assert!(peak >= 64);
        assert_eq!(ga.live_size(0xa000), Some(16));
        assert_eq!(ga.live_size(0x9000), None);
        // The sentinel pulse must not leave a live record behind.
        assert_eq!(ga.live_size(u64::MAX), None);
    }

    #[test]
    fn merge_tick_totals_are_additive() {
        let a = ProfileBuffer::new();
        let b = ProfileBuffer::new();
        {
            let mut ga = a.lock();
            let f = ga.push(&[0x2, 0x1]);
            ga.tick(f, &CPU, 7, 7);
            let f = ga.push(&[0x3, 0x1]);
            ga.tick(f, &CPU, 2, 2);
        }
        {
            let mut gb = b.lock();
            let f = gb.push(&[0x9, 0x8]);
            gb.tick(f, &CPU, 4, 4);
        }
        a.merge_from(&b);
        let ga = a.lock();
        let (ticks, value, _, _) = ga.totals(&CPU);
        assert_eq!((ticks, value), (13, 13));
    }

    #[test]
    fn reset_clears_everything() {
        let buf = ProfileBuffer::new();
        let mut b = buf.lock();
        let frame = b.push(&[0x2, 0x1]);
        let ctr = b.tick(frame, &LIVE, 8, 1).unwrap();
        b.acquire(ctr, 0x77, 8);
        b.trace_perf(2, 100, 200);
        b.reset();
        let (ticks, value, peak, live) = b.totals(&LIVE);
        assert_eq!((ticks, value, peak, live), (0, 0, 0, 0));
        assert_eq!(b.live_size(0x77), None);
        assert_eq!(b.stats().ntraces, 0);
        // The buffer remains usable after reset.
        let frame = b.push(&[0x5, 0x4]);
        assert!(b.tick(frame, &LIVE, 1, 1).is_some());
    }
}
