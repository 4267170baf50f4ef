//! Call-tree profile buffers for in-process profilers.
//!
//! A [`ProfileBuffer`] interns every observed call stack into a tree keyed
//! by call address, attaches named counters to stack nodes, and optionally
//! tracks live resources (allocations, descriptors) against those counters
//! so leaks stay attributed to the stack that acquired them. All storage
//! comes from a private page-mapped arena, never from the process
//! allocator, which keeps the hot operations usable from allocator hooks
//! and signal handlers.
//!
//! The [`dump`] module serialises buffers into a compact interned text
//! stream; the surrounding profiler supplies the output targets and the
//! symboliser.

mod arena;
mod buffer;
pub mod dump;

pub use buffer::{
    BufferGuard, CounterDef, CounterKind, CounterRef, FrameRef, ProfileBuffer, TraceBuf,
    TraceStats, MAX_COUNTERS, MAX_DEPTH, MAX_HASH_PROBES,
};
