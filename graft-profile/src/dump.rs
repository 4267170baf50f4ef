use std::io::{self, Write};
use std::sync::atomic::Ordering;

use rustc_hash::FxHashMap;

use crate::buffer::{StackNode, TraceBuf};

/// What the symboliser knows about one instruction address.
#[derive(Clone, Debug, Default)]
pub struct SymbolInfo {
    pub symbol: Option<String>,
    pub library: Option<String>,
    pub sym_offset: i64,
    pub lib_offset: i64,
}

/// Per-dump interning state shared by every buffer written into one output
/// stream. The first occurrence of a symbol, module or counter id carries
/// its definition; later references use the bare id.
#[derive(Default)]
pub struct DumpState {
    nsyms: i32,
    nlibs: i32,
    nctrs: i32,
    // Keyed by symbol start address, so call sites within one function
    // share the id and differ only in their offset.
    syms: FxHashMap<u64, i32>,
    libs: FxHashMap<String, i32>,
}

impl DumpState {
    pub fn new() -> DumpState {
        DumpState::default()
    }
}

/// Write one buffer's call tree as text, depth first. Counter ids assigned
/// here stay in the counter definitions until [`reset_ids`] runs.
pub fn dump_tree<W: Write>(
    buf: &TraceBuf,
    out: &mut W,
    state: &mut DumpState,
    resolve: &mut dyn FnMut(u64) -> SymbolInfo,
) -> io::Result<()> {
    dump_node(buf.root, 0, out, state, resolve)
}

fn dump_node<W: Write>(
    node: *const StackNode,
    depth: usize,
    out: &mut W,
    state: &mut DumpState,
    resolve: &mut dyn FnMut(u64) -> SymbolInfo,
) -> io::Result<()> {
    unsafe {
        if depth > 0 {
            // No address at the root.
            let address = (*node).address;
            let info = resolve(address);
            let sym_start = address.wrapping_sub(info.sym_offset as u64);

            match state.syms.get(&sym_start).copied() {
                Some(id) => {
                    write!(out, "C{} FN{}+{}", depth, id, info.sym_offset)?;
                }
                None => {
                    let id = state.nsyms;
                    state.nsyms += 1;
                    state.syms.insert(sym_start, id);

                    let name = match info.symbol.as_deref() {
                        Some(s) if !s.is_empty() => s.to_owned(),
                        _ => format!("@?{:#x}", address),
                    };
                    let lib = info.library.unwrap_or_default();
                    match state.libs.get(&lib).copied() {
                        Some(lib_id) => {
                            write!(
                                out,
                                "C{} FN{}=(F{}+{} N=({}))+{}",
                                depth, id, lib_id, info.lib_offset, name, info.sym_offset
                            )?;
                        }
                        None => {
                            let lib_id = state.nlibs;
                            state.nlibs += 1;
                            write!(
                                out,
                                "C{} FN{}=(F{}=({})+{} N=({}))+{}",
                                depth, id, lib_id, lib, info.lib_offset, name, info.sym_offset
                            )?;
                            state.libs.insert(lib, lib_id);
                        }
                    }
                }
            }

            for &counter in (*node).counters.iter() {
                if counter.is_null() {
                    break;
                }
                let c = &*counter;
                if c.ticks == 0 && c.peak == 0 {
                    continue;
                }
                let def = &*c.def;
                let def_id = def.id.load(Ordering::Relaxed);
                if def_id >= 0 {
                    write!(out, " V{}:({},{},{})", def_id, c.ticks, c.value, c.peak)?;
                } else {
                    let def_id = state.nctrs;
                    state.nctrs += 1;
                    def.id.store(def_id, Ordering::Relaxed);
                    write!(
                        out,
                        " V{}=({}):({},{},{})",
                        def_id, def.name, c.ticks, c.value, c.peak
                    )?;
                }

                let mut res = c.resources;
                while !res.is_null() {
                    let resource = (*(*res).hashslot).resource;
                    match def.derived_leak_size {
                        Some(derived) => {
                            let size = derived(resource, (*res).size);
                            if size != 0 {
                                write!(out, " ;LK=({:#x},{})", resource, size)?;
                            }
                        }
                        None => {
                            write!(out, " ;LK=({:#x},{})", resource, (*res).size)?;
                        }
                    }
                    res = (*res).nextlive;
                }
            }
            writeln!(out)?;
        }

        let mut kid = (*node).children;
        while !kid.is_null() {
            dump_node(kid, depth + 1, out, state, resolve)?;
            kid = (*kid).sibling;
        }
    }
    Ok(())
}

/// Reset the output-time counter ids assigned by [`dump_tree`] so the next
/// dump starts from a clean slate.
pub fn reset_ids(buf: &TraceBuf) {
    fn visit(node: *const StackNode) {
        unsafe {
            for &counter in (*node).counters.iter() {
                if counter.is_null() {
                    break;
                }
                (*(*counter).def).id.store(-1, Ordering::Relaxed);
            }
            let mut kid = (*node).children;
            while !kid.is_null() {
                visit(kid);
                kid = (*kid).sibling;
            }
        }
    }
    visit(buf.root);
}
