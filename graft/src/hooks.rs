//! Shared plumbing for intercepted library functions.
//!
//! Every intercepted symbol keeps its chain pointer in a [`Chain`] slot;
//! the replacement stub loads it to reach the original behaviour. The
//! installer publishes the chain into the slot before the target is
//! patched, so a stub can never observe its own entry branch without the
//! chain already being visible.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Chain<F> {
    slot: AtomicUsize,
    _signature: PhantomData<F>,
}

// The slot only ever holds null or a code address.
unsafe impl<F> Sync for Chain<F> {}

impl<F: Copy> Chain<F> {
    pub(crate) const fn new() -> Chain<F> {
        Chain {
            slot: AtomicUsize::new(0),
            _signature: PhantomData,
        }
    }

    pub(crate) fn slot(&self) -> &AtomicUsize {
        &self.slot
    }

    /// The original function behind this hook. Stubs are only reachable
    /// once their entry branch is written, which happens after the chain
    /// is published; an empty slot here means memory corruption and there
    /// is nothing sensible left to do.
    pub(crate) fn get(&self) -> F {
        let raw = self.slot.load(Ordering::Acquire);
        if raw == 0 {
            std::process::abort();
        }
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        unsafe { mem::transmute_copy(&raw) }
    }
}

/// Install one hook, remembering the chain in `chain`. Failures are
/// reported to the caller, which decides whether the mode can live
/// without this symbol.
pub(crate) fn install<F: Copy>(
    function: &str,
    version: Option<&str>,
    library: Option<&str>,
    replacement: *const (),
    chain: &Chain<F>,
) -> Option<graft_hook::Hook> {
    match unsafe { graft_hook::hook_into(function, version, library, replacement, Some(chain.slot())) }
    {
        Ok(hook) => Some(hook),
        Err(err) => {
            log::debug!("failed to hook '{}': {}", function, err);
            None
        }
    }
}

/// Install on the default-resolved symbol and, when that works, also on
/// the copy a specific library exports: callers may reach either binding.
pub(crate) fn install_dual<F: Copy>(
    function: &str,
    library: &str,
    main_replacement: *const (),
    main_chain: &Chain<F>,
    lib_replacement: *const (),
    lib_chain: &Chain<F>,
) -> bool {
    let ok = install(function, None, None, main_replacement, main_chain).is_some();
    if ok {
        let _ = install(function, None, Some(library), lib_replacement, lib_chain);
    }
    ok
}

/// Declare a hook stub and its chain slot. The body function receives the
/// chain first, then the original arguments, mirroring how replacements
/// are written around the original call.
macro_rules! hook_stub {
    ($stub:ident / $chain:ident: fn($($arg:ident: $ty:ty),*) -> $ret:ty => $body:path) => {
        static $chain: crate::hooks::Chain<unsafe extern "C" fn($($ty),*) -> $ret> =
            crate::hooks::Chain::new();
        unsafe extern "C" fn $stub($($arg: $ty),*) -> $ret {
            unsafe { $body($chain.get(), $($arg),*) }
        }
    };
}

/// [`hook_stub`] twice: once for the default binding, once for the copy in
/// an explicitly named library.
macro_rules! hook_stub_dual {
    ($stub:ident + $stub2:ident / $chain:ident + $chain2:ident:
        fn($($arg:ident: $ty:ty),*) -> $ret:ty => $body:path) => {
        $crate::hooks::hook_stub!($stub / $chain: fn($($arg: $ty),*) -> $ret => $body);
        $crate::hooks::hook_stub!($stub2 / $chain2: fn($($arg: $ty),*) -> $ret => $body);
    };
}

pub(crate) use {hook_stub, hook_stub_dual};
