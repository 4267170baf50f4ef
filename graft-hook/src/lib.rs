//! In-process function interception.
//!
//! [`hook`] replaces the prologue of a resolved symbol with a branch into a
//! freshly mapped trampoline page. The trampoline forwards every call to a
//! user-supplied replacement function and keeps the relocated original
//! prologue callable through a stable `chain` pointer, so the replacement
//! can still reach the unmodified behaviour:
//!
//! | Trampoline region | Contents |
//! |---|---|
//! | entry | unconditional jump to the replacement |
//! | saved prologue | the original first bytes, PC-relative operands rewritten |
//! | re-entry | jump to the original function past the saved bytes |
//!
//! Hooks cannot be removed; both the patched entry and the trampoline page
//! live for the rest of the process. Installation is not atomic with
//! respect to other threads calling the target at that exact moment; the
//! patch is a handful of byte stores and the race is accepted.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

mod arch;
mod resolve;
mod trampoline;

/// Why a hook could not be installed. No partial installation is left
/// behind on any of these.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook options {0:#x} are not supported")]
    BadOptions(u32),
    #[error("library '{0}' not found")]
    LibraryNotFound(String),
    #[error("symbol '{0}' not found in library '{1}'")]
    SymbolNotFoundInLibrary(String, String),
    #[error("symbol '{0}' not found in main program")]
    SymbolNotFound(String),
    #[error("prologue of '{0}' not recognised")]
    PrologueNotRecognised(String),
    #[error("prologue of '{0}' too large to relocate")]
    PrologueTooLarge(String),
    #[error("cannot change memory protection at {0:#x}")]
    MemoryProtection(usize),
    #[error("cannot allocate a trampoline reachable from {0:#x}")]
    AllocateTrampoline(usize),
}

/// An installed hook.
pub struct Hook {
    /// Resolved address of the target function.
    pub original: *const (),
    /// Entry of the relocated prologue: calling this runs the original
    /// function as if it had never been patched.
    pub chain: *const (),
    /// The trampoline code page.
    pub trampoline: *mut u8,
}

unsafe impl Send for Hook {}
unsafe impl Sync for Hook {}

/// Install a hook on `(function, version?, library?)`, redirecting calls to
/// `replacement`. The replacement must have the exact ABI of the target.
///
/// # Safety
///
/// `replacement` is entered on every future call of the target, from any
/// thread, with the target's arguments; it must be `extern "C"` with a
/// matching signature and must not unwind.
pub unsafe fn hook(
    function: &str,
    version: Option<&str>,
    library: Option<&str>,
    replacement: *const (),
) -> Result<Hook, HookError> {
    unsafe { hook_into(function, version, library, replacement, None) }
}

/// Like [`hook`], but publishes the chain pointer into `chain_slot` before
/// the target is patched. Replacements that load their chain from a shared
/// slot need this ordering: once the entry branch is visible, the chain
/// must already be there.
///
/// # Safety
///
/// See [`hook`].
pub unsafe fn hook_into(
    function: &str,
    version: Option<&str>,
    library: Option<&str>,
    replacement: *const (),
    chain_slot: Option<&AtomicUsize>,
) -> Result<Hook, HookError> {
    unsafe { hook_with_options(function, version, library, replacement, 0, chain_slot) }
}

/// Full-control variant. `options` is reserved for future call-vs-jump and
/// counting variations; only zero is accepted today.
///
/// # Safety
///
/// See [`hook`].
pub unsafe fn hook_with_options(
    function: &str,
    version: Option<&str>,
    library: Option<&str>,
    replacement: *const (),
    options: u32,
    chain_slot: Option<&AtomicUsize>,
) -> Result<Hook, HookError> {
    if options != 0 {
        return Err(HookError::BadOptions(options));
    }
    let original = resolve::lookup(function, version, library)?;
    unsafe { install(function, original, replacement, chain_slot) }
}

/// Install on an already-resolved target address instead of a symbol name.
///
/// # Safety
///
/// `address` must be the entry of a function with at least one page of
/// valid code behind it, and the constraints of [`hook`] apply.
pub unsafe fn hook_at(
    name: &str,
    address: *const (),
    replacement: *const (),
    chain_slot: Option<&AtomicUsize>,
) -> Result<Hook, HookError> {
    unsafe { install(name, address as usize, replacement, chain_slot) }
}

unsafe fn install(
    function: &str,
    original: usize,
    replacement: *const (),
    chain_slot: Option<&AtomicUsize>,
) -> Result<Hook, HookError> {

    let prologue = unsafe { arch::parse_prologue(original as *const u8) }.map_err(|refusal| {
        match refusal {
            arch::Refusal::AlreadyHooked => {
                log::debug!("{} ({:#x}): hook already installed, ignoring", function, original);
                HookError::PrologueNotRecognised(function.into())
            }
            arch::Refusal::NotRecognised { offset, bytes } => {
                log::debug!(
                    "{} ({:#x}) + {:#x}: unrecognised prologue (found {:02x} {:02x} {:02x} {:02x})",
                    function,
                    original,
                    offset,
                    bytes[0],
                    bytes[1],
                    bytes[2],
                    bytes[3]
                );
                HookError::PrologueNotRecognised(function.into())
            }
            arch::Refusal::TooLarge => HookError::PrologueTooLarge(function.into()),
        }
    })?;

    let tramp = trampoline::allocate(original)?;

    log::debug!(
        "{} ({:#x}): relocating {} bytes into {:?}",
        function,
        original,
        prologue.len,
        tramp
    );

    let chain = unsafe {
        // Entry region: jump to the replacement.
        let mut cursor = tramp;
        cursor = cursor.add(arch::emit_jump(cursor, replacement as usize));

        // Saved prologue, with PC-relative operands kept pointing home.
        let chain = cursor;
        ptr::copy_nonoverlapping(original as *const u8, cursor, prologue.len);
        arch::apply_patches(cursor, original as *const u8, &prologue);
        cursor = cursor.add(prologue.len);

        // Re-entry: continue in the original past the relocated bytes.
        arch::emit_jump(cursor, original + prologue.len);
        chain
    };

    // Publish the chain before any thread can reach the replacement.
    if let Some(slot) = chain_slot {
        slot.store(chain as usize, Ordering::Release);
    }

    if let Err(err) = trampoline::protect(original, true) {
        trampoline::release(tramp);
        return Err(err);
    }
    unsafe {
        arch::emit_entry_branch(original as *mut u8, tramp as usize, prologue.len);
    }
    let _ = trampoline::protect(original, false);
    unsafe {
        arch::flush_icache(tramp, arch::TRAMPOLINE_SIZE);
        arch::flush_icache(original as *const u8, prologue.len);
    }

    Ok(Hook {
        original: original as *const (),
        chain: chain as *const (),
        trampoline: tramp,
    })
}
