use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::*;
    } else {
        compile_error!("function interception is not supported on this architecture");
    }
}

/// A decoded function prologue: how many leading bytes can be relocated
/// into a trampoline, and where PC-relative 32-bit displacements sit inside
/// that window (byte offsets; empty on architectures that refuse
/// PC-relative prologues outright).
pub(crate) struct Prologue {
    pub(crate) len: usize,
    pub(crate) patches: Vec<usize>,
}

/// Why a prologue cannot be relocated.
#[derive(Debug)]
pub(crate) enum Refusal {
    /// The decoder met an instruction it does not understand.
    NotRecognised { offset: usize, bytes: [u8; 4] },
    /// The decoded sequence does not fit the trampoline's saved region.
    TooLarge,
    /// The entry already branches into a trampoline of ours.
    AlreadyHooked,
}
