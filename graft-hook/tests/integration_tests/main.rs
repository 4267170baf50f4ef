//! End-to-end interception against synthetic functions assembled into an
//! executable page, so the decoder sees exactly the bytes we wrote and the
//! test does not disturb any real libc entry point of the test runner.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use graft_hook::{hook_at, HookError};

type IntFn = unsafe extern "C" fn() -> i32;

/// Map a page of code containing a function that returns `value`.
fn make_const_fn(value: i32) -> IntFn {
    let page = unsafe {
        libc::mmap(
            ptr::null_mut(),
            4096,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    let code = page as *mut u8;

    #[cfg(target_arch = "x86_64")]
    unsafe {
        // mov $value,%eax; ret
        *code = 0xb8;
        (code.add(1) as *mut i32).write_unaligned(value);
        *code.add(5) = 0xc3;
    }

    #[cfg(target_arch = "aarch64")]
    unsafe {
        // movz w0, #value; ret
        let movz = 0x5280_0000u32 | ((value as u32 & 0xffff) << 5);
        (code as *mut u32).write_unaligned(movz);
        (code.add(4) as *mut u32).write_unaligned(0xd65f_03c0);
        // Fresh code needs the instruction cache to notice it.
        std::arch::asm!("dsb ish", "isb");
    }

    unsafe { mem::transmute::<*mut u8, IntFn>(code) }
}

static CHAIN: AtomicUsize = AtomicUsize::new(0);
static CALLS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn add_one_replacement() -> i32 {
    CALLS.fetch_add(1, Ordering::Relaxed);
    let chain: IntFn = unsafe { mem::transmute(CHAIN.load(Ordering::Acquire)) };
    unsafe { chain() + 1 }
}

#[test]
fn intercepts_and_chains_to_the_original() {
    let target = make_const_fn(42);
    let untouched = make_const_fn(7);
    assert_eq!(unsafe { target() }, 42);

    let hook = unsafe {
        hook_at(
            "const_fn",
            target as *const (),
            add_one_replacement as *const (),
            Some(&CHAIN),
        )
    }
    .unwrap();

    // Calls are intercepted and the replacement reaches the original
    // through the chain.
    let before = CALLS.load(Ordering::Relaxed);
    assert_eq!(unsafe { target() }, 43);
    assert_eq!(unsafe { target() }, 43);
    assert_eq!(CALLS.load(Ordering::Relaxed), before + 2);

    // The chain pointer alone reproduces the original behaviour.
    let chain: IntFn = unsafe { mem::transmute(hook.chain) };
    assert_eq!(unsafe { chain() }, 42);

    // A function we never hooked is unaffected.
    assert_eq!(unsafe { untouched() }, 7);

    // Installing again finds the entry branch and refuses.
    let again = unsafe {
        hook_at(
            "const_fn",
            target as *const (),
            add_one_replacement as *const (),
            None,
        )
    };
    assert!(matches!(again, Err(HookError::PrologueNotRecognised(_))));
}
