//! x86-64 prologue decoding and branch emission.
//!
//! The decoder recognises the instruction forms that actually occur at the
//! entry of the libc and allocator functions we intercept; anything else is
//! refused and the caller gives up on that symbol. PC-relative operands
//! (rip-relative loads, 32-bit jumps) are reported as patch offsets so the
//! relocated copy keeps addressing the original locations.

use super::{Prologue, Refusal};

/// Worst-case size of one emitted long jump, including literal alignment.
pub(crate) const TRAMPOLINE_JUMP: usize = 40;
/// Room reserved for the relocated prologue; 5 bytes of branch plus margin.
pub(crate) const TRAMPOLINE_SAVED: usize = 10;
pub(crate) const TRAMPOLINE_SIZE: usize = TRAMPOLINE_JUMP + TRAMPOLINE_SAVED + TRAMPOLINE_JUMP;

/// The short branch written over the function entry.
pub(crate) const ENTRY_BRANCH: usize = 5;

/// Decode the prologue at `address` until at least [`ENTRY_BRANCH`] bytes
/// are covered.
pub(crate) unsafe fn parse_prologue(address: *const u8) -> Result<Prologue, Refusal> {
    let at = |off: usize| -> u8 { unsafe { *address.add(off) } };
    let refuse = |off: usize| -> Refusal {
        Refusal::NotRecognised {
            offset: off,
            bytes: [at(off), at(off + 1), at(off + 2), at(off + 3)],
        }
    };

    if at(0) == 0xe9 {
        // An entry jump may be a trampoline of ours: those always sit at a
        // fixed offset past their page header.
        let disp = unsafe { (address.add(1) as *const i32).read_unaligned() };
        let target = (address as usize)
            .wrapping_add(5)
            .wrapping_add(disp as isize as usize);
        if target & 0xfff == crate::trampoline::ENTRY_OFFSET {
            return Err(Refusal::AlreadyHooked);
        }
        log::debug!("{address:?}: jump instruction at entry, but not a hook target");
    }

    let mut n = 0usize;
    let mut patches = Vec::new();
    while n < ENTRY_BRANCH {
        let b0 = at(n);
        let b1 = at(n + 1);
        let b2 = at(n + 2);

        if b0 == 0x0f && b1 == 0x05 {
            n += 2; // syscall
        } else if b0 == 0x41 && (0x54..=0x57).contains(&b1) {
            n += 2; // push %r12..%r15
        } else if b0 == 0x41 && b1 == 0x89 && b2 == 0xfc {
            n += 3; // mov %edi,%r12d
        } else if b0 == 0x41 && b1 == 0xb9 {
            n += 6; // mov $imm32,%r9d
        } else if b0 == 0x48 && b1 == 0x85 && b2 == 0xf6 {
            n += 3; // test %rsi,%rsi
        } else if b0 == 0x48 && b1 == 0x63 && b2 == 0xf7 {
            n += 3; // movslq %edi,%rsi
        } else if (b0 == 0x48 || b0 == 0x4c) && b1 == 0x89 && at(n + 3) == 0x24 {
            n += 5; // mov %r*,disp8(%rsp)
        } else if b0 == 0x48 && b1 == 0x8b && (b2 == 0x3d || b2 == 0x05) {
            patches.push(n + 3); // mov disp32(%rip),%rdi / %rax
            n += 7;
        } else if b0 == 0x48 && b1 == 0xc7 && b2 == 0xc0 {
            n += 7; // mov $imm32,%rax
        } else if b0 == 0x48 && b1 == 0x81 && b2 == 0xec {
            n += 7; // sub $imm32,%rsp
        } else if b0 == 0x48 && b1 == 0x83 && b2 == 0xec {
            n += 4; // sub $imm8,%rsp
        } else if b0 == 0x48 && b1 == 0x8d && b2 == 0x05 {
            patches.push(n + 3); // lea disp32(%rip),%rax
            n += 7;
        } else if b0 == 0x48 && b1 == 0x89 {
            n += 3; // mov %r*,%r*
        } else if b0 == 0x49 && b1 == 0x89 {
            n += 3; // mov %r*,%r*
        } else if b0 == 0x4c && b1 == 0x8b && b2 == 0x0d {
            patches.push(n + 3); // mov disp32(%rip),%r9
            n += 7;
        } else if b0 == 0x4c && b1 == 0x8d && b2 == 0x3d {
            patches.push(n + 3); // lea disp32(%rip),%r15
            n += 7;
        } else if b0 == 0x55 || b0 == 0x53 {
            n += 1; // push %rbp / %rbx
        } else if b0 == 0x83 && b1 == 0xf8 {
            n += 3; // cmp $imm8,%eax
        } else if b0 == 0x89 && b1 == 0xfd {
            n += 2; // mov %edi,%ebp
        } else if b0 == 0x8d && b1 == 0x47 {
            n += 3; // lea disp8(%rdi),%eax
        } else if b0 == 0xb8 {
            n += 5; // mov $imm32,%eax
        } else if b0 == 0xe9 {
            patches.push(n + 1); // jmp rel32
            n += 5;
        } else if b0 == 0xf3 && b1 == 0x0f && b2 == 0x1e && at(n + 3) == 0xfa {
            n += 4; // endbr64
        } else {
            return Err(refuse(n));
        }
    }

    if n > TRAMPOLINE_SAVED {
        return Err(Refusal::TooLarge);
    }
    Ok(Prologue { len: n, patches })
}

/// Emit an unconstrained jump to `target`: load the absolute address
/// rip-relative into the scratch register the ABI reserves (r11) and jump
/// through it. Returns the number of bytes used.
pub(crate) unsafe fn emit_jump(at: *mut u8, target: usize) -> usize {
    unsafe {
        let start = at as usize;
        // Place the 8-byte address literal on the next 16-byte boundary
        // past the 10 instruction bytes.
        let addrloc = (start + 10 + 15) & !15;
        let mut p = at;
        *p = 0x4c; // movq disp32(%rip),%r11
        p = p.add(1);
        *p = 0x8b;
        p = p.add(1);
        *p = 0x1d;
        p = p.add(1);
        (p as *mut i32).write_unaligned((addrloc - start - 7) as i32);
        p = p.add(4);
        *p = 0x41; // jmp *%r11
        p = p.add(1);
        *p = 0xff;
        p = p.add(1);
        *p = 0xe3;
        p = p.add(1);
        while (p as usize) < addrloc {
            *p = 0x90; // nop
            p = p.add(1);
        }
        (p as *mut u64).write_unaligned(target as u64);
        p = p.add(8);
        debug_assert!(p as usize - start <= TRAMPOLINE_JUMP);
        p as usize - start
    }
}

/// Write the short entry branch over the start of the patched function and
/// pad the rest of the relocated prologue with nops.
pub(crate) unsafe fn emit_entry_branch(at: *mut u8, target: usize, prologue_len: usize) {
    unsafe {
        let rel = target.wrapping_sub(at as usize + ENTRY_BRANCH);
        debug_assert!((rel as isize as i64).abs() <= i32::MAX as i64 + 1);
        *at = 0xe9;
        (at.add(1) as *mut i32).write_unaligned(rel as i32);
        for i in ENTRY_BRANCH..prologue_len {
            *at.add(i) = 0x90; // nop
        }
    }
}

/// Fix the relocated copy so its PC-relative displacements keep their
/// absolute targets: moving an instruction by `original - saved` bytes
/// means its displacement grows by the same amount.
pub(crate) unsafe fn apply_patches(saved: *mut u8, original: *const u8, prologue: &Prologue) {
    for &offset in &prologue.patches {
        unsafe {
            let disp = saved.add(offset) as *mut i32;
            let shift = (original as isize - saved as isize) as i32;
            disp.write_unaligned(disp.read_unaligned().wrapping_add(shift));
        }
    }
}

/// Addresses reachable from `target` with the rel32 entry branch: the
/// 4 GiB-aligned window around the target, the same way the jump operand
/// wraps within it.
pub(crate) fn branch_window(target: usize) -> (usize, usize) {
    let base = target & 0xffff_ffff_0000_0000;
    (base, base + (1 << 32))
}

/// Data and instruction caches are coherent on x86-64; patched code only
/// needs the stores to have retired.
pub(crate) unsafe fn flush_icache(_address: *const u8, _len: usize) {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_frame_prologue() {
        // push %rbp; mov %rsp,%rbp; push %r12
        let code = [0x55, 0x48, 0x89, 0xe5, 0x41, 0x54, 0x00, 0x00];
        let p = unsafe { parse_prologue(code.as_ptr()) }.unwrap();
        assert_eq!(p.len, 6);
        assert!(p.patches.is_empty());
    }

    #[test]
    fn endbr_prologue() {
        // endbr64; push %rbp; mov %rsp,%rbp
        let code = [0xf3, 0x0f, 0x1e, 0xfa, 0x55, 0x48, 0x89, 0xe5];
        let p = unsafe { parse_prologue(code.as_ptr()) }.unwrap();
        assert_eq!(p.len, 5);
    }

    #[test]
    fn rip_relative_load_is_patched() {
        // mov disp32(%rip),%rax
        let code = [0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00, 0x00];
        let p = unsafe { parse_prologue(code.as_ptr()) }.unwrap();
        assert_eq!(p.len, 7);
        assert_eq!(p.patches, vec![3]);
    }

    #[test]
    fn mov_imm_eax_ret() {
        // mov $42,%eax; ret
        let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3, 0x00, 0x00];
        let p = unsafe { parse_prologue(code.as_ptr()) }.unwrap();
        assert_eq!(p.len, 5);
    }

    #[test]
    fn unknown_instruction_refuses() {
        let code = [0xcc, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90];
        match unsafe { parse_prologue(code.as_ptr()) } {
            Err(Refusal::NotRecognised { offset: 0, .. }) => {}
            other => panic!("expected refusal, got {:?}", other.map(|p| p.len)),
        }
    }

    #[test]
    fn oversized_sequence_refuses() {
        // sub $imm8,%rsp (4) followed by sub $imm32,%rsp (7): 11 > 10.
        let code = [
            0x48, 0x83, 0xec, 0x10, 0x48, 0x81, 0xec, 0x00, 0x01, 0x00, 0x00, 0x00,
        ];
        match unsafe { parse_prologue(code.as_ptr()) } {
            Err(Refusal::TooLarge) => {}
            other => panic!("expected too-large, got {:?}", other.map(|p| p.len)),
        }
    }

    #[test]
    fn emitted_jump_encodes_absolute_target() {
        let mut buf = [0u8; TRAMPOLINE_JUMP];
        let used = unsafe { emit_jump(buf.as_mut_ptr(), 0x1122_3344_5566_7788) };
        assert!(used <= TRAMPOLINE_JUMP);
        assert_eq!(&buf[0..3], &[0x4c, 0x8b, 0x1d]);
        assert_eq!(&buf[7..10], &[0x41, 0xff, 0xe3]);
        let tail = &buf[used - 8..used];
        assert_eq!(u64::from_le_bytes(tail.try_into().unwrap()), 0x1122_3344_5566_7788);
    }

    #[test]
    fn patch_preserves_absolute_target() {
        // A rip-relative load at +0 with displacement 0x100 moved 0x40
        // bytes down must end up with displacement 0x100 - 0x40.
        let original = [0x48u8, 0x8b, 0x05, 0x00, 0x01, 0x00, 0x00];
        let mut saved = original;
        let p = Prologue { len: 7, patches: vec![3] };
        unsafe {
            apply_patches(
                saved.as_mut_ptr(),
                (saved.as_ptr() as usize + 0x40) as *const u8,
                &p,
            )
        };
        let disp = i32::from_le_bytes(saved[3..7].try_into().unwrap());
        assert_eq!(disp, 0x100 + 0x40);
    }
}
