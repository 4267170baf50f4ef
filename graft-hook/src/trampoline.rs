//! Trampoline page management.
//!
//! Every hook gets a page of its own, mapped read/write/execute at an
//! address the target's single-instruction entry branch can reach. The
//! page starts with one header word holding the mapping size; the
//! trampoline code begins right behind it, which also gives hooked entry
//! points a recognisable target alignment.

use std::fs;

use crate::arch;
use crate::HookError;

/// Offset of the trampoline entry within its page.
pub(crate) const ENTRY_OFFSET: usize = std::mem::size_of::<usize>();

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Find the first free page at or above `target` that the entry branch can
/// still reach. `/proc/self/maps` lists regions sorted by address, so one
/// forward scan pushes the candidate past every mapping that contains it.
fn free_page_near(target: usize) -> Option<usize> {
    let (window_lo, window_hi) = arch::branch_window(target);
    let mut candidate = target + 1;

    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let range = line.split_whitespace().next()?;
        let (low, high) = range.split_once('-')?;
        let low = usize::from_str_radix(low, 16).ok()?;
        let high = usize::from_str_radix(high, 16).ok()?;
        if low >= window_lo && low < window_hi && (low..high).contains(&candidate) {
            candidate = high;
        }
    }

    if candidate >= window_lo && candidate + page_size() <= window_hi {
        Some(candidate)
    } else {
        None
    }
}

/// Map one executable page near `target` and return the trampoline start
/// inside it. The page is never unmapped once a hook is installed; hooks
/// live for the rest of the process.
pub(crate) fn allocate(target: usize) -> Result<*mut u8, HookError> {
    let size = page_size();
    let near = free_page_near(target).ok_or(HookError::AllocateTrampoline(target))?;
    let page = unsafe {
        libc::mmap(
            near as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if page == libc::MAP_FAILED {
        log::debug!(
            "trampoline mmap at {:#x} failed: {}",
            near,
            std::io::Error::last_os_error()
        );
        return Err(HookError::AllocateTrampoline(target));
    }
    unsafe {
        *(page as *mut usize) = size;
        Ok((page as *mut u8).add(ENTRY_OFFSET))
    }
}

/// Release a trampoline page again; only used when a later installation
/// step fails.
pub(crate) fn release(trampoline: *mut u8) {
    unsafe {
        let page = trampoline.sub(ENTRY_OFFSET);
        let size = *(page as *const usize);
        libc::munmap(page as *mut libc::c_void, size);
    }
}

/// Toggle the executable page under `address` writable and back.
pub(crate) fn protect(address: usize, writable: bool) -> Result<(), HookError> {
    let size = page_size();
    let page = address & !(size - 1);
    // The patch may straddle a page boundary; cover the next page too.
    let span = if address + arch::TRAMPOLINE_SAVED > page + size {
        size * 2
    } else {
        size
    };
    let mut prot = libc::PROT_READ | libc::PROT_EXEC;
    if writable {
        prot |= libc::PROT_WRITE;
    }
    let rc = unsafe { libc::mprotect(page as *mut libc::c_void, span, prot) };
    if rc != 0 {
        log::debug!(
            "mprotect({:#x}, {}, {:#x}) failed: {}",
            page,
            span,
            prot,
            std::io::Error::last_os_error()
        );
        return Err(HookError::MemoryProtection(address));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_page_is_reachable_and_executable_mapped() {
        // Use this function's own address as the anchor; the scan must
        // come back with a page in branch range.
        let target = allocated_page_is_reachable_and_executable_mapped as usize;
        let tramp = allocate(target).unwrap();
        let (lo, hi) = arch::branch_window(target);
        assert!((tramp as usize) >= lo && (tramp as usize) < hi);
        assert_eq!(tramp as usize % page_size(), ENTRY_OFFSET);
        unsafe {
            // Writable and readable right away.
            std::ptr::write_bytes(tramp, 0xc3, 16);
            assert_eq!(*tramp, 0xc3);
        }
        release(tramp);
    }

    #[test]
    fn free_page_is_not_inside_an_existing_mapping() {
        let target = free_page_is_not_inside_an_existing_mapping as usize;
        let page = free_page_near(target).unwrap();
        let maps = fs::read_to_string("/proc/self/maps").unwrap();
        for line in maps.lines() {
            let range = line.split_whitespace().next().unwrap();
            let (low, high) = range.split_once('-').unwrap();
            let low = usize::from_str_radix(low, 16).unwrap();
            let high = usize::from_str_radix(high, 16).unwrap();
            assert!(
                page < low || page >= high,
                "candidate {page:#x} collides with {line}"
            );
        }
    }
}
