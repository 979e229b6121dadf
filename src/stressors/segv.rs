//! segv: deliberate fault generation with handler-side recovery.
//!
//! Maps one page PROT_NONE and writes to it. Every write traps; the armed
//! fault fixup (run inside the SIGSEGV handler) counts the fault and flips
//! the page writable, so the faulting store retries and completes. The
//! loop then re-protects the page and goes again. One bogo op per trap.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::lifecycle::ExitOutcome;
use crate::registry::{Args, ClassMask, StressorDescriptor, VerifyMode};
use crate::signals;

static PAGE_LEN: AtomicUsize = AtomicUsize::new(4096);

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "segv",
    class: ClassMask(ClassMask::VM.0 | ClassMask::INTERRUPT.0),
    options: &[],
    help: "provoke and recover from SIGSEGV page faults",
    entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::Optional,
    capability: None,
    unimplemented_reason: "",
};

/// Runs inside the SIGSEGV handler: make the page writable again so the
/// trapped store can retry. mprotect only, nothing that allocates.
fn unprotect_page(addr: usize) {
    unsafe {
        libc::mprotect(
            addr as *mut libc::c_void,
            PAGE_LEN.load(Ordering::Relaxed),
            libc::PROT_READ | libc::PROT_WRITE,
        );
    }
}

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let page_len = args.page_size.max(4096);
    PAGE_LEN.store(page_len, Ordering::Relaxed);

    let length = NonZeroUsize::new(page_len).expect("page size is never zero");
    let page = match unsafe {
        mmap_anonymous(
            None,
            length,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    } {
        Ok(ptr) => ptr,
        Err(e) => {
            log::warn!("segv.{}: mmap failed: {}", args.instance, e);
            return ExitOutcome::NoResource;
        }
    };
    let addr = page.as_ptr() as usize;

    let faults_before = args.arena.sigsegv(args.slot);
    let _recovery = signals::arm_recovery(unprotect_page, addr);

    while args.keep_stressing() {
        // The store traps on the protected page; the handler unprotects it
        // and the store retries.
        unsafe { std::ptr::write_volatile(addr as *mut u8, 0x5a) };
        args.bogo_inc();
        unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                page_len,
                libc::PROT_NONE,
            );
        }
    }

    drop(_recovery);
    if let Err(e) = unsafe { munmap(page, page_len) } {
        log::warn!("segv.{}: munmap failed: {}", args.instance, e);
    }

    if args.verify {
        // Exactly one trap per bogo op
        let faults = args.arena.sigsegv(args.slot) - faults_before;
        if faults != args.bogo() {
            log::warn!(
                "segv.{}: {} faults for {} ops",
                args.instance,
                faults,
                args.bogo()
            );
            return ExitOutcome::Failure;
        }
    }
    ExitOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    // The faulting loop itself only runs inside a forked worker (the
    // integration suite covers it); in-process we only check the static
    // plumbing.

    #[test]
    fn test_page_len_static_follows_args() {
        PAGE_LEN.store(8192, Ordering::Relaxed);
        assert_eq!(PAGE_LEN.load(Ordering::Relaxed), 8192);
        PAGE_LEN.store(4096, Ordering::Relaxed);
    }

    #[test]
    fn test_descriptor_shape() {
        assert_eq!(DESCRIPTOR.name, "segv");
        assert!(DESCRIPTOR.class.contains(ClassMask::INTERRUPT));
        assert_eq!(DESCRIPTOR.verify, VerifyMode::Optional);
    }
}
