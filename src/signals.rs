//! Signal plumbing for the supervisor and its workers.
//!
//! The supervisor installs SIGALRM/SIGINT/SIGTERM handlers that do nothing
//! but clear the continue flag through a single well-known static pointer to
//! the shared arena (the one process global the handlers need). Workers add
//! SIGBUS/SIGSEGV counting, and stressors that deliberately provoke faults
//! arm a fault-fixup recovery: the handler counts the fault, applies the
//! armed fixup (typically re-mapping the page) and returns, so the faulting
//! access retries and the main loop observes the count at a safe point.
//! Without an armed fixup the fault is fatal: default disposition is
//! restored and the signal re-raised, and the supervisor learns of it from
//! the wait status.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::arena::{AbortReason, SharedArena};

/// The single static pointer handlers dereference. Set once by the
/// supervisor before handlers are installed; inherited across fork.
static HANDLER_ARENA: AtomicPtr<SharedArena> = AtomicPtr::new(std::ptr::null_mut());

/// The calling worker's arena slot, set in the child after fork.
static WORKER_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Armed fault-fixup function and its argument (0 when disarmed).
static RECOVERY_FN: AtomicUsize = AtomicUsize::new(0);
static RECOVERY_ARG: AtomicUsize = AtomicUsize::new(0);

fn with_arena(f: impl FnOnce(&SharedArena)) {
    let ptr = HANDLER_ARENA.load(Ordering::Acquire);
    if !ptr.is_null() {
        // Points at the supervisor-owned arena handle, alive for the whole
        // run and at the same address in forked children.
        f(unsafe { &*ptr })
    }
}

extern "C" fn handle_alarm(_: libc::c_int) {
    with_arena(|a| a.request_stop(AbortReason::TimeBudget));
}

extern "C" fn handle_interrupt(_: libc::c_int) {
    with_arena(|a| a.request_stop(AbortReason::Interrupt));
}

extern "C" fn handle_terminate(_: libc::c_int) {
    with_arena(|a| a.request_stop(AbortReason::Terminate));
}

extern "C" fn handle_fault(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // Single relaxed atomic add: async-signal-safe fault accounting.
    let slot = WORKER_SLOT.load(Ordering::Relaxed);
    if slot != usize::MAX {
        with_arena(|a| match sig {
            libc::SIGBUS => a.sigbus_inc(slot),
            libc::SIGSEGV => a.sigsegv_inc(slot),
            _ => {}
        });
    }

    let fixup = RECOVERY_FN.load(Ordering::Acquire);
    if fixup != 0 {
        let f: fn(usize) = unsafe { std::mem::transmute(fixup) };
        f(RECOVERY_ARG.load(Ordering::Acquire));
        return;
    }

    // No recovery armed: the fault is fatal. Restore the default
    // disposition and re-raise so the wait status carries the signal.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Install a handler, returning the previous action so the caller can
/// restore it on exit. SA_SIGINFO is applied when the handler wants
/// siginfo.
pub fn install_sighandler(signal: Signal, handler: SigHandler) -> nix::Result<SigAction> {
    let flags = match handler {
        SigHandler::SigAction(_) => SaFlags::SA_SIGINFO,
        _ => SaFlags::empty(),
    };
    let action = SigAction::new(handler, flags, SigSet::empty());
    unsafe { sigaction(signal, &action) }
}

/// Restore a previously saved action.
pub fn restore_sighandler(signal: Signal, old: &SigAction) -> nix::Result<()> {
    unsafe { sigaction(signal, old).map(|_| ()) }
}

/// Point the handlers at this run's arena. Must precede handler install and
/// the first fork.
pub fn bind_arena(arena: &SharedArena) {
    HANDLER_ARENA.store(arena as *const _ as *mut _, Ordering::Release);
}

/// Forget the arena pointer once every worker has been reaped and the
/// handlers are restored.
pub fn unbind_arena() {
    HANDLER_ARENA.store(std::ptr::null_mut(), Ordering::Release);
}

/// Saved supervisor dispositions, restored when the run ends.
pub struct InstalledHandlers {
    old_alarm: SigAction,
    old_int: SigAction,
    old_term: SigAction,
}

/// Install the supervisor's termination handlers: SIGALRM (budget expiry),
/// SIGINT and SIGTERM (user stop) all clear the continue flag.
pub fn install_run_handlers(arena: &SharedArena) -> nix::Result<InstalledHandlers> {
    bind_arena(arena);
    let old_alarm = install_sighandler(Signal::SIGALRM, SigHandler::Handler(handle_alarm))?;
    let old_int = install_sighandler(Signal::SIGINT, SigHandler::Handler(handle_interrupt))?;
    let old_term = install_sighandler(Signal::SIGTERM, SigHandler::Handler(handle_terminate))?;
    Ok(InstalledHandlers {
        old_alarm,
        old_int,
        old_term,
    })
}

impl InstalledHandlers {
    /// Put the previous dispositions back and drop the arena binding.
    pub fn restore(self) {
        let _ = restore_sighandler(Signal::SIGALRM, &self.old_alarm);
        let _ = restore_sighandler(Signal::SIGINT, &self.old_int);
        let _ = restore_sighandler(Signal::SIGTERM, &self.old_term);
        unbind_arena();
    }
}

/// Worker-side setup after fork: record the slot for fault accounting and
/// install the SIGBUS/SIGSEGV counting handlers.
pub fn install_fault_handlers(slot: usize) -> nix::Result<()> {
    WORKER_SLOT.store(slot, Ordering::Relaxed);
    RECOVERY_FN.store(0, Ordering::Release);
    install_sighandler(Signal::SIGBUS, SigHandler::SigAction(handle_fault))?;
    install_sighandler(Signal::SIGSEGV, SigHandler::SigAction(handle_fault))?;
    Ok(())
}

/// Arm the fault-fixup recovery for stressors that provoke SIGBUS/SIGSEGV
/// on purpose. The fixup runs inside the handler and must stick to
/// async-signal-safe work (an mprotect/mmap of the faulting page). Returns
/// a guard that disarms on drop.
pub fn arm_recovery(fixup: fn(usize), arg: usize) -> RecoveryGuard {
    RECOVERY_ARG.store(arg, Ordering::Release);
    RECOVERY_FN.store(fixup as usize, Ordering::Release);
    RecoveryGuard { _private: () }
}

/// Disarms the fault recovery when dropped.
pub struct RecoveryGuard {
    _private: (),
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        RECOVERY_FN.store(0, Ordering::Release);
        RECOVERY_ARG.store(0, Ordering::Release);
    }
}
