//! Process supervisor: fork pool, kill-and-reap discipline, run loop.
//!
//! The supervisor owns the shared arena and every WorkerHandle. Workers are
//! forked (never exec'd), advance their lifecycle states through the arena,
//! and report back exclusively via exit status plus arena counters. The
//! supervisor suspends only in interruptible waits: the WNOHANG reap poll,
//! and the one-second sleeps of the escalation loop.

pub mod termination;

use std::ops::Range;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use crate::arena::{AbortReason, SharedArena};
use crate::error::SpawnError;
use crate::lifecycle::{ExitOutcome, WorkerState};
use crate::metrics::{aggregate_stressor, StressorResults};
use crate::plan::RunPlan;
use crate::registry::{capability_check, find, Args, StressorDescriptor, VerifyMode};
use crate::sched::{apply_policy, resolve_priority, DeadlineAttrs, SchedPolicy};
use crate::settings::Settings;
use crate::signals;
use crate::system::HostInfo;
use termination::{FailureAccounting, TerminationCoordinator};

/// Reap-loop knobs. The escalation thresholds are loop iterations; with the
/// one-second sleeps past the tenth iteration they approximate seconds.
#[derive(Debug, Clone, Copy)]
pub struct ReapConfig {
    /// Iterations without progress before SIGKILL, once the continue flag
    /// is clear
    pub escalate_after: u32,
    /// Iterations before the reap is abandoned with a diagnostic
    pub abandon_after: u32,
    /// Fork retries on EAGAIN/EINTR
    pub fork_retries: u32,
}

impl Default for ReapConfig {
    fn default() -> ReapConfig {
        ReapConfig {
            escalate_after: 120,
            abandon_after: 600,
            fork_retries: 10,
        }
    }
}

/// Supervisor-side record of one spawned worker.
#[derive(Debug)]
pub struct WorkerHandle<'a> {
    pub pid: Pid,
    pub instance: u32,
    pub slot: usize,
    pub descriptor: &'a StressorDescriptor,
    pub started: Instant,
    pub exit: Option<ExitOutcome>,
    pub forced_kill: bool,
    /// Last arena state observed at reap time
    pub observed_state: Option<WorkerState>,
}

/// Everything a forked worker needs, fixed before the first fork.
pub struct WorkerContext<'a> {
    pub arena: &'a SharedArena,
    pub settings: &'a Settings,
    pub sched: Option<SchedPolicy>,
    pub sched_prio: Option<i32>,
    pub aggressive: bool,
    pub deadline_attrs: Option<DeadlineAttrs>,
    pub verify: bool,
    pub end_time: Instant,
    pub page_size: usize,
}

fn is_protected_pid(pid: Pid) -> bool {
    pid.as_raw() <= 1 || pid == getpid()
}

/// Make workers the preferred OOM victims; never the supervisor.
fn oom_adjust_child() {
    let _ = std::fs::write("/proc/self/oom_score_adj", "500");
}

/// Deliver SIGALRM to the worker if the supervisor dies first, so orphaned
/// workers stop instead of running out their budget unsupervised.
fn install_parent_death_alarm() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGALRM as libc::c_ulong, 0, 0, 0);
    }
}

/// Worker process body; never returns to the caller's stack.
fn worker_main(
    descriptor: &StressorDescriptor,
    instance: u32,
    total_instances: u32,
    slot: usize,
    ctx: &WorkerContext<'_>,
    max_ops: u64,
) -> ! {
    let arena = ctx.arena;
    arena.set_worker_state(slot, WorkerState::Init);

    oom_adjust_child();
    install_parent_death_alarm();
    if let Err(e) = signals::install_fault_handlers(slot) {
        log::warn!("{}.{}: fault handlers not installed: {}", descriptor.name, instance, e);
    }

    if let Some(policy) = ctx.sched {
        // Priority validity was checked before the first fork; anything
        // failing here is host support, which is a logged no-op.
        if let Err(e) = apply_policy(
            getpid(),
            policy,
            ctx.sched_prio,
            ctx.aggressive,
            ctx.deadline_attrs,
            false,
        ) {
            log::warn!("{}.{}: sched policy not applied: {}", descriptor.name, instance, e);
        }
    }

    arena.set_worker_state(slot, WorkerState::SyncWait);
    arena.barrier_arrive_and_wait();

    if !arena.keep_running() {
        // Run was aborted before it started; nothing stressed, nothing
        // failed. Leave through the error detour so the state history
        // stays legal.
        arena.set_worker_state(slot, WorkerState::Tidy);
        arena.set_worker_state(slot, WorkerState::Deinit);
        arena.set_worker_state(slot, WorkerState::Exit);
        unsafe { libc::_exit(ExitOutcome::Success.code()) };
    }

    arena.set_worker_state(slot, WorkerState::Run);

    let verify = match descriptor.verify {
        VerifyMode::Always => true,
        VerifyMode::Optional => ctx.verify,
        VerifyMode::None => false,
    };
    let mut args = Args {
        name: descriptor.name,
        instance,
        total_instances,
        pid: getpid(),
        page_size: ctx.page_size,
        end_time: ctx.end_time,
        max_ops,
        slot,
        arena,
        settings: ctx.settings,
        verify,
    };

    let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (descriptor.entry)(&mut args)
    })) {
        Ok(outcome) => {
            arena.set_worker_state(slot, WorkerState::Stop);
            outcome
        }
        Err(_) => {
            // Tag-mismatch panics and friends land here: one failed worker,
            // never a failed supervisor.
            arena.set_worker_state(slot, WorkerState::Tidy);
            ExitOutcome::Failure
        }
    };

    arena.set_worker_state(slot, WorkerState::Deinit);
    arena.set_worker_state(slot, WorkerState::Exit);
    unsafe { libc::_exit(outcome.code()) };
}

/// SIGKILL a worker, releasing its anonymous memory promptly where the
/// kernel supports it. The errno of the kill itself is preserved.
pub fn kill_pid(pid: Pid) -> nix::Result<()> {
    if is_protected_pid(pid) {
        log::warn!("refusing to SIGKILL protected pid {}", pid);
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    {
        let pidfd = unsafe {
            libc::syscall(
                libc::SYS_pidfd_open,
                pid.as_raw() as libc::c_long,
                0 as libc::c_long,
            )
        };
        let result = kill(pid, Signal::SIGKILL);
        if pidfd >= 0 {
            if result.is_ok() {
                unsafe {
                    libc::syscall(libc::SYS_process_mrelease, pidfd, 0 as libc::c_long)
                };
            }
            unsafe { libc::close(pidfd as libc::c_int) };
        }
        result
    }

    #[cfg(not(target_os = "linux"))]
    {
        kill(pid, Signal::SIGKILL)
    }
}

/// Send a signal; SIGKILL goes through the memory-releasing path.
pub fn kill_sig(pid: Pid, sig: Signal) -> nix::Result<()> {
    if sig == Signal::SIGKILL {
        return kill_pid(pid);
    }
    if is_protected_pid(pid) {
        log::warn!("refusing to signal protected pid {}", pid);
        return Ok(());
    }
    kill(pid, sig)
}

fn record_exit(
    arena: &SharedArena,
    handle: &mut WorkerHandle<'_>,
    outcome: ExitOutcome,
    failures: &mut FailureAccounting,
) {
    handle.observed_state = arena.worker_state(handle.slot);
    handle.exit = Some(outcome);
    arena.set_worker_state(handle.slot, WorkerState::WaitComplete);
    if outcome == ExitOutcome::Failure {
        failures.record_failure(arena, handle.descriptor.name);
    }
}

/// EINTR-tolerant reap loop with SIGKILL escalation and bounded abandon.
fn reap_loop(
    arena: &SharedArena,
    handle: &mut WorkerHandle<'_>,
    config: &ReapConfig,
    failures: &mut FailureAccounting,
) {
    let mut iterations: u32 = 0;
    loop {
        match waitpid(handle.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                record_exit(arena, handle, ExitOutcome::from_code(code), failures);
                return;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // A worker dying from our own SIGKILL escalation was force
                // killed, not failed; any other fatal signal is a failure.
                let outcome = if handle.forced_kill && sig == Signal::SIGKILL {
                    log::warn!(
                        "{}.{} (pid {}) reaped after forced kill",
                        handle.descriptor.name,
                        handle.instance,
                        handle.pid
                    );
                    ExitOutcome::Success
                } else {
                    log::warn!(
                        "{}.{} (pid {}) killed by {:?}",
                        handle.descriptor.name,
                        handle.instance,
                        handle.pid,
                        sig
                    );
                    ExitOutcome::Failure
                };
                record_exit(arena, handle, outcome, failures);
                return;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                // Already reaped elsewhere; keep whatever we know.
                if handle.exit.is_none() {
                    record_exit(arena, handle, ExitOutcome::Failure, failures);
                }
                return;
            }
            Err(e) => {
                log::warn!("waitpid({}) failed: {}", handle.pid, e);
                record_exit(arena, handle, ExitOutcome::Failure, failures);
                return;
            }
        }

        iterations += 1;
        if !arena.keep_running() && iterations == config.escalate_after && !handle.forced_kill {
            log::warn!(
                "{}.{} (pid {}) ignoring stop for {} iterations, escalating to SIGKILL",
                handle.descriptor.name,
                handle.instance,
                handle.pid,
                iterations
            );
            handle.forced_kill = true;
            arena.set_force_killed();
            let _ = kill_pid(handle.pid);
        }
        if iterations >= config.abandon_after {
            log::error!(
                "{}.{} (pid {}) not reaped after {} iterations, abandoning (zombie)",
                handle.descriptor.name,
                handle.instance,
                handle.pid,
                iterations
            );
            arena.set_worker_state(handle.slot, WorkerState::Zombie);
            handle.exit = Some(ExitOutcome::Failure);
            return;
        }

        std::thread::yield_now();
        if iterations > 10 {
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// Signal one worker and reap it.
pub fn kill_and_wait(
    arena: &SharedArena,
    handle: &mut WorkerHandle<'_>,
    sig: Signal,
    config: &ReapConfig,
    failures: &mut FailureAccounting,
) -> ExitOutcome {
    if is_protected_pid(handle.pid) {
        log::warn!("kill_and_wait: protected pid {}, nothing to do", handle.pid);
        return ExitOutcome::Success;
    }
    match kill_sig(handle.pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("signalling pid {} failed: {}", handle.pid, e),
    }
    reap_loop(arena, handle, config, failures);
    handle.exit.unwrap_or(ExitOutcome::Failure)
}

/// Signal all workers first, then reap them all in shuffled order.
/// Returns the worst exit status observed.
pub fn kill_and_wait_many(
    arena: &SharedArena,
    handles: &mut [WorkerHandle<'_>],
    sig: Signal,
    config: &ReapConfig,
    failures: &mut FailureAccounting,
) -> ExitOutcome {
    let mut order: Vec<usize> = (0..handles.len())
        .filter(|&i| handles[i].exit.is_none())
        .collect();

    for &i in &order {
        match kill_sig(handles[i].pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("signalling pid {} failed: {}", handles[i].pid, e),
        }
    }

    let seed = std::process::id() as u64 ^ order.len() as u64;
    fisher_yates_shuffle(&mut order, seed);

    let mut worst = ExitOutcome::Success;
    for i in order {
        reap_loop(arena, &mut handles[i], config, failures);
        worst = worst.worst(handles[i].exit.unwrap_or(ExitOutcome::Failure));
    }
    worst
}

/// Straight Fisher-Yates over the index slice, xorshift-driven.
fn fisher_yates_shuffle<T>(items: &mut [T], mut seed: u64) {
    seed |= 1;
    for i in (1..items.len()).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let j = (seed % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

fn apply_rlimits(maximize: bool, minimize: bool) {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    if !(maximize || minimize) {
        return;
    }
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) => {
            let target = if maximize { hard } else { 64.min(soft) };
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, target, hard) {
                log::info!("rlimit NOFILE not adjusted: {}", e);
            }
        }
        Err(e) => log::info!("rlimit NOFILE not read: {}", e),
    }
}

/// End-of-run summary: per-stressor results plus global run facts.
#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<StressorResults>,
    pub outcome: ExitOutcome,
    pub force_killed: bool,
    pub abort_reason: AbortReason,
    pub elapsed: Duration,
    /// Per-slot worker state observed at reap time (before the supervisor's
    /// own WaitComplete bookkeeping overwrote the slot)
    pub final_states: Vec<Option<WorkerState>>,
}

struct StressorSlice<'a> {
    descriptor: &'a StressorDescriptor,
    instances: u32,
    max_ops: u64,
    slots: Range<usize>,
    /// Outcomes with no worker behind them (skips, spawn failures)
    extra_outcomes: Vec<ExitOutcome>,
}

/// Drives a whole run: gate, init, spawn, synchronized start, wait,
/// escalate, reap, aggregate, deinit.
pub struct Runner<'a> {
    table: &'a [StressorDescriptor],
    plan: RunPlan,
    settings: Settings,
    host: HostInfo,
    reap: ReapConfig,
}

impl<'a> Runner<'a> {
    pub fn new(table: &'a [StressorDescriptor], plan: RunPlan, settings: Settings) -> Runner<'a> {
        Runner {
            table,
            plan,
            settings,
            host: HostInfo::probe(),
            reap: ReapConfig::default(),
        }
    }

    pub fn with_reap_config(mut self, reap: ReapConfig) -> Runner<'a> {
        self.reap = reap;
        self
    }

    pub fn run(&self) -> crate::error::Result<RunSummary> {
        // An invalid explicit priority aborts before any fork.
        if let Some(policy) = self.plan.sched {
            resolve_priority(policy, self.plan.sched_prio, self.plan.aggressive)?;
        }
        apply_rlimits(self.plan.maximize, self.plan.minimize);

        // Gate stressors: capability checks and supported() hooks decide
        // which slices actually spawn.
        let mut slices: Vec<StressorSlice<'a>> = Vec::new();
        let mut next_slot = 0usize;
        for spec in &self.plan.stressors {
            let descriptor = find(self.table, &spec.name)
                .ok_or_else(|| format!("unknown stressor '{}' in plan", spec.name))?;

            let mut skip = false;
            if let Err(e) = capability_check(descriptor) {
                log::info!("{}, skipping", e);
                skip = true;
            }
            if !skip {
                if let Some(supported) = descriptor.supported {
                    if let Err(reason) = supported(descriptor.name) {
                        let reason = if reason.is_empty() {
                            descriptor.unimplemented_reason.to_string()
                        } else {
                            reason
                        };
                        log::info!("{}: not supported here ({}), skipping", spec.name, reason);
                        skip = true;
                    }
                }
            }

            if skip {
                slices.push(StressorSlice {
                    descriptor,
                    instances: spec.instances,
                    max_ops: spec.max_ops,
                    slots: next_slot..next_slot,
                    extra_outcomes: vec![ExitOutcome::NotImplemented; spec.instances as usize],
                });
            } else {
                let slots = next_slot..next_slot + spec.instances as usize;
                next_slot = slots.end;
                slices.push(StressorSlice {
                    descriptor,
                    instances: spec.instances,
                    max_ops: spec.max_ops,
                    slots,
                    extra_outcomes: Vec::new(),
                });
            }
        }

        let arena = SharedArena::new(next_slot.max(1))?;
        let coordinator = TerminationCoordinator::begin(&arena, self.plan.timeout)?;

        for slice in slices.iter().filter(|s| !s.slots.is_empty()) {
            if let Some(init) = slice.descriptor.init {
                init(slice.instances);
            }
        }

        let end_time = coordinator
            .deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 86_400));
        let ctx = WorkerContext {
            arena: &arena,
            settings: &self.settings,
            sched: self.plan.sched,
            sched_prio: self.plan.sched_prio,
            aggressive: self.plan.aggressive,
            deadline_attrs: self.plan.deadline_attrs,
            verify: self.plan.verify,
            end_time,
            page_size: self.host.page_size,
        };

        let mut handles: Vec<WorkerHandle<'a>> = Vec::with_capacity(next_slot);
        for slice in slices.iter_mut() {
            for (instance, slot) in slice.slots.clone().enumerate() {
                match spawn_worker(
                    slice.descriptor,
                    instance as u32,
                    slice.instances,
                    slot,
                    &ctx,
                    &self.reap,
                    slice.max_ops,
                ) {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        // Fork exhaustion is a resource problem, not a
                        // stressor failure.
                        log::warn!("{}.{}: {}", slice.descriptor.name, instance, e);
                        slice.extra_outcomes.push(ExitOutcome::NoResource);
                    }
                }
            }
        }

        // Synchronized start: wait for every spawned worker to reach the
        // barrier, then release them together.
        let expected = handles.len() as u32;
        let barrier_deadline = Instant::now() + Duration::from_secs(10);
        while arena.ready_workers() < expected
            && Instant::now() < barrier_deadline
            && arena.keep_running()
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        if arena.ready_workers() < expected {
            log::warn!(
                "only {}/{} workers reached the start barrier",
                arena.ready_workers(),
                expected
            );
        }
        arena.release_workers();
        let started = Instant::now();

        // Main wait: reap opportunistically until everything exited or the
        // continue flag clears.
        let mut failures = FailureAccounting::new();
        loop {
            coordinator.poll(&arena);
            let mut live = 0;
            for handle in handles.iter_mut().filter(|h| h.exit.is_none()) {
                match waitpid(handle.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => live += 1,
                    Ok(WaitStatus::Exited(_, code)) => {
                        record_exit(&arena, handle, ExitOutcome::from_code(code), &mut failures);
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        log::warn!(
                            "{}.{} (pid {}) died from {:?}",
                            handle.descriptor.name,
                            handle.instance,
                            handle.pid,
                            sig
                        );
                        record_exit(&arena, handle, ExitOutcome::Failure, &mut failures);
                    }
                    Ok(_) => live += 1,
                    Err(Errno::EINTR) => live += 1,
                    Err(e) => {
                        log::warn!("waitpid({}) failed: {}", handle.pid, e);
                        record_exit(&arena, handle, ExitOutcome::Failure, &mut failures);
                    }
                }
            }
            if live == 0 {
                break;
            }
            if !arena.keep_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Stragglers get the cooperative signal, then the escalation path.
        if handles.iter().any(|h| h.exit.is_none()) {
            kill_and_wait_many(&arena, &mut handles, Signal::SIGALRM, &self.reap, &mut failures);
        }

        let elapsed = started.elapsed();

        for slice in slices.iter().filter(|s| !s.slots.is_empty()) {
            if let Some(deinit) = slice.descriptor.deinit {
                deinit();
            }
        }

        let mut results = Vec::with_capacity(slices.len());
        for slice in &slices {
            let mut outcomes: Vec<ExitOutcome> = handles
                .iter()
                .filter(|h| slice.slots.contains(&h.slot))
                .map(|h| h.exit.unwrap_or(ExitOutcome::Failure))
                .collect();
            outcomes.extend_from_slice(&slice.extra_outcomes);
            results.push(aggregate_stressor(
                &arena,
                slice.descriptor.name,
                slice.slots.clone(),
                outcomes,
                elapsed,
            ));
        }

        let mut final_states: Vec<Option<WorkerState>> =
            (0..next_slot).map(|slot| arena.worker_state(slot)).collect();
        for handle in &handles {
            if let Some(observed) = handle.observed_state {
                final_states[handle.slot] = Some(observed);
            }
        }
        let force_killed =
            arena.force_killed() || handles.iter().any(|h| h.forced_kill);
        let outcome = ExitOutcome::aggregate(results.iter().map(|r| r.outcome()));
        let abort_reason = arena.abort_reason();

        coordinator.finish();

        Ok(RunSummary {
            results,
            outcome,
            force_killed,
            abort_reason,
            elapsed,
            final_states,
        })
    }
}

/// Fork one worker with its op budget, retrying EAGAIN/EINTR with a
/// deterministic jittered back-off. The child applies its OOM adjustment,
/// parent-death alarm and scheduling policy, then runs the entry function
/// and translates its return into `_exit`.
pub fn spawn_worker<'a>(
    descriptor: &'a StressorDescriptor,
    instance: u32,
    total_instances: u32,
    slot: usize,
    ctx: &WorkerContext<'_>,
    config: &ReapConfig,
    max_ops: u64,
) -> Result<WorkerHandle<'a>, SpawnError> {
    let mut attempt: u32 = 0;
    loop {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                return Ok(WorkerHandle {
                    pid: child,
                    instance,
                    slot,
                    descriptor,
                    started: Instant::now(),
                    exit: None,
                    forced_kill: false,
                    observed_state: None,
                });
            }
            Ok(ForkResult::Child) => {
                worker_main(descriptor, instance, total_instances, slot, ctx, max_ops);
            }
            Err(e @ (Errno::EAGAIN | Errno::EINTR)) => {
                attempt += 1;
                if attempt > config.fork_retries {
                    return Err(SpawnError::ForkFailed {
                        errno: e,
                        attempts: attempt,
                    });
                }
                let jitter_ms = (attempt * 17 + (instance % 7) * 5) as u64;
                std::thread::sleep(Duration::from_millis(jitter_ms));
            }
            Err(e) => {
                return Err(SpawnError::ForkFailed {
                    errno: e,
                    attempts: attempt + 1,
                });
            }
        }
    }
}
