//! Process-shared memory arena.
//!
//! One anonymous MAP_SHARED region created by the supervisor before the
//! first fork and inherited by every worker at the same virtual address.
//! It carries the global continue flag, per-worker state bytes, bogo-op and
//! fault counters, named-metric slots and a small lock region.
//!
//! Access rules:
//! - each worker writes only its own slots, with relaxed stores
//! - the continue flag pairs release stores with acquire loads, so a worker
//!   observing `continue == false` has also observed all prior supervisor
//!   writes
//! - the force-killed flag is write-once by the supervisor
//! - the report lock is a bounded-spin-then-yield cross-process spinlock

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::ArenaError;
use crate::lifecycle::WorkerState;
use crate::metrics::Combine;

/// Named-metric slots per worker (K).
pub const METRICS_PER_WORKER: usize = 8;

/// Inline metric label capacity; longer labels are truncated.
pub const METRIC_LABEL_LEN: usize = 24;

const CACHE_LINE: usize = 64;

/// Why the continue flag was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    None = 0,
    TimeBudget = 1,
    Interrupt = 2,
    Terminate = 3,
    FailureThreshold = 4,
}

impl AbortReason {
    pub fn from_u8(raw: u8) -> AbortReason {
        match raw {
            1 => AbortReason::TimeBudget,
            2 => AbortReason::Interrupt,
            3 => AbortReason::Terminate,
            4 => AbortReason::FailureThreshold,
            _ => AbortReason::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::None => "none",
            AbortReason::TimeBudget => "time budget expired",
            AbortReason::Interrupt => "interrupted (SIGINT)",
            AbortReason::Terminate => "terminated (SIGTERM)",
            AbortReason::FailureThreshold => "stressor failure threshold",
        }
    }
}

#[repr(C, align(64))]
struct ArenaHeader {
    keep_running: AtomicBool,
    force_killed: AtomicBool,
    start: AtomicBool,
    abort_reason: AtomicU8,
    ready_count: AtomicU32,
    abort_count: AtomicU32,
}

#[repr(C, align(64))]
struct StateSlot {
    state: AtomicU8,
}

#[repr(C, align(64))]
struct CounterSlot {
    bogo: AtomicU64,
    sigbus: AtomicU64,
    sigsegv: AtomicU64,
}

#[repr(C)]
struct MetricSlot {
    bits: AtomicU64,
    combine: AtomicU8,
    set: AtomicU8,
    label: [AtomicU8; METRIC_LABEL_LEN],
}

#[repr(C, align(64))]
struct LockRegion {
    report_lock: AtomicBool,
}

/// A named metric read back from a worker slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub label: String,
    pub value: f64,
    pub combine: Combine,
}

/// Handle to the shared region. Owned by the supervisor; workers access it
/// through the same inherited mapping, indexed by their instance slot.
pub struct SharedArena {
    base: NonNull<u8>,
    len: usize,
    workers: usize,
}

// The region is nothing but atomics; slot ownership is the protocol.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

impl SharedArena {
    fn states_offset() -> usize {
        round_up(std::mem::size_of::<ArenaHeader>(), CACHE_LINE)
    }

    fn counters_offset(workers: usize) -> usize {
        Self::states_offset() + workers * std::mem::size_of::<StateSlot>()
    }

    fn metrics_offset(workers: usize) -> usize {
        Self::counters_offset(workers) + workers * std::mem::size_of::<CounterSlot>()
    }

    fn lock_offset(workers: usize) -> usize {
        round_up(
            Self::metrics_offset(workers)
                + workers * METRICS_PER_WORKER * std::mem::size_of::<MetricSlot>(),
            CACHE_LINE,
        )
    }

    fn total_len(workers: usize) -> usize {
        round_up(
            Self::lock_offset(workers) + std::mem::size_of::<LockRegion>(),
            CACHE_LINE,
        )
    }

    /// Map a zeroed shared region sized for `workers` slots and initialize
    /// the global flags. Must happen before the first fork.
    pub fn new(workers: usize) -> Result<SharedArena, ArenaError> {
        let len = Self::total_len(workers.max(1));
        let length = NonZeroUsize::new(len).expect("arena length is never zero");

        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(ArenaError::MapFailed)?;

        let arena = SharedArena {
            base: base.cast(),
            len,
            workers,
        };

        // The mapping arrives zeroed; only the continue flag needs a
        // non-zero initial state.
        arena.header().keep_running.store(true, Ordering::Release);
        Ok(arena)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    fn state_slot(&self, index: usize) -> &StateSlot {
        debug_assert!(index < self.workers);
        unsafe {
            &*(self
                .base
                .as_ptr()
                .add(Self::states_offset() + index * std::mem::size_of::<StateSlot>())
                as *const StateSlot)
        }
    }

    fn counter_slot(&self, index: usize) -> &CounterSlot {
        debug_assert!(index < self.workers);
        unsafe {
            &*(self
                .base
                .as_ptr()
                .add(Self::counters_offset(self.workers) + index * std::mem::size_of::<CounterSlot>())
                as *const CounterSlot)
        }
    }

    fn metric_slot(&self, index: usize, id: usize) -> &MetricSlot {
        debug_assert!(index < self.workers && id < METRICS_PER_WORKER);
        unsafe {
            &*(self.base.as_ptr().add(
                Self::metrics_offset(self.workers)
                    + (index * METRICS_PER_WORKER + id) * std::mem::size_of::<MetricSlot>(),
            ) as *const MetricSlot)
        }
    }

    fn lock_region(&self) -> &LockRegion {
        unsafe { &*(self.base.as_ptr().add(Self::lock_offset(self.workers)) as *const LockRegion) }
    }

    fn check_slot(&self, index: usize) -> Result<(), ArenaError> {
        if index >= self.workers {
            return Err(ArenaError::SlotOutOfRange {
                index,
                capacity: self.workers,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Global flags
    // ------------------------------------------------------------------

    /// Cooperative cancellation check, polled by every worker iteration.
    pub fn keep_running(&self) -> bool {
        self.header().keep_running.load(Ordering::Acquire)
    }

    /// Clear the continue flag, recording the first abort reason.
    ///
    /// Async-signal-safe: two atomic operations, no allocation.
    pub fn request_stop(&self, reason: AbortReason) {
        let _ = self.header().abort_reason.compare_exchange(
            AbortReason::None as u8,
            reason as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.header().abort_count.fetch_add(1, Ordering::Relaxed);
        self.header().keep_running.store(false, Ordering::Release);
    }

    pub fn abort_reason(&self) -> AbortReason {
        AbortReason::from_u8(self.header().abort_reason.load(Ordering::Relaxed))
    }

    /// Write-once by the supervisor when SIGKILL escalation was needed.
    pub fn set_force_killed(&self) {
        self.header().force_killed.store(true, Ordering::Release);
    }

    pub fn force_killed(&self) -> bool {
        self.header().force_killed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Start barrier
    // ------------------------------------------------------------------

    /// Worker side: publish arrival, then park until the supervisor releases
    /// the barrier (or the run is aborted before it starts).
    pub fn barrier_arrive_and_wait(&self) {
        let header = self.header();
        header.ready_count.fetch_add(1, Ordering::AcqRel);

        let mut spins: u32 = 0;
        while !header.start.load(Ordering::Acquire) {
            if !self.keep_running() {
                return;
            }
            spins = spins.saturating_add(1);
            if spins < 1_000 {
                std::hint::spin_loop();
            } else if spins < 10_000 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }

    /// Supervisor side: how many workers have reached the barrier.
    pub fn ready_workers(&self) -> u32 {
        self.header().ready_count.load(Ordering::Acquire)
    }

    /// Supervisor side: release every worker parked on the barrier.
    pub fn release_workers(&self) {
        self.header().start.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Worker state slots
    // ------------------------------------------------------------------

    /// Worker publishes its own state (relaxed store into its own slot).
    pub fn set_worker_state(&self, index: usize, state: WorkerState) {
        if index < self.workers {
            self.state_slot(index).state.store(state as u8, Ordering::Relaxed);
        }
    }

    /// Supervisor reads a worker's last published state.
    pub fn worker_state(&self, index: usize) -> Option<WorkerState> {
        if index >= self.workers {
            return None;
        }
        WorkerState::from_u8(self.state_slot(index).state.load(Ordering::Relaxed))
    }

    // ------------------------------------------------------------------
    // Bogo-op and fault counters
    // ------------------------------------------------------------------

    /// Hot-path increment of a worker's bogo counter.
    #[inline]
    pub fn bogo_add(&self, index: usize, n: u64) {
        self.counter_slot(index).bogo.fetch_add(n, Ordering::Relaxed);
    }

    /// Absolute overwrite of a worker's bogo counter.
    pub fn bogo_set(&self, index: usize, n: u64) {
        self.counter_slot(index).bogo.store(n, Ordering::Relaxed);
    }

    pub fn bogo(&self, index: usize) -> u64 {
        self.counter_slot(index).bogo.load(Ordering::Relaxed)
    }

    /// Sum of bogo counters over a slot range (one stressor's instances).
    pub fn bogo_sum(&self, slots: std::ops::Range<usize>) -> u64 {
        slots.map(|i| self.bogo(i)).sum()
    }

    /// Async-signal-safe fault accounting (single relaxed add).
    #[inline]
    pub fn sigbus_inc(&self, index: usize) {
        self.counter_slot(index).sigbus.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn sigsegv_inc(&self, index: usize) {
        self.counter_slot(index).sigsegv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sigbus(&self, index: usize) -> u64 {
        self.counter_slot(index).sigbus.load(Ordering::Relaxed)
    }

    pub fn sigsegv(&self, index: usize) -> u64 {
        self.counter_slot(index).sigsegv.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Named metrics
    // ------------------------------------------------------------------

    /// Publish a named metric into the worker's slot. Last write wins within
    /// a worker; the label is truncated to [`METRIC_LABEL_LEN`] bytes.
    pub fn metric_set(
        &self,
        index: usize,
        id: usize,
        label: &str,
        value: f64,
        combine: Combine,
    ) -> Result<(), ArenaError> {
        self.check_slot(index)?;
        if id >= METRICS_PER_WORKER {
            return Err(ArenaError::MetricOutOfRange {
                id,
                k: METRICS_PER_WORKER,
            });
        }

        let slot = self.metric_slot(index, id);
        let bytes = label.as_bytes();
        for (i, cell) in slot.label.iter().enumerate() {
            cell.store(bytes.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
        slot.bits.store(value.to_bits(), Ordering::Relaxed);
        slot.combine.store(combine as u8, Ordering::Relaxed);
        slot.set.store(1, Ordering::Release);
        Ok(())
    }

    /// Read back a worker's metric slot. The supervisor only calls this
    /// after the worker has been reaped, so the read happens-after every
    /// worker write.
    pub fn metric_get(&self, index: usize, id: usize) -> Option<MetricSample> {
        if index >= self.workers || id >= METRICS_PER_WORKER {
            return None;
        }
        let slot = self.metric_slot(index, id);
        if slot.set.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut label = Vec::with_capacity(METRIC_LABEL_LEN);
        for cell in slot.label.iter() {
            let b = cell.load(Ordering::Relaxed);
            if b == 0 {
                break;
            }
            label.push(b);
        }
        Some(MetricSample {
            label: String::from_utf8_lossy(&label).into_owned(),
            value: f64::from_bits(slot.bits.load(Ordering::Relaxed)),
            combine: Combine::from_u8(slot.combine.load(Ordering::Relaxed)),
        })
    }

    // ------------------------------------------------------------------
    // Report lock
    // ------------------------------------------------------------------

    /// Cross-process spinlock serializing report output blocks. Bounded spin
    /// then yield; callers hold it only across a handful of writes.
    pub fn lock_report(&self) -> ReportLockGuard<'_> {
        let lock = &self.lock_region().report_lock;
        let mut spins: u32 = 0;
        while lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.saturating_add(1);
            if spins < 1_000 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        ReportLockGuard { arena: self }
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        // Released only after all workers have been reaped.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            log::warn!("munmap of shared arena failed: {}", e);
        }
    }
}

/// Holds the cross-process report lock; released on drop.
pub struct ReportLockGuard<'a> {
    arena: &'a SharedArena,
}

impl Drop for ReportLockGuard<'_> {
    fn drop(&mut self) {
        self.arena
            .lock_region()
            .report_lock
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_arena_starts_running_and_clean() {
        let arena = SharedArena::new(4).unwrap();
        assert!(arena.keep_running());
        assert!(!arena.force_killed());
        assert_eq!(arena.abort_reason(), AbortReason::None);
        assert_eq!(arena.ready_workers(), 0);
        for i in 0..4 {
            assert_eq!(arena.bogo(i), 0);
            assert_eq!(arena.metric_get(i, 0), None);
        }
    }

    #[test]
    fn test_request_stop_records_first_reason() {
        let arena = SharedArena::new(1).unwrap();
        arena.request_stop(AbortReason::TimeBudget);
        arena.request_stop(AbortReason::Interrupt);
        assert!(!arena.keep_running());
        assert_eq!(arena.abort_reason(), AbortReason::TimeBudget);
    }

    #[test]
    fn test_force_killed_persists() {
        let arena = SharedArena::new(1).unwrap();
        arena.set_force_killed();
        arena.request_stop(AbortReason::TimeBudget);
        assert!(arena.force_killed());
    }

    #[test]
    fn test_worker_state_roundtrip() {
        let arena = SharedArena::new(2).unwrap();
        arena.set_worker_state(0, WorkerState::Run);
        arena.set_worker_state(1, WorkerState::SyncWait);
        assert_eq!(arena.worker_state(0), Some(WorkerState::Run));
        assert_eq!(arena.worker_state(1), Some(WorkerState::SyncWait));
        assert_eq!(arena.worker_state(2), None);
    }

    #[test]
    fn test_bogo_counters_are_independent() {
        let arena = SharedArena::new(3).unwrap();
        arena.bogo_add(0, 5);
        arena.bogo_add(0, 5);
        arena.bogo_add(1, 7);
        arena.bogo_set(2, 100);
        assert_eq!(arena.bogo(0), 10);
        assert_eq!(arena.bogo(1), 7);
        assert_eq!(arena.bogo(2), 100);
        assert_eq!(arena.bogo_sum(0..3), 117);
    }

    #[test]
    fn test_metric_roundtrip_and_truncation() {
        let arena = SharedArena::new(1).unwrap();
        arena
            .metric_set(0, 2, "ops-per-sec", 123.5, Combine::HarmonicMean)
            .unwrap();
        let m = arena.metric_get(0, 2).unwrap();
        assert_eq!(m.label, "ops-per-sec");
        assert_eq!(m.value, 123.5);
        assert_eq!(m.combine, Combine::HarmonicMean);

        let long = "x".repeat(2 * METRIC_LABEL_LEN);
        arena.metric_set(0, 3, &long, 1.0, Combine::Sum).unwrap();
        assert_eq!(arena.metric_get(0, 3).unwrap().label.len(), METRIC_LABEL_LEN);
    }

    #[test]
    fn test_metric_last_write_wins() {
        let arena = SharedArena::new(1).unwrap();
        arena.metric_set(0, 0, "lat", 1.0, Combine::Max).unwrap();
        arena.metric_set(0, 0, "lat", 9.0, Combine::Max).unwrap();
        assert_eq!(arena.metric_get(0, 0).unwrap().value, 9.0);
    }

    #[test]
    fn test_metric_bounds() {
        let arena = SharedArena::new(1).unwrap();
        assert!(matches!(
            arena.metric_set(0, METRICS_PER_WORKER, "x", 1.0, Combine::Sum),
            Err(ArenaError::MetricOutOfRange { .. })
        ));
        assert!(matches!(
            arena.metric_set(1, 0, "x", 1.0, Combine::Sum),
            Err(ArenaError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_barrier_releases_all_threads() {
        let arena = Arc::new(SharedArena::new(4).unwrap());
        let mut joins = Vec::new();
        for _ in 0..4 {
            let a = Arc::clone(&arena);
            joins.push(std::thread::spawn(move || {
                a.barrier_arrive_and_wait();
            }));
        }
        while arena.ready_workers() < 4 {
            std::thread::yield_now();
        }
        arena.release_workers();
        for j in joins {
            j.join().unwrap();
        }
    }

    #[test]
    fn test_barrier_wakes_on_abort_before_start() {
        let arena = Arc::new(SharedArena::new(1).unwrap());
        let a = Arc::clone(&arena);
        let j = std::thread::spawn(move || {
            a.barrier_arrive_and_wait();
        });
        while arena.ready_workers() < 1 {
            std::thread::yield_now();
        }
        arena.request_stop(AbortReason::Interrupt);
        j.join().unwrap();
    }

    #[test]
    fn test_report_lock_mutual_exclusion() {
        let arena = Arc::new(SharedArena::new(1).unwrap());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let a = Arc::clone(&arena);
            let c = Arc::clone(&counter);
            joins.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = a.lock_report();
                    let v = c.load(Ordering::Relaxed);
                    std::hint::spin_loop();
                    c.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for j in joins {
            j.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800);
    }
}
