//! Termination coordination: wall-clock budget, user stop, failure
//! thresholds.
//!
//! Everything funnels into the arena's continue flag. SIGALRM carries the
//! time budget, SIGINT/SIGTERM carry user stops, and a stressor whose
//! instances keep failing trips the abort threshold. The supervisor's wait
//! loop also checks the deadline directly, so a lost alarm cannot hang the
//! run for the full reap-escalation window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::arena::{AbortReason, SharedArena};
use crate::signals::{install_run_handlers, InstalledHandlers};

/// Consecutive failures from one stressor before the whole run stops.
pub const ABORT_FAILURE_THRESHOLD: u32 = 5;

/// Owns the run's termination machinery from first fork to last reap.
pub struct TerminationCoordinator {
    handlers: Option<InstalledHandlers>,
    deadline: Option<Instant>,
}

impl TerminationCoordinator {
    /// Install handlers and schedule the SIGALRM budget. Must run before
    /// the first fork so workers inherit the dispositions.
    pub fn begin(
        arena: &SharedArena,
        timeout: Option<Duration>,
    ) -> nix::Result<TerminationCoordinator> {
        let handlers = install_run_handlers(arena)?;

        let deadline = timeout.map(|t| {
            let secs = t.as_secs().max(1) as libc::c_uint;
            let _ = nix::unistd::alarm::set(secs);
            Instant::now() + t
        });

        Ok(TerminationCoordinator {
            handlers: Some(handlers),
            deadline,
        })
    }

    /// Wall-clock fallback check; clears the continue flag if the alarm
    /// went missing.
    pub fn poll(&self, arena: &SharedArena) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline && arena.keep_running() {
                arena.request_stop(AbortReason::TimeBudget);
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the alarm and restore the previous signal dispositions.
    pub fn finish(mut self) {
        let _ = nix::unistd::alarm::cancel();
        if let Some(handlers) = self.handlers.take() {
            handlers.restore();
        }
    }
}

impl Drop for TerminationCoordinator {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.take() {
            let _ = nix::unistd::alarm::cancel();
            handlers.restore();
        }
    }
}

/// Per-stressor failure accounting feeding the abort threshold.
#[derive(Debug, Default)]
pub struct FailureAccounting {
    counts: HashMap<String, u32>,
    reported: bool,
}

impl FailureAccounting {
    pub fn new() -> FailureAccounting {
        FailureAccounting::default()
    }

    /// Record one instance failure; stops the whole run (reported exactly
    /// once) when a stressor crosses the threshold.
    pub fn record_failure(&mut self, arena: &SharedArena, stressor: &str) {
        let count = self.counts.entry(stressor.to_string()).or_insert(0);
        *count += 1;
        if *count > ABORT_FAILURE_THRESHOLD && !self.reported {
            self.reported = true;
            log::error!(
                "{}: {} instances failed, aborting the whole run",
                stressor,
                count
            );
            arena.request_stop(AbortReason::FailureThreshold);
        }
    }

    pub fn failures(&self, stressor: &str) -> u32 {
        self.counts.get(stressor).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_threshold_stops_run_once() {
        let arena = SharedArena::new(1).unwrap();
        let mut acc = FailureAccounting::new();
        for _ in 0..ABORT_FAILURE_THRESHOLD {
            acc.record_failure(&arena, "leaky");
        }
        assert!(arena.keep_running(), "at the threshold the run still goes");
        acc.record_failure(&arena, "leaky");
        assert!(!arena.keep_running());
        assert_eq!(arena.abort_reason(), AbortReason::FailureThreshold);
        assert_eq!(acc.failures("leaky"), ABORT_FAILURE_THRESHOLD + 1);
        assert_eq!(acc.failures("other"), 0);
    }

    #[test]
    fn test_failures_tracked_per_stressor() {
        let arena = SharedArena::new(1).unwrap();
        let mut acc = FailureAccounting::new();
        for _ in 0..3 {
            acc.record_failure(&arena, "a");
            acc.record_failure(&arena, "b");
        }
        // Neither stressor alone crossed the threshold
        assert!(arena.keep_running());
        assert_eq!(acc.failures("a"), 3);
        assert_eq!(acc.failures("b"), 3);
    }
}
