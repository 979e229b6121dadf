//! stresskit: a workload-generation harness.
//!
//! Launches many concurrent *stressors* - small self-contained routines
//! that hammer one OS or hardware subsystem - as forked worker processes
//! under a supervisor that coordinates lifecycles, synchronized start,
//! time- and ops-bounded termination, shared-memory metric aggregation and
//! reporting.
//!
//! The system is organized into functional modules:
//! - **error**: unified error type hierarchy
//! - **parse**: sized-value parsing for option strings
//! - **settings**: typed, stressor-scoped option store
//! - **arena**: process-shared memory region (counters, flags, locks)
//! - **lifecycle**: per-worker state machine and exit outcomes
//! - **sched**: scheduler-policy adapter
//! - **signals**: handler install/restore, fault counting, recovery
//! - **metrics**: bogo-op accounting and end-of-run aggregation
//! - **registry**: stressor descriptor table and entry contract
//! - **plan**: validated run plans and TOML job files
//! - **supervisor**: fork pool, kill-and-reap discipline, run loop
//! - **stressors**: the shipped stressor set
//! - **system**: host probing and logging initialization

#![allow(dead_code)]

// Core foundational modules
pub mod error;
pub mod parse;

// Typed option storage feeding stressors
pub mod settings;

// Process-shared state
pub mod arena;
pub mod lifecycle;

// OS adapters
pub mod sched;
pub mod signals;

// Accounting and reporting
pub mod metrics;

// Descriptor table and run plans
pub mod plan;
pub mod registry;

// Robust, decoupled logging system
pub mod log_collector;

// Fork pool and run orchestration
pub mod supervisor;

// Shipped stressor routines
pub mod stressors;

// Host probing and logging initialization
pub mod system;

// Re-export the log crate for macro usage
pub use log;

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{
    ArenaError, CapabilityError, ParseError, PlanError, Result, SchedError, SettingsError,
    SpawnError,
};

pub use arena::{AbortReason, SharedArena, METRICS_PER_WORKER};
pub use lifecycle::{ExitOutcome, WorkerState};
pub use metrics::{render_report, report_json, Combine, MetricSummary, StressorResults};
pub use plan::{JobFile, RunPlan, StressorSpec};
pub use registry::{Args, ClassMask, OptionKind, OptionSpec, StressorDescriptor, VerifyMode};
pub use sched::{DeadlineAttrs, SchedPolicy};
pub use settings::{Settings, Tag, Value};
pub use supervisor::{ReapConfig, RunSummary, Runner, WorkerHandle};
pub use system::{initialize_logging, HostInfo};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_error_reexport() {
        let _: Result<i32> = Ok(42);
    }

    #[test]
    fn test_core_reexports_accessible() {
        let _ = ExitOutcome::Success;
        let _ = WorkerState::Init;
        let _ = Combine::HarmonicMean;
        let _ = SchedPolicy::Other;
        assert!(!stressors::all().is_empty());
    }
}
