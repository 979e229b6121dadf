//! End-to-end supervisor scenarios with real forked workers.
//!
//! Signal dispositions and the handler arena binding are process-global, so
//! every scenario takes the run guard and scenarios never overlap.

use std::sync::Mutex;
use std::time::Duration;

use stresskit::lifecycle::{ExitOutcome, WorkerState};
use stresskit::plan::RunPlan;
use stresskit::registry::{Args, ClassMask, StressorDescriptor, VerifyMode};
use stresskit::settings::Settings;
use stresskit::stressors;
use stresskit::supervisor::{ReapConfig, Runner};
use stresskit::{render_report, HostInfo};

static RUN_GUARD: Mutex<()> = Mutex::new(());

fn run_guard() -> std::sync::MutexGuard<'static, ()> {
    RUN_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

fn stubborn_entry(_args: &mut Args<'_>) -> ExitOutcome {
    // Deliberately ignores the continue flag; only SIGKILL ends it
    loop {
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn halfres_entry(args: &mut Args<'_>) -> ExitOutcome {
    if args.instance == 0 {
        return ExitOutcome::NoResource;
    }
    args.bogo_inc();
    ExitOutcome::Success
}

const STUBBORN_TABLE: &[StressorDescriptor] = &[StressorDescriptor {
    name: "stubborn",
    class: ClassMask::SCHEDULER,
    options: &[],
    help: "sleeps forever, ignoring cooperative cancellation",
    entry: stubborn_entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::None,
    capability: None,
    unimplemented_reason: "",
}];

const HALFRES_TABLE: &[StressorDescriptor] = &[StressorDescriptor {
    name: "halfres",
    class: ClassMask::OS,
    options: &[],
    help: "instance 0 reports resource exhaustion",
    entry: halfres_entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::None,
    capability: None,
    unimplemented_reason: "",
}];

#[test]
fn test_scenario_count_to_n() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: 3x count-to-1000, timeout 10s ===");

    let plan = RunPlan::new()
        .with_stressor("counter", 3, 1000)
        .with_timeout(Duration::from_secs(10));
    let summary = Runner::new(stressors::all(), plan, Settings::new())
        .run()
        .expect("run failed");

    assert_eq!(summary.outcome, ExitOutcome::Success);
    assert!(!summary.force_killed);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].bogo_ops, 3000);
    assert_eq!(summary.results[0].outcomes.len(), 3);
    // Every worker was observed in its terminal Exit state at reap time
    for state in &summary.final_states {
        assert_eq!(*state, Some(WorkerState::Exit));
    }
    eprintln!("[TEST] aggregate bogo = {}", summary.results[0].bogo_ops);
}

#[test]
fn test_scenario_stubborn_workers_force_killed() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: 2x continue-ignoring workers, timeout 2s ===");

    let plan = RunPlan::new()
        .with_stressor("stubborn", 2, 0)
        .with_timeout(Duration::from_secs(2));
    // Short escalation windows keep the test quick; the thresholds are the
    // supervisor's knobs, not constants
    let reap = ReapConfig {
        escalate_after: 3,
        abandon_after: 100,
        fork_retries: 10,
    };
    let summary = Runner::new(STUBBORN_TABLE, plan, Settings::new())
        .with_reap_config(reap)
        .run()
        .expect("run failed");

    assert!(summary.force_killed, "escalation must set force_killed");
    assert_eq!(summary.outcome, ExitOutcome::Success);
    assert_eq!(summary.results[0].outcomes.len(), 2);
    for outcome in &summary.results[0].outcomes {
        assert_eq!(*outcome, ExitOutcome::Success);
    }

    // The taint, once set, persists into the end-of-run report
    let report = render_report(&summary.results, summary.force_killed);
    assert!(report.contains("forced kill"));
    eprintln!("[TEST] both stragglers reaped by escalation");
}

#[test]
fn test_scenario_max_ops_finishes_early() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: 4x max-ops 100 well before a 30s timeout ===");

    let plan = RunPlan::new()
        .with_stressor("counter", 4, 100)
        .with_timeout(Duration::from_secs(30));
    let summary = Runner::new(stressors::all(), plan, Settings::new())
        .run()
        .expect("run failed");

    assert_eq!(summary.outcome, ExitOutcome::Success);
    assert_eq!(summary.results[0].bogo_ops, 400);
    assert!(
        summary.elapsed < Duration::from_secs(10),
        "op-bounded run must not wait for the timeout (took {:?})",
        summary.elapsed
    );
}

#[test]
fn test_scenario_timeout_option_parsing() {
    // Single-suffix times parse; multi-suffix forms are rejected outright
    let host = HostInfo::probe();
    let caches = stresskit::system::cache::CpuCaches::default();

    let good: stresskit::JobFile = toml::from_str(
        r#"
        timeout = "2m"
        [[stressor]]
        name = "counter"
        instances = "1"
        "#,
    )
    .unwrap();
    let (plan, _) = stresskit::plan::build_plan(&good, stressors::all(), &host, &caches).unwrap();
    assert_eq!(plan.timeout, Some(Duration::from_secs(120)));

    let bad: stresskit::JobFile = toml::from_str(
        r#"
        timeout = "2m30s"
        [[stressor]]
        name = "counter"
        instances = "1"
        "#,
    )
    .unwrap();
    let err = stresskit::plan::build_plan(&bad, stressors::all(), &host, &caches).unwrap_err();
    assert!(matches!(
        err,
        stresskit::PlanError::Parse(stresskit::ParseError::BadSuffix { .. })
    ));
}

#[test]
fn test_scenario_partial_resource_exhaustion() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: instance 0 NO_RESOURCE, instance 1 SUCCESS ===");

    let plan = RunPlan::new()
        .with_stressor("halfres", 2, 0)
        .with_timeout(Duration::from_secs(5));
    let summary = Runner::new(HALFRES_TABLE, plan, Settings::new())
        .run()
        .expect("run failed");

    assert_eq!(summary.outcome, ExitOutcome::NoResource);
    let results = &summary.results[0];
    assert_eq!(results.skipped(), 1);
    assert!(results.outcomes.contains(&ExitOutcome::NoResource));
    assert!(results.outcomes.contains(&ExitOutcome::Success));
}

#[test]
fn test_scenario_segv_recovery() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: deliberate SIGSEGV with handler recovery ===");

    let mut plan = RunPlan::new()
        .with_stressor("segv", 1, 3)
        .with_timeout(Duration::from_secs(10));
    plan.verify = true;
    let summary = Runner::new(stressors::all(), plan, Settings::new())
        .run()
        .expect("run failed");

    assert_eq!(summary.outcome, ExitOutcome::Success, "worker must survive its own faults");
    assert_eq!(summary.results[0].bogo_ops, 3);
    // One counted trap per bogo op
    assert_eq!(summary.results[0].sigsegv, 3);
    eprintln!(
        "[TEST] {} traps recovered",
        summary.results[0].sigsegv
    );
}

#[test]
fn test_invariant_every_worker_reaped_exactly_once() {
    let _guard = run_guard();

    let plan = RunPlan::new()
        .with_stressor("counter", 3, 10)
        .with_timeout(Duration::from_secs(10));
    let summary = Runner::new(stressors::all(), plan, Settings::new())
        .run()
        .expect("run failed");

    // A double reap surfaces as ECHILD -> Failure; an orphan as a missing
    // outcome. Three clean outcomes mean three single reaps.
    assert_eq!(summary.results[0].outcomes.len(), 3);
    assert!(summary.results[0]
        .outcomes
        .iter()
        .all(|o| *o == ExitOutcome::Success));
    assert_eq!(summary.final_states.len(), 3);
}

#[test]
fn test_gated_stressors_are_skipped_not_failed() {
    let _guard = run_guard();

    fn never_entry(_args: &mut Args<'_>) -> ExitOutcome {
        unreachable!("gated stressors must not spawn")
    }
    fn unsupported_here(_name: &str) -> Result<(), String> {
        Err("kernel feature missing".to_string())
    }

    const GATED_TABLE: &[StressorDescriptor] = &[
        StressorDescriptor {
            name: "privileged",
            class: ClassMask::OS,
            options: &[],
            help: "needs a capability nobody holds",
            entry: never_entry,
            supported: None,
            init: None,
            deinit: None,
            verify: VerifyMode::None,
            capability: Some("CAP_MADE_UP"),
            unimplemented_reason: "",
        },
        StressorDescriptor {
            name: "unsupported",
            class: ClassMask::OS,
            options: &[],
            help: "supported() always declines",
            entry: never_entry,
            supported: Some(unsupported_here),
            init: None,
            deinit: None,
            verify: VerifyMode::None,
            capability: None,
            unimplemented_reason: "kernel feature missing",
        },
    ];

    let plan = RunPlan::new()
        .with_stressor("privileged", 2, 0)
        .with_stressor("unsupported", 1, 0)
        .with_timeout(Duration::from_secs(5));
    let summary = Runner::new(GATED_TABLE, plan, Settings::new())
        .run()
        .expect("run failed");

    // Skipped, never failed: the whole run aggregates to NOT_IMPLEMENTED
    assert_eq!(summary.outcome, ExitOutcome::NotImplemented);
    for results in &summary.results {
        assert!(results
            .outcomes
            .iter()
            .all(|o| *o == ExitOutcome::NotImplemented));
    }
}

#[test]
fn test_mixed_stressors_one_run() {
    let _guard = run_guard();
    eprintln!("\n=== TEST: counter + pipe side by side ===");

    let plan = RunPlan::new()
        .with_stressor("counter", 2, 500)
        .with_stressor("pipe", 1, 200)
        .with_timeout(Duration::from_secs(15));
    let summary = Runner::new(stressors::all(), plan, Settings::new())
        .run()
        .expect("run failed");

    assert_eq!(summary.outcome, ExitOutcome::Success);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[0].name, "counter");
    assert_eq!(summary.results[0].bogo_ops, 1000);
    assert_eq!(summary.results[1].name, "pipe");
    assert_eq!(summary.results[1].bogo_ops, 200);
    // The pipe stressor publishes its throughput metric
    assert_eq!(summary.results[1].metrics[0].label, "mbytes-piped");
}
