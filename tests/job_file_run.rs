//! Whole-pipeline test: TOML job file -> plan -> supervisor -> report.

use std::io::Write;
use std::time::Duration;

use stresskit::lifecycle::ExitOutcome;
use stresskit::plan::load_job_file;
use stresskit::settings::Tag;
use stresskit::stressors;
use stresskit::supervisor::Runner;
use stresskit::system::cache::CpuCaches;
use stresskit::{render_report, report_json, HostInfo};

#[test]
fn test_job_file_end_to_end() {
    eprintln!("\n=== TEST: job file through supervisor to report ===");
    let tmp = tempfile::tempdir().unwrap();
    let job_path = tmp.path().join("smoke.toml");
    let mut file = std::fs::File::create(&job_path).unwrap();
    writeln!(
        file,
        r#"
timeout = "15s"
verify = true

[[stressor]]
name = "counter"
instances = "2"
max-ops = 250

[[stressor]]
name = "vm"
instances = "1"
max-ops = 2

[stressor.options]
vm-bytes = "1m"
vm-keep = "true"
"#
    )
    .unwrap();

    let host = HostInfo::probe();
    let caches = CpuCaches::probe();
    let table = stressors::all();

    let (plan, settings) = load_job_file(&job_path, table, &host, &caches).unwrap();
    assert_eq!(plan.timeout, Some(Duration::from_secs(15)));
    assert_eq!(plan.stressors.len(), 2);
    assert_eq!(
        settings.amount("vm", "vm-bytes", Tag::ByteSizeVm),
        Some(1 << 20)
    );

    let summary = Runner::new(table, plan, settings).run().expect("run failed");
    assert_eq!(summary.outcome, ExitOutcome::Success);
    assert_eq!(summary.results[0].bogo_ops, 500);
    assert_eq!(summary.results[1].bogo_ops, 2);

    let report = render_report(&summary.results, summary.force_killed);
    eprintln!("{}", report);
    assert!(report.contains("counter"));
    assert!(report.contains("vm"));
    assert!(report.contains("total bogo ops 502"));

    let json: serde_json::Value =
        serde_json::from_str(&report_json(&summary.results, summary.force_killed)).unwrap();
    assert_eq!(json["results"][0]["bogo_ops"], 500);
}

#[test]
fn test_job_file_rejects_malformed_before_any_fork() {
    let tmp = tempfile::tempdir().unwrap();
    let job_path = tmp.path().join("broken.toml");
    std::fs::write(
        &job_path,
        r#"
[[stressor]]
name = "vm"
instances = "2"

[stressor.options]
vm-bytes = "10zz"
"#,
    )
    .unwrap();

    let host = HostInfo::probe();
    let caches = CpuCaches::probe();
    let err = load_job_file(&job_path, stressors::all(), &host, &caches).unwrap_err();
    let text = err.to_string();
    // The offending substring and the subject both surface to the user
    assert!(text.contains("10zz"), "got: {}", text);
    assert!(text.contains("vm-bytes"), "got: {}", text);
}
