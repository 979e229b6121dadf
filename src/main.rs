use std::path::Path;

use anyhow::{bail, Context};

use stresskit::plan::load_job_file;
use stresskit::system::cache::CpuCaches;
use stresskit::{initialize_logging, render_report, report_json, stressors, HostInfo, Runner};

fn print_stressor_list() {
    println!("{:<10} {}", "name", "description");
    for descriptor in stressors::all() {
        println!("{:<10} {}", descriptor.name, descriptor.help);
    }
}

fn usage() -> ! {
    eprintln!("usage: stresskit <job.toml> | stresskit --list");
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let job_path = match args.as_slice() {
        [flag] if flag == "--list" => {
            print_stressor_list();
            return Ok(());
        }
        [path] => path.clone(),
        _ => usage(),
    };

    let host = HostInfo::probe();
    let caches = CpuCaches::probe();
    let table = stressors::all();

    let (plan, settings) = load_job_file(Path::new(&job_path), table, &host, &caches)
        .with_context(|| format!("loading job file {}", job_path))?;

    if plan.stressors.is_empty() {
        bail!("job file {} names no stressors", job_path);
    }

    if let Err(e) = initialize_logging(plan.log_file.clone(), plan.syslog, false) {
        bail!("initializing logging: {}", e);
    }

    log::info!(
        "starting {} stressor slice(s), {} worker(s), timeout {:?}",
        plan.stressors.len(),
        plan.total_instances(),
        plan.timeout
    );

    let summary = Runner::new(table, plan, settings)
        .run()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    print!("{}", render_report(&summary.results, summary.force_killed));
    log::debug!("{}", report_json(&summary.results, summary.force_killed));
    log::info!(
        "run finished in {:.2}s: {} (stop reason: {})",
        summary.elapsed.as_secs_f64(),
        summary.outcome,
        summary.abort_reason.as_str()
    );

    log::logger().flush();
    std::process::exit(summary.outcome.code());
}
