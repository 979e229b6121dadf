//! Validated run plans and TOML job files.
//!
//! CLI parsing proper lives outside the core; what arrives here is either a
//! job file or a programmatically built plan. Building a plan validates
//! stressor names against the descriptor table, expands option strings
//! through the sized-value parser, and populates the typed settings store
//! before anything forks. A malformed option aborts the whole run here,
//! before the first worker exists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::parse;
use crate::registry::{find, OptionKind, StressorDescriptor};
use crate::sched::{DeadlineAttrs, SchedPolicy};
use crate::settings::{Settings, Value};
use crate::system::cache::CpuCaches;
use crate::system::HostInfo;

// Stressor names are table keys and report labels; keep them shell-inert.
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9\-_]+$").expect("static regex compiles"));

/// Raw job file as deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobFile {
    pub timeout: Option<String>,
    pub sched: Option<String>,
    #[serde(rename = "sched-prio")]
    pub sched_prio: Option<i32>,
    #[serde(rename = "sched-runtime")]
    pub sched_runtime: Option<u64>,
    #[serde(rename = "sched-deadline")]
    pub sched_deadline: Option<u64>,
    #[serde(rename = "sched-period")]
    pub sched_period: Option<u64>,
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub maximize: bool,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default)]
    pub verify: bool,
    #[serde(rename = "log-file")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub syslog: bool,
    #[serde(default, rename = "stressor")]
    pub stressors: Vec<JobStressor>,
}

/// One `[[stressor]]` block of a job file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobStressor {
    pub name: String,
    /// Instance count, percent-of-CPUs capable ("50%"); 0 or absent means
    /// one instance per online CPU
    pub instances: Option<String>,
    #[serde(default, rename = "max-ops")]
    pub max_ops: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// One stressor's share of a validated plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressorSpec {
    pub name: String,
    pub instances: u32,
    /// 0 means unbounded
    pub max_ops: u64,
}

/// A validated run plan: what the supervisor executes.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub stressors: Vec<StressorSpec>,
    pub timeout: Option<Duration>,
    pub sched: Option<SchedPolicy>,
    pub sched_prio: Option<i32>,
    pub deadline_attrs: Option<DeadlineAttrs>,
    pub aggressive: bool,
    pub maximize: bool,
    pub minimize: bool,
    pub verify: bool,
    pub log_file: Option<PathBuf>,
    pub syslog: bool,
}

impl RunPlan {
    pub fn new() -> RunPlan {
        RunPlan::default()
    }

    /// Programmatic plan construction (tests, library callers).
    pub fn with_stressor(mut self, name: &str, instances: u32, max_ops: u64) -> RunPlan {
        self.stressors.push(StressorSpec {
            name: name.to_string(),
            instances,
            max_ops,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> RunPlan {
        self.timeout = Some(timeout);
        self
    }

    pub fn total_instances(&self) -> u32 {
        self.stressors.iter().map(|s| s.instances).sum()
    }
}

fn expand_option(
    settings: &mut Settings,
    stressor: &str,
    name: &str,
    kind: OptionKind,
    raw: &str,
    instances: u32,
    host: &HostInfo,
    caches: &CpuCaches,
) -> Result<(), PlanError> {
    let value = match kind {
        OptionKind::Flag => {
            settings.set_true(stressor, name)?;
            return Ok(());
        }
        OptionKind::U32 => Value::U32(parse::parse_u32(raw, name)?),
        OptionKind::U64 => Value::U64(parse::parse_u64(raw, name)?),
        OptionKind::I64 => Value::I64(parse::parse_i64(raw, name)?),
        OptionKind::Time => Value::U64(parse::parse_time(raw, name)?),
        OptionKind::Str => Value::Str(raw.to_string()),
        OptionKind::SizeBytesVm => {
            let (bytes, _pct) =
                parse::parse_bytes_percent(raw, instances, host.total_memory, name)?;
            Value::ByteSizeVm(bytes)
        }
        OptionKind::SizeBytesFs => {
            let max = fs_available_bytes().unwrap_or(host.total_memory);
            let (bytes, pct) = parse::parse_bytes_percent(raw, instances, max, name)?;
            // Percent-form keeps a distinct tag so the stressor can learn
            // the user meant a share, not an absolute size.
            if pct {
                Value::ByteSizeFsPercent(bytes)
            } else {
                Value::ByteSizeFs(bytes)
            }
        }
        OptionKind::SizeBytesCache => {
            Value::Size(parse::parse_bytes_or_cache(raw, caches, name)?)
        }
    };
    settings.set(stressor, name, value)?;
    Ok(())
}

fn fs_available_bytes() -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(".").ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

/// Validate a raw job file against the descriptor table, producing the run
/// plan and the populated settings store.
pub fn build_plan(
    job: &JobFile,
    table: &[StressorDescriptor],
    host: &HostInfo,
    caches: &CpuCaches,
) -> Result<(RunPlan, Settings), PlanError> {
    let mut plan = RunPlan::new();
    let mut settings = Settings::new();

    plan.aggressive = job.aggressive;
    plan.maximize = job.maximize;
    plan.minimize = job.minimize;
    plan.verify = job.verify;
    plan.log_file = job.log_file.clone();
    plan.syslog = job.syslog;

    if let Some(timeout) = &job.timeout {
        plan.timeout = Some(Duration::from_secs(parse::parse_time(timeout, "timeout")?));
    }

    if let Some(sched) = &job.sched {
        plan.sched = Some(
            SchedPolicy::from_name(sched).ok_or_else(|| PlanError::UnknownSched(sched.clone()))?,
        );
        plan.sched_prio = job.sched_prio;
    }
    if let (Some(runtime), Some(deadline), Some(period)) =
        (job.sched_runtime, job.sched_deadline, job.sched_period)
    {
        plan.deadline_attrs = Some(DeadlineAttrs {
            runtime_ns: runtime,
            deadline_ns: deadline,
            period_ns: period,
        });
    }

    for entry in &job.stressors {
        if !NAME_RE.is_match(&entry.name) {
            return Err(PlanError::InvalidName(entry.name.clone()));
        }
        let descriptor =
            find(table, &entry.name).ok_or_else(|| PlanError::UnknownStressor(entry.name.clone()))?;

        let instances = match &entry.instances {
            Some(raw) => {
                let n = parse::parse_instances_percent(raw, "instances")?;
                if n <= 0 {
                    host.cpus as u32
                } else {
                    n as u32
                }
            }
            None => host.cpus as u32,
        };

        for (opt_name, raw) in &entry.options {
            let spec = descriptor
                .options
                .iter()
                .find(|o| o.name == opt_name.as_str())
                .ok_or_else(|| PlanError::UnknownOption {
                    stressor: entry.name.clone(),
                    option: opt_name.clone(),
                })?;
            expand_option(
                &mut settings,
                &entry.name,
                opt_name,
                spec.kind,
                raw,
                instances,
                host,
                caches,
            )?;
        }

        plan.stressors.push(StressorSpec {
            name: entry.name.clone(),
            instances,
            max_ops: entry.max_ops,
        });
    }

    Ok((plan, settings))
}

/// Load and validate a TOML job file.
pub fn load_job_file(
    path: &Path,
    table: &[StressorDescriptor],
    host: &HostInfo,
    caches: &CpuCaches,
) -> Result<(RunPlan, Settings), PlanError> {
    let raw = std::fs::read_to_string(path)?;
    let job: JobFile = toml::from_str(&raw)?;
    build_plan(&job, table, host, caches)
}
