//! Bogo-op accounting, named metrics and end-of-run aggregation.
//!
//! Workers publish counters and metric slots through the shared arena; the
//! aggregator rolls them up per stressor after every worker has been reaped,
//! so the final read happens-after WIFEXITED for every instance. Bogo rates
//! are only meaningful within one stressor over one run.

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::arena::SharedArena;
use crate::lifecycle::ExitOutcome;

/// How a named metric combines across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Combine {
    Sum = 0,
    ArithmeticMean = 1,
    HarmonicMean = 2,
    Max = 3,
    Min = 4,
}

impl Combine {
    pub fn from_u8(raw: u8) -> Combine {
        match raw {
            1 => Combine::ArithmeticMean,
            2 => Combine::HarmonicMean,
            3 => Combine::Max,
            4 => Combine::Min,
            _ => Combine::Sum,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Combine::Sum => "sum",
            Combine::ArithmeticMean => "arithmetic-mean",
            Combine::HarmonicMean => "harmonic-mean",
            Combine::Max => "max",
            Combine::Min => "min",
        }
    }
}

/// Apply a combine rule over per-instance values.
pub fn combine_values(rule: Combine, values: &[f64]) -> f64 {
    match rule {
        Combine::Sum => values.iter().sum(),
        Combine::ArithmeticMean => {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
        Combine::HarmonicMean => {
            // Zeros are skipped so one idle instance cannot zero the mean.
            let nonzero: Vec<f64> = values.iter().copied().filter(|v| *v != 0.0).collect();
            if nonzero.is_empty() {
                0.0
            } else {
                nonzero.len() as f64 / nonzero.iter().map(|v| 1.0 / v).sum::<f64>()
            }
        }
        Combine::Max => values.iter().copied().fold(0.0, f64::max),
        Combine::Min => {
            if values.is_empty() {
                0.0
            } else {
                values.iter().copied().fold(f64::INFINITY, f64::min)
            }
        }
    }
}

/// One named metric rolled up across a stressor's instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub label: String,
    pub value: f64,
    pub combine: Combine,
}

/// End-of-run results for one stressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressorResults {
    pub name: String,
    pub instances: u32,
    pub bogo_ops: u64,
    pub elapsed_secs: f64,
    /// Derived rate: bogo_ops / elapsed wall seconds.
    pub rate: f64,
    pub outcomes: Vec<ExitOutcome>,
    pub metrics: Vec<MetricSummary>,
    pub sigbus: u64,
    pub sigsegv: u64,
}

impl StressorResults {
    pub fn outcome(&self) -> ExitOutcome {
        ExitOutcome::aggregate(self.outcomes.iter().copied())
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ExitOutcome::NoResource | ExitOutcome::NotImplemented))
            .count()
    }
}

/// Roll up one stressor's arena slots into a [`StressorResults`].
///
/// `slots` is the contiguous arena slot range the stressor's instances were
/// assigned. Label mismatches between instances are logged; aggregation
/// proceeds with the first label seen.
pub fn aggregate_stressor(
    arena: &SharedArena,
    name: &str,
    slots: Range<usize>,
    outcomes: Vec<ExitOutcome>,
    elapsed: Duration,
) -> StressorResults {
    let bogo_ops = arena.bogo_sum(slots.clone());
    let elapsed_secs = elapsed.as_secs_f64();
    let rate = if elapsed_secs > 0.0 {
        bogo_ops as f64 / elapsed_secs
    } else {
        0.0
    };

    let mut metrics = Vec::new();
    for id in 0..crate::arena::METRICS_PER_WORKER {
        let mut label: Option<String> = None;
        let mut combine = Combine::Sum;
        let mut values = Vec::new();
        for slot in slots.clone() {
            let Some(sample) = arena.metric_get(slot, id) else {
                continue;
            };
            match &label {
                None => {
                    label = Some(sample.label.clone());
                    combine = sample.combine;
                }
                Some(first) if *first != sample.label => {
                    log::warn!(
                        "{}: metric {} label mismatch across instances ('{}' vs '{}')",
                        name,
                        id,
                        first,
                        sample.label
                    );
                }
                _ => {}
            }
            values.push(sample.value);
        }
        if let Some(label) = label {
            metrics.push(MetricSummary {
                label,
                value: combine_values(combine, &values),
                combine,
            });
        }
    }

    let sigbus = slots.clone().map(|i| arena.sigbus(i)).sum();
    let sigsegv = slots.clone().map(|i| arena.sigsegv(i)).sum();

    StressorResults {
        name: name.to_string(),
        instances: slots.len() as u32,
        bogo_ops,
        elapsed_secs,
        rate,
        outcomes,
        metrics,
        sigbus,
        sigsegv,
    }
}

/// Render the aligned end-of-run table plus the aggregate line.
pub fn render_report(results: &[StressorResults], force_killed: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<16} {:>9} {:>14} {:>10} {:>14}\n",
        "stressor", "instances", "bogo ops", "real (s)", "bogo ops/s"
    ));
    for r in results {
        out.push_str(&format!(
            "{:<16} {:>9} {:>14} {:>10.2} {:>14.2}\n",
            r.name, r.instances, r.bogo_ops, r.elapsed_secs, r.rate
        ));
        for m in &r.metrics {
            out.push_str(&format!(
                "{:<16} {:>9} {:>14.2}  ({}, {})\n",
                "", "", m.value, m.label, m.combine.as_str()
            ));
        }
        if r.sigbus > 0 || r.sigsegv > 0 {
            out.push_str(&format!(
                "{:<16} {:>9} SIGBUS {} SIGSEGV {}\n",
                "", "", r.sigbus, r.sigsegv
            ));
        }
    }

    let total_bogo: u64 = results.iter().map(|r| r.bogo_ops).sum();
    let worst = ExitOutcome::aggregate(results.iter().map(|r| r.outcome()));
    out.push_str(&format!(
        "total bogo ops {} ({} stressors, aggregate {})\n",
        total_bogo,
        results.len(),
        worst.as_str()
    ));
    if force_killed {
        out.push_str("forced kill - count may be undercounted\n");
    }
    out
}

/// Machine-readable dump of the same results.
pub fn report_json(results: &[StressorResults], force_killed: bool) -> String {
    #[derive(Serialize)]
    struct Dump<'a> {
        force_killed: bool,
        results: &'a [StressorResults],
    }
    serde_json::to_string_pretty(&Dump {
        force_killed,
        results,
    })
    .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}
