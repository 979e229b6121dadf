//! switch: scheduler runqueue flood.
//!
//! Spawns batches of short-lived threads that immediately yield, forcing
//! wakeups and context switches. Threads are private to the worker; the
//! core only promises process-level isolation.

use crate::lifecycle::ExitOutcome;
use crate::metrics::Combine;
use crate::registry::{Args, ClassMask, OptionKind, OptionSpec, StressorDescriptor, VerifyMode};
use crate::settings::Tag;

const DEFAULT_BATCH: u64 = 8;
const YIELDS_PER_THREAD: usize = 64;

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "switch",
    class: ClassMask::SCHEDULER,
    options: &[OptionSpec {
        name: "switch-threads",
        kind: OptionKind::U64,
        help: "threads spawned per batch",
    }],
    help: "flood the runqueue with short-lived yielding threads",
    entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::None,
    capability: None,
    unimplemented_reason: "",
};

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let per_batch = args
        .settings
        .amount(args.name, "switch-threads", Tag::U64)
        .unwrap_or(DEFAULT_BATCH)
        .clamp(1, 256) as usize;

    let mut threads_spawned: u64 = 0;
    while args.keep_stressing() {
        let mut joins = Vec::with_capacity(per_batch);
        for _ in 0..per_batch {
            joins.push(std::thread::spawn(|| {
                for _ in 0..YIELDS_PER_THREAD {
                    std::thread::yield_now();
                }
            }));
        }
        for join in joins {
            if join.join().is_err() {
                return ExitOutcome::Failure;
            }
        }
        threads_spawned += per_batch as u64;
        args.bogo_inc();
    }

    let _ = args.metric_set(0, "threads-spawned", threads_spawned as f64, Combine::Sum);
    ExitOutcome::Success
}
