//! vm: anonymous-memory thrash.
//!
//! Walks a per-instance buffer with LCG-driven volatile writes. The init
//! hook divides a whole-stressor byte budget by the instance count, so the
//! default working set stays bounded however many instances run; an
//! explicit vm-bytes setting overrides it. Under verification each pass is
//! read back and compared against the generator.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::lifecycle::ExitOutcome;
use crate::metrics::Combine;
use crate::registry::{Args, ClassMask, OptionKind, OptionSpec, StressorDescriptor, VerifyMode};
use crate::settings::Tag;

/// Whole-stressor default budget, split across instances by init().
const DEFAULT_TOTAL_BYTES: u64 = 256 * 1024 * 1024;
const MIN_BYTES: u64 = 64 * 1024;

static PER_INSTANCE_BUDGET: AtomicU64 = AtomicU64::new(DEFAULT_TOTAL_BYTES);

const LCG_MUL: u64 = 6364136223846793005;
const LCG_INC: u64 = 1442695040888963407;

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "vm",
    class: ClassMask(ClassMask::VM.0 | ClassMask::MEMORY.0),
    options: &[
        OptionSpec {
            name: "vm-bytes",
            kind: OptionKind::SizeBytesVm,
            help: "per-instance working set (accepts % of memory)",
        },
        OptionSpec {
            name: "vm-keep",
            kind: OptionKind::Flag,
            help: "reuse one buffer instead of reallocating per pass",
        },
    ],
    help: "thrash anonymous memory with pseudo-random writes",
    entry,
    supported: None,
    init: Some(init),
    deinit: Some(deinit),
    verify: VerifyMode::Optional,
    capability: None,
    unimplemented_reason: "",
};

fn init(total_instances: u32) {
    let share = DEFAULT_TOTAL_BYTES / total_instances.max(1) as u64;
    PER_INSTANCE_BUDGET.store(share.max(MIN_BYTES), Ordering::Relaxed);
}

fn deinit() {
    PER_INSTANCE_BUDGET.store(DEFAULT_TOTAL_BYTES, Ordering::Relaxed);
}

fn fill_pass(buffer: &mut [u8], seed: u64) -> u64 {
    let mut state = seed;
    for _ in 0..buffer.len() {
        state = state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
        let index = ((state >> 32) as usize) % buffer.len();
        unsafe { std::ptr::write_volatile(&mut buffer[index], (state & 0xff) as u8) };
    }
    state
}

fn verify_pass(buffer: &[u8], seed: u64) -> u64 {
    // Replays the generator; later writes to the same index win, so only
    // the final value for each index is checked.
    let mut expected: Vec<Option<u8>> = vec![None; buffer.len()];
    let mut state = seed;
    for _ in 0..buffer.len() {
        state = state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
        let index = ((state >> 32) as usize) % buffer.len();
        expected[index] = Some((state & 0xff) as u8);
    }
    let mut mismatches = 0u64;
    for (i, want) in expected.iter().enumerate() {
        if let Some(want) = want {
            if buffer[i] != *want {
                mismatches += 1;
            }
        }
    }
    mismatches
}

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let bytes = args
        .settings
        .amount(args.name, "vm-bytes", Tag::ByteSizeVm)
        .unwrap_or_else(|| PER_INSTANCE_BUDGET.load(Ordering::Relaxed))
        .max(MIN_BYTES) as usize;
    let keep = args.settings.flag(args.name, "vm-keep");

    let mut buffer = vec![0u8; bytes];
    let mut seed = 0xdeadbeefu64 ^ ((args.instance as u64) << 32);
    let mut mismatches = 0u64;
    let mut passes = 0u64;

    while args.keep_stressing() {
        if !keep && passes > 0 {
            buffer = vec![0u8; bytes];
        }
        fill_pass(&mut buffer, seed);
        if args.verify {
            mismatches += verify_pass(&buffer, seed);
        }
        seed = seed.wrapping_add(1);
        passes += 1;
        args.bogo_inc();
    }

    let pages = (bytes as u64 / args.page_size.max(1) as u64) * passes;
    let _ = args.metric_set(0, "pages-written", pages as f64, Combine::Sum);

    if mismatches > 0 {
        log::warn!(
            "vm.{}: {} verification mismatches over {} passes",
            args.instance,
            mismatches,
            passes
        );
        return ExitOutcome::Failure;
    }
    ExitOutcome::Success
}
