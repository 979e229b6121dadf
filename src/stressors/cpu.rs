//! cpu: floating-point and matrix workload.
//!
//! Two methods: a 64x64 matrix multiply and a trig/sqrt loop, both writing
//! through volatile stores so the optimizer cannot discard the work. Under
//! verification the matrix multiply runs twice per iteration and the two
//! checksums must agree; a mismatch is a verification failure, not a crash.

use crate::lifecycle::ExitOutcome;
use crate::metrics::Combine;
use crate::registry::{Args, ClassMask, OptionKind, OptionSpec, StressorDescriptor, VerifyMode};

const MATRIX_SIZE: usize = 64;
const TRIG_BATCH: usize = 10_000;

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "cpu",
    class: ClassMask::CPU,
    options: &[OptionSpec {
        name: "cpu-method",
        kind: OptionKind::Str,
        help: "workload method: matrix or trig",
    }],
    help: "floating-point matrix and trig workloads",
    entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::Optional,
    capability: None,
    unimplemented_reason: "",
};

fn matrix_checksum(a: &[Vec<f64>], b: &[Vec<f64>], c: &mut [Vec<f64>]) -> f64 {
    let mut checksum = 0.0;
    for i in 0..MATRIX_SIZE {
        for j in 0..MATRIX_SIZE {
            let mut sum = 0.0;
            for (k, a_ik) in a[i].iter().enumerate() {
                sum += a_ik * b[k][j];
            }
            unsafe { std::ptr::write_volatile(&mut c[i][j], sum) };
            checksum += sum;
        }
    }
    checksum
}

fn run_matrix(args: &mut Args<'_>) -> ExitOutcome {
    let mut a = vec![vec![0.0f64; MATRIX_SIZE]; MATRIX_SIZE];
    let mut b = vec![vec![0.0f64; MATRIX_SIZE]; MATRIX_SIZE];
    let mut c = vec![vec![0.0f64; MATRIX_SIZE]; MATRIX_SIZE];
    for i in 0..MATRIX_SIZE {
        for j in 0..MATRIX_SIZE {
            a[i][j] = (i as f64) * (j as f64) * 0.001;
            b[i][j] = (i as f64 + j as f64) * 0.001;
        }
    }

    let mut verify_failures: u64 = 0;
    while args.keep_stressing() {
        let checksum = matrix_checksum(&a, &b, &mut c);
        if args.verify {
            let again = matrix_checksum(&a, &b, &mut c);
            if checksum.to_bits() != again.to_bits() {
                verify_failures += 1;
                log::warn!(
                    "cpu.{}: matrix checksum mismatch ({} vs {})",
                    args.instance,
                    checksum,
                    again
                );
            }
        }
        args.bogo_inc();
    }

    let _ = args.metric_set(
        0,
        "matrix-mults",
        args.bogo() as f64,
        Combine::Sum,
    );
    if verify_failures > 0 {
        return ExitOutcome::Failure;
    }
    ExitOutcome::Success
}

fn run_trig(args: &mut Args<'_>) -> ExitOutcome {
    let mut sink = 0.0f64;
    while args.keep_stressing() {
        for i in 0..TRIG_BATCH {
            let x = (i as f64).sin() * (i as f64).cos();
            let y = x.sqrt().abs();
            let z = y * y + x;
            unsafe { std::ptr::write_volatile(&mut sink, z) };
        }
        args.bogo_inc();
    }
    ExitOutcome::Success
}

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let method = args
        .settings
        .string(args.name, "cpu-method")
        .unwrap_or("matrix")
        .to_string();
    match method.as_str() {
        "matrix" => run_matrix(args),
        "trig" => run_trig(args),
        other => {
            log::warn!("cpu.{}: unknown method '{}'", args.instance, other);
            ExitOutcome::Failure
        }
    }
}
