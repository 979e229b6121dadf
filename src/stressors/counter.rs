//! counter: minimal hot-loop stressor.
//!
//! One bogo op per iteration with a volatile write to keep the loop from
//! folding away. Useful as a scheduler baseline and for exercising the
//! op-budget path.

use crate::lifecycle::ExitOutcome;
use crate::registry::{Args, ClassMask, StressorDescriptor, VerifyMode};

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "counter",
    class: ClassMask::CPU,
    options: &[],
    help: "spin counting bogo ops as fast as possible",
    entry,
    supported: None,
    init: None,
    deinit: None,
    verify: VerifyMode::None,
    capability: None,
    unimplemented_reason: "",
};

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let mut sink: u64 = 0;
    while args.keep_stressing() {
        let next = sink.wrapping_add(args.bogo()).wrapping_mul(2654435761);
        unsafe { std::ptr::write_volatile(&mut sink, next) };
        args.bogo_inc();
    }
    ExitOutcome::Success
}
