//! pipe: IPC round-trips through an anonymous pipe.
//!
//! Writes a patterned chunk and reads it straight back; the chunk stays
//! well under the kernel pipe buffer so the loop never deadlocks on its own
//! pipe. Verification checks the pattern survived the round trip.

use std::os::fd::AsRawFd;

use nix::unistd::{pipe, read, write};

use crate::lifecycle::ExitOutcome;
use crate::metrics::Combine;
use crate::registry::{Args, ClassMask, OptionKind, OptionSpec, StressorDescriptor, VerifyMode};
use crate::settings::Tag;

const DEFAULT_CHUNK: u64 = 512;
const MAX_CHUNK: u64 = 4096;

pub(crate) const DESCRIPTOR: StressorDescriptor = StressorDescriptor {
    name: "pipe",
    class: ClassMask(ClassMask::IPC.0 | ClassMask::OS.0),
    options: &[OptionSpec {
        name: "pipe-data-size",
        kind: OptionKind::U64,
        help: "bytes per round trip (capped below the pipe buffer)",
    }],
    help: "pump data through an anonymous pipe",
    entry,
    supported: Some(supported),
    init: None,
    deinit: None,
    verify: VerifyMode::Optional,
    capability: None,
    unimplemented_reason: "pipe creation failed",
};

fn supported(_name: &str) -> Result<(), String> {
    // A host that cannot create a pipe cannot run this stressor at all.
    pipe().map(|_| ()).map_err(|e| format!("pipe2: {}", e))
}

fn entry(args: &mut Args<'_>) -> ExitOutcome {
    let chunk = args
        .settings
        .amount(args.name, "pipe-data-size", Tag::U64)
        .unwrap_or(DEFAULT_CHUNK)
        .clamp(1, MAX_CHUNK) as usize;

    let (rd, wr) = match pipe() {
        Ok(fds) => fds,
        Err(e) => {
            log::warn!("pipe.{}: pipe creation failed: {}", args.instance, e);
            return ExitOutcome::NoResource;
        }
    };

    let pattern: Vec<u8> = (0..chunk)
        .map(|i| (i as u8) ^ (args.instance as u8))
        .collect();
    let mut buffer = vec![0u8; chunk];
    let mut bytes_moved: u64 = 0;
    let mut mismatches: u64 = 0;

    while args.keep_stressing() {
        let mut written = 0;
        while written < chunk {
            match write(&wr, &pattern[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("pipe.{}: write failed: {}", args.instance, e);
                    return ExitOutcome::Failure;
                }
            }
        }
        let mut filled = 0;
        while filled < chunk {
            match read(rd.as_raw_fd(), &mut buffer[filled..]) {
                Ok(0) => {
                    log::warn!("pipe.{}: unexpected EOF", args.instance);
                    return ExitOutcome::Failure;
                }
                Ok(n) => filled += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("pipe.{}: read failed: {}", args.instance, e);
                    return ExitOutcome::Failure;
                }
            }
        }
        if args.verify && buffer != pattern {
            mismatches += 1;
        }
        bytes_moved += chunk as u64;
        args.bogo_inc();
    }

    let _ = args.metric_set(0, "mbytes-piped", bytes_moved as f64 / 1048576.0, Combine::Sum);

    if mismatches > 0 {
        log::warn!("pipe.{}: {} round-trip mismatches", args.instance, mismatches);
        return ExitOutcome::Failure;
    }
    ExitOutcome::Success
}
