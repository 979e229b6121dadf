//! Stressor descriptor table and the entry contract.
//!
//! A stressor is a table row: classifier bits, option schema, hooks and the
//! entry function. Descriptors are compile-time data; the dispatcher takes
//! the table as a slice so tests can run purpose-built stressors without
//! touching the shipped set.

use std::time::Instant;

use nix::unistd::Pid;

use crate::arena::SharedArena;
use crate::error::{ArenaError, CapabilityError};
use crate::lifecycle::ExitOutcome;
use crate::metrics::Combine;
use crate::settings::Settings;

/// Classifier bitset: which subsystems a stressor exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassMask(pub u32);

impl ClassMask {
    pub const CPU: ClassMask = ClassMask(1 << 0);
    pub const VM: ClassMask = ClassMask(1 << 1);
    pub const IO: ClassMask = ClassMask(1 << 2);
    pub const NETWORK: ClassMask = ClassMask(1 << 3);
    pub const SCHEDULER: ClassMask = ClassMask(1 << 4);
    pub const OS: ClassMask = ClassMask(1 << 5);
    pub const IPC: ClassMask = ClassMask(1 << 6);
    pub const FILESYSTEM: ClassMask = ClassMask(1 << 7);
    pub const INTERRUPT: ClassMask = ClassMask(1 << 8);
    pub const MEMORY: ClassMask = ClassMask(1 << 9);

    pub const fn union(self, other: ClassMask) -> ClassMask {
        ClassMask(self.0 | other.0)
    }

    pub fn contains(&self, other: ClassMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ClassMask {
    type Output = ClassMask;
    fn bitor(self, rhs: ClassMask) -> ClassMask {
        self.union(rhs)
    }
}

/// Whether a stressor self-checks its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// No verification path
    None,
    /// Verification is part of the workload
    Always,
    /// Verification runs when the plan asks for --verify
    Optional,
}

/// How an option string parses, driving the settings tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Present-flag, stored as bool true
    Flag,
    U32,
    U64,
    I64,
    /// Byte size resolved against total memory, percent-capable
    SizeBytesVm,
    /// Byte size resolved against filesystem space, percent-capable
    SizeBytesFs,
    /// Byte size, or a CPU-cache alias ("L2", "LLC")
    SizeBytesCache,
    /// Seconds with single time suffix
    Time,
    Str,
}

/// One row of a stressor's option schema.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub help: &'static str,
}

/// Per-worker context handed to the entry function.
pub struct Args<'a> {
    pub name: &'static str,
    /// Instance index in [0, total_instances)
    pub instance: u32,
    pub total_instances: u32,
    pub pid: Pid,
    pub page_size: usize,
    /// Wall-clock end of the run's budget
    pub end_time: Instant,
    /// 0 means unbounded
    pub max_ops: u64,
    /// This worker's arena slot
    pub slot: usize,
    pub arena: &'a SharedArena,
    pub settings: &'a Settings,
    /// Effective verification request for this run
    pub verify: bool,
}

impl Args<'_> {
    /// Hot-path bogo-op increment.
    #[inline]
    pub fn bogo_inc(&self) {
        self.arena.bogo_add(self.slot, 1);
    }

    #[inline]
    pub fn bogo_add(&self, n: u64) {
        self.arena.bogo_add(self.slot, n);
    }

    pub fn bogo_set(&self, n: u64) {
        self.arena.bogo_set(self.slot, n);
    }

    pub fn bogo(&self) -> u64 {
        self.arena.bogo(self.slot)
    }

    /// Publish a named metric into this worker's slot.
    pub fn metric_set(
        &self,
        id: usize,
        label: &str,
        value: f64,
        combine: Combine,
    ) -> Result<(), ArenaError> {
        self.arena.metric_set(self.slot, id, label, value, combine)
    }

    /// The per-iteration check every stressor loop makes: continue flag
    /// plus this worker's op budget.
    #[inline]
    pub fn keep_stressing(&self) -> bool {
        if !self.arena.keep_running() {
            return false;
        }
        if self.max_ops > 0 && self.arena.bogo(self.slot) >= self.max_ops {
            return false;
        }
        true
    }
}

/// Stressor entry point: runs in the forked worker, return value becomes
/// the process exit status.
pub type EntryFn = fn(&mut Args<'_>) -> ExitOutcome;

/// Pre-spawn support probe; an Err skips the stressor (NOT_IMPLEMENTED).
pub type SupportedFn = fn(name: &str) -> Result<(), String>;

/// One-shot whole-stressor setup, called before any instance forks.
pub type InitFn = fn(total_instances: u32);

/// One-shot teardown after all of the stressor's workers are reaped.
pub type DeinitFn = fn();

/// Immutable table row describing one stressor.
pub struct StressorDescriptor {
    pub name: &'static str,
    pub class: ClassMask,
    pub options: &'static [OptionSpec],
    pub help: &'static str,
    pub entry: EntryFn,
    pub supported: Option<SupportedFn>,
    pub init: Option<InitFn>,
    pub deinit: Option<DeinitFn>,
    pub verify: VerifyMode,
    /// Capability the stressor needs, surfaced to the checker before spawn
    pub capability: Option<&'static str>,
    /// Shown when the stressor is skipped as unimplemented
    pub unimplemented_reason: &'static str,
}

impl std::fmt::Debug for StressorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressorDescriptor")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("verify", &self.verify)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Look a stressor up by name.
pub fn find<'a>(
    table: &'a [StressorDescriptor],
    name: &str,
) -> Option<&'a StressorDescriptor> {
    table.iter().find(|d| d.name == name)
}

/// Check a descriptor's capability requirement against the current process.
pub fn capability_check(descriptor: &StressorDescriptor) -> Result<(), CapabilityError> {
    match descriptor.capability {
        Some(capability) if !capability_held(capability) => Err(CapabilityError {
            stressor: descriptor.name.to_string(),
            capability,
        }),
        _ => Ok(()),
    }
}

/// Does the current process hold the named capability?
///
/// Reads CapEff from /proc/self/status; absence of the file (non-Linux)
/// falls back to an effective-uid-zero check.
pub fn capability_held(capability: &str) -> bool {
    let bit = match capability {
        "CAP_IPC_LOCK" => 14,
        "CAP_SYS_ADMIN" => 21,
        "CAP_SYS_NICE" => 23,
        "CAP_SYS_RESOURCE" => 24,
        "CAP_SYS_TIME" => 25,
        _ => return false,
    };

    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if let Some(hex) = line.strip_prefix("CapEff:") {
                if let Ok(mask) = u64::from_str_radix(hex.trim(), 16) {
                    return mask & (1u64 << bit) != 0;
                }
            }
        }
    }
    nix::unistd::geteuid().is_root()
}
