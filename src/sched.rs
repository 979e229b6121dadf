//! Scheduler-policy adapter.
//!
//! One uniform call applied by workers after fork (and re-applied by
//! stressors that fork children of their own). Policies unsupported on the
//! host are a logged no-op rather than a worker failure; only a priority
//! outside the policy's valid range is an error.

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::error::SchedError;

// Not exported by libc for every target; values are ABI-stable on Linux.
const SCHED_DEADLINE: libc::c_int = 6;
const SCHED_EXT: libc::c_int = 7;

/// Scheduling policies a run plan may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    Batch,
    Deadline,
    Fifo,
    Idle,
    Other,
    Rr,
    /// sched_ext (BPF-extensible scheduling class), Linux only
    Ext,
}

impl SchedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedPolicy::Batch => "batch",
            SchedPolicy::Deadline => "deadline",
            SchedPolicy::Fifo => "fifo",
            SchedPolicy::Idle => "idle",
            SchedPolicy::Other => "other",
            SchedPolicy::Rr => "rr",
            SchedPolicy::Ext => "ext",
        }
    }

    pub fn from_name(name: &str) -> Option<SchedPolicy> {
        match name.to_ascii_lowercase().as_str() {
            "batch" => Some(SchedPolicy::Batch),
            "deadline" => Some(SchedPolicy::Deadline),
            "fifo" => Some(SchedPolicy::Fifo),
            "idle" => Some(SchedPolicy::Idle),
            "other" => Some(SchedPolicy::Other),
            "rr" => Some(SchedPolicy::Rr),
            "ext" => Some(SchedPolicy::Ext),
            _ => None,
        }
    }

    fn raw(&self) -> libc::c_int {
        match self {
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Deadline => SCHED_DEADLINE,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Rr => libc::SCHED_RR,
            SchedPolicy::Ext => SCHED_EXT,
        }
    }

    /// Real-time policies take a priority; everything else runs at 0.
    pub fn is_realtime(&self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }
}

impl std::fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// sched_setattr(2) parameters for SCHED_DEADLINE, carried by settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineAttrs {
    pub runtime_ns: u64,
    pub deadline_ns: u64,
    pub period_ns: u64,
}

#[repr(C)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
}

/// Valid static-priority range for a policy on this host.
pub fn priority_range(policy: SchedPolicy) -> (i32, i32) {
    let raw = policy.raw();
    let min = unsafe { libc::sched_get_priority_min(raw) };
    let max = unsafe { libc::sched_get_priority_max(raw) };
    // A policy the kernel rejects reports (0, 0); the caller treats the
    // whole application as a no-op anyway.
    (min.max(0), max.max(0))
}

/// Resolve the effective priority for a policy.
///
/// `None` (undefined) picks the midpoint of the valid range, or the maximum
/// under the aggressive flag. An explicit priority outside the range is
/// `InvalidPriority`.
pub fn resolve_priority(
    policy: SchedPolicy,
    priority: Option<i32>,
    aggressive: bool,
) -> Result<i32, SchedError> {
    if !policy.is_realtime() {
        return Ok(0);
    }
    let (min, max) = priority_range(policy);
    match priority {
        None => {
            if aggressive {
                Ok(max)
            } else {
                Ok(min + (max - min) / 2)
            }
        }
        Some(p) if p < min || p > max => Err(SchedError::InvalidPriority {
            policy: policy.as_str(),
            prio: p,
            min,
            max,
        }),
        Some(p) => Ok(p),
    }
}

fn set_deadline(pid: Pid, attrs: &DeadlineAttrs) -> Result<(), nix::errno::Errno> {
    let attr = SchedAttr {
        size: std::mem::size_of::<SchedAttr>() as u32,
        sched_policy: SCHED_DEADLINE as u32,
        sched_flags: 0,
        sched_nice: 0,
        sched_priority: 0,
        sched_runtime: attrs.runtime_ns,
        sched_deadline: attrs.deadline_ns,
        sched_period: attrs.period_ns,
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_sched_setattr,
            pid.as_raw() as libc::c_long,
            &attr as *const SchedAttr,
            0 as libc::c_long,
        )
    };
    if rc < 0 {
        Err(nix::errno::Errno::last())
    } else {
        Ok(())
    }
}

fn set_scheduler(pid: Pid, policy: SchedPolicy, prio: i32) -> Result<(), nix::errno::Errno> {
    let param = libc::sched_param {
        sched_priority: prio,
    };
    let rc = unsafe { libc::sched_setscheduler(pid.as_raw(), policy.raw(), &param) };
    if rc < 0 {
        Err(nix::errno::Errno::last())
    } else {
        Ok(())
    }
}

/// Apply a scheduling policy and priority to a process.
///
/// Unsupported or unprivileged combinations (EINVAL, ENOSYS, EPERM) are a
/// no-op with a log line; `quiet` drops the log line. Only an out-of-range
/// explicit priority, or a genuine failure such as ESRCH, is an error.
pub fn apply_policy(
    pid: Pid,
    policy: SchedPolicy,
    priority: Option<i32>,
    aggressive: bool,
    deadline: Option<DeadlineAttrs>,
    quiet: bool,
) -> Result<(), SchedError> {
    let prio = resolve_priority(policy, priority, aggressive)?;

    let result = if policy == SchedPolicy::Deadline {
        let Some(attrs) = deadline else {
            if !quiet {
                log::warn!("sched: deadline policy without period/runtime/deadline, skipping");
            }
            return Ok(());
        };
        set_deadline(pid, &attrs)
    } else {
        set_scheduler(pid, policy, prio)
    };

    match result {
        Ok(()) => {
            if !quiet {
                log::debug!("sched: pid {} now {} prio {}", pid, policy, prio);
            }
            Ok(())
        }
        Err(errno @ (nix::errno::Errno::EINVAL
        | nix::errno::Errno::ENOSYS
        | nix::errno::Errno::EPERM
        | nix::errno::Errno::EOPNOTSUPP)) => {
            // Host without the policy, or not enough privilege: the worker
            // keeps its inherited policy.
            if !quiet {
                log::info!(
                    "sched: {} not applied to pid {} ({}), continuing",
                    policy,
                    pid,
                    errno
                );
            }
            Ok(())
        }
        Err(errno) => Err(SchedError::SetFailed {
            policy: policy.as_str(),
            errno,
        }),
    }
}
