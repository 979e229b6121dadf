//! System probing and logging initialization.

pub mod cache;

use std::path::PathBuf;

use log::LevelFilter;
use nix::unistd::{sysconf, SysconfVar};

use crate::log_collector::RunLog;

/// Initialize the unified logging pipeline.
///
/// Wires a [`RunLog`] sink as the global logger. Call once, before any
/// worker is spawned; workers inherit the facade.
pub fn initialize_logging(
    log_file: Option<PathBuf>,
    syslog: bool,
    verbose: bool,
) -> Result<(), String> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    RunLog::new(log_file, syslog, level)?.install()
}

/// Host facts the supervisor and the option expander need.
#[derive(Debug, Clone, Copy)]
pub struct HostInfo {
    pub cpus: usize,
    pub page_size: usize,
    pub total_memory: u64,
}

impl HostInfo {
    pub fn probe() -> HostInfo {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as usize)
            .unwrap_or(4096);

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        HostInfo {
            cpus: num_cpus::get(),
            page_size,
            total_memory: sys.total_memory(),
        }
    }
}
