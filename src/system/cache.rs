//! CPU cache topology probe.
//!
//! Reads /sys/devices/system/cpu/cpu0/cache/index*/ so cache-size aliases
//! ("L2", "LLC") in option strings can resolve to real byte sizes. Only
//! data and unified caches count; a missing sysfs tree just yields an empty
//! table and the aliases report UnknownCache.

use std::path::Path;

use crate::parse::parse_bytes;

/// One cache level with its size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLevel {
    pub level: u32,
    pub size: u64,
}

/// Probed cache levels, largest size kept per level.
#[derive(Debug, Clone, Default)]
pub struct CpuCaches {
    levels: Vec<CacheLevel>,
}

impl CpuCaches {
    /// Build a table directly (tests, or platforms probed another way).
    pub fn from_levels(raw: Vec<CacheLevel>) -> CpuCaches {
        let mut levels: Vec<CacheLevel> = Vec::new();
        for entry in raw {
            match levels.iter_mut().find(|l| l.level == entry.level) {
                Some(existing) => existing.size = existing.size.max(entry.size),
                None => levels.push(entry),
            }
        }
        levels.sort_by_key(|l| l.level);
        CpuCaches { levels }
    }

    /// Probe cpu0's cache directory on this host.
    pub fn probe() -> CpuCaches {
        Self::probe_path(Path::new("/sys/devices/system/cpu/cpu0/cache"))
    }

    /// Probe an explicit cache directory (index0, index1, ... children).
    pub fn probe_path(dir: &Path) -> CpuCaches {
        let mut raw = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return CpuCaches::default();
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("index"))
                .unwrap_or(false)
            {
                continue;
            }
            let cache_type = std::fs::read_to_string(path.join("type")).unwrap_or_default();
            let cache_type = cache_type.trim();
            if cache_type != "Data" && cache_type != "Unified" {
                continue;
            }
            let Some(level) = std::fs::read_to_string(path.join("level"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            else {
                continue;
            };
            let Some(size) = std::fs::read_to_string(path.join("size"))
                .ok()
                .and_then(|s| parse_bytes(s.trim(), "cache-size").ok())
            else {
                continue;
            };
            raw.push(CacheLevel { level, size });
        }
        CpuCaches::from_levels(raw)
    }

    /// Size of the given cache level, if probed.
    pub fn level_size(&self, level: u32) -> Option<u64> {
        self.levels
            .iter()
            .find(|l| l.level == level)
            .map(|l| l.size)
    }

    /// Size of the last-level cache, if any level was probed.
    pub fn last_level_size(&self) -> Option<u64> {
        self.levels.last().map(|l| l.size)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
