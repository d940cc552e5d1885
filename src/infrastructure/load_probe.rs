//! Host load probes.
//!
//! Two ways to measure utilisation behind the one [`LoadProbe`] port:
//!
//! - [`LoadAverageProbe`] converts the 1-minute load average to a percentage
//!   of the CPU count and reads memory from `/proc/meminfo`. POSIX hosts only.
//! - [`SysinfoProbe`] reads CPU and memory counters directly through
//!   `sysinfo`, on any platform it supports.

use crate::application::ports::{LoadProbe, ProbeError};
use crate::domain::load::LoadSnapshot;
use chrono::{DateTime, Utc};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use sysinfo::System;

/// Load-average based probe.
#[derive(Debug, Clone)]
pub struct LoadAverageProbe {
    loadavg_path: PathBuf,
    meminfo_path: PathBuf,
    cpu_count: usize,
}

impl LoadAverageProbe {
    pub fn new() -> Self {
        Self::with_paths("/proc/loadavg", "/proc/meminfo")
    }

    /// Read from alternative files (containers, tests).
    pub fn with_paths(loadavg: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        let cpu_count = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            loadavg_path: loadavg.into(),
            meminfo_path: meminfo.into(),
            cpu_count,
        }
    }

    pub fn with_cpu_count(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count.max(1);
        self
    }

    fn cpu_percent(&self) -> Result<f64, ProbeError> {
        let raw = std::fs::read_to_string(&self.loadavg_path)?;
        let load1: f64 = raw
            .split_whitespace()
            .next()
            .ok_or_else(|| ProbeError::Parse("empty load average".into()))?
            .parse()
            .map_err(|e| ProbeError::Parse(format!("bad load average: {e}")))?;
        Ok(load1 / self.cpu_count as f64 * 100.0)
    }

    fn memory_percent(&self) -> Result<f64, ProbeError> {
        let raw = std::fs::read_to_string(&self.meminfo_path)?;
        Ok(parse_meminfo(&raw))
    }
}

impl Default for LoadAverageProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Used percentage from `MemTotal` and `MemAvailable`; zero if either is missing.
fn parse_meminfo(raw: &str) -> f64 {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|value| value.parse().ok())
    };

    match (field("MemTotal"), field("MemAvailable")) {
        (Some(total), Some(available)) if total > 0.0 => (total - available) / total * 100.0,
        _ => 0.0,
    }
}

impl LoadProbe for LoadAverageProbe {
    fn sample(&self, now: DateTime<Utc>) -> Result<LoadSnapshot, ProbeError> {
        Ok(LoadSnapshot {
            cpu_percent: self.cpu_percent()?,
            memory_percent: self.memory_percent()?,
            sampled_at: now,
        })
    }
}

/// Counter-based probe using `sysinfo`.
///
/// CPU usage is measured between consecutive samples, so the first sample
/// after construction reports the usage since the probe was created.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysinfoProbe").finish_non_exhaustive()
    }
}

impl LoadProbe for SysinfoProbe {
    fn sample(&self, now: DateTime<Utc>) -> Result<LoadSnapshot, ProbeError> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| ProbeError::Parse("sysinfo state poisoned".into()))?;
        system.refresh_cpu();
        system.refresh_memory();

        if system.cpus().is_empty() {
            return Err(ProbeError::Unsupported);
        }

        let total = system.total_memory();
        let memory_percent = if total > 0 {
            total.saturating_sub(system.available_memory()) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(LoadSnapshot {
            cpu_percent: f64::from(system.global_cpu_info().cpu_usage()),
            memory_percent,
            sampled_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB
MemFree:         1000000 kB
MemAvailable:    4000000 kB
";

    #[test]
    fn test_parse_meminfo() {
        assert_eq!(parse_meminfo(MEMINFO), 75.0);
        assert_eq!(parse_meminfo("MemFree: 10 kB\n"), 0.0);
    }

    #[test]
    fn test_load_average_probe() {
        let dir = tempfile::tempdir().unwrap();
        let loadavg = dir.path().join("loadavg");
        let meminfo = dir.path().join("meminfo");
        std::fs::write(&loadavg, "3.40 2.10 1.00 2/345 6789\n").unwrap();
        std::fs::write(&meminfo, MEMINFO).unwrap();

        let probe = LoadAverageProbe::with_paths(&loadavg, &meminfo).with_cpu_count(4);
        let now = Utc::now();
        let snapshot = probe.sample(now).unwrap();

        assert!((snapshot.cpu_percent - 85.0).abs() < 1e-9);
        assert_eq!(snapshot.memory_percent, 75.0);
        assert_eq!(snapshot.sampled_at, now);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let probe = LoadAverageProbe::with_paths("/nonexistent/loadavg", "/nonexistent/meminfo");
        assert!(matches!(probe.sample(Utc::now()), Err(ProbeError::Io(_))));
    }

    #[test]
    fn test_malformed_load_average() {
        let dir = tempfile::tempdir().unwrap();
        let loadavg = dir.path().join("loadavg");
        std::fs::write(&loadavg, "not-a-number").unwrap();

        let probe = LoadAverageProbe::with_paths(&loadavg, "/nonexistent/meminfo");
        assert!(matches!(probe.sample(Utc::now()), Err(ProbeError::Parse(_))));
    }
}
