//! Host load snapshots and overload thresholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time host utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Which resource tripped the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => f.write_str("CPU"),
            Resource::Memory => f.write_str("Memory"),
        }
    }
}

/// An exceeded threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Overload {
    pub resource: Resource,
    pub value: f64,
    pub threshold: f64,
}

/// Utilisation percentages above which admission is refused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Default for ThrottleThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 70.0,
            memory_percent: 80.0,
        }
    }
}

impl ThrottleThresholds {
    /// Check CPU first, then memory. Equal to the threshold is not overloaded.
    pub fn evaluate(&self, snapshot: &LoadSnapshot) -> Option<Overload> {
        if snapshot.cpu_percent > self.cpu_percent {
            return Some(Overload {
                resource: Resource::Cpu,
                value: snapshot.cpu_percent,
                threshold: self.cpu_percent,
            });
        }
        if snapshot.memory_percent > self.memory_percent {
            return Some(Overload {
                resource: Resource::Memory,
                value: snapshot.memory_percent,
                threshold: self.memory_percent,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: f64, memory: f64) -> LoadSnapshot {
        LoadSnapshot {
            cpu_percent: cpu,
            memory_percent: memory,
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_cpu_over_threshold() {
        let thresholds = ThrottleThresholds::default();
        let overload = thresholds.evaluate(&snapshot(85.0, 10.0)).unwrap();
        assert_eq!(overload.resource, Resource::Cpu);
        assert_eq!(overload.value, 85.0);
    }

    #[test]
    fn test_memory_over_threshold() {
        let thresholds = ThrottleThresholds::default();
        let overload = thresholds.evaluate(&snapshot(10.0, 95.0)).unwrap();
        assert_eq!(overload.resource, Resource::Memory);
    }

    #[test]
    fn test_within_thresholds() {
        let thresholds = ThrottleThresholds::default();
        assert_eq!(thresholds.evaluate(&snapshot(50.0, 50.0)), None);
        assert_eq!(thresholds.evaluate(&snapshot(70.0, 80.0)), None);
    }
}
