//! Scriptable load probe.

use crate::application::ports::{LoadProbe, ProbeError};
use crate::domain::load::LoadSnapshot;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Load probe returning whatever the test last set.
///
/// # Examples
///
/// ```
/// use loadgate::application::ports::LoadProbe;
/// use loadgate::infrastructure::mocks::MockLoadProbe;
///
/// let probe = MockLoadProbe::new(95.0, 40.0);
/// let snapshot = probe.sample(chrono::Utc::now()).unwrap();
/// assert_eq!(snapshot.cpu_percent, 95.0);
///
/// probe.fail();
/// assert!(probe.sample(chrono::Utc::now()).is_err());
/// assert_eq!(probe.samples(), 2);
/// ```
#[derive(Debug)]
pub struct MockLoadProbe {
    /// None makes every sample fail
    reading: Mutex<Option<(f64, f64)>>,
    samples: AtomicUsize,
}

impl MockLoadProbe {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            reading: Mutex::new(Some((cpu_percent, memory_percent))),
            samples: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64) {
        *self.reading() = Some((cpu_percent, memory_percent));
    }

    /// Make subsequent samples fail with `ProbeError::Unsupported`.
    pub fn fail(&self) {
        *self.reading() = None;
    }

    fn reading(&self) -> MutexGuard<'_, Option<(f64, f64)>> {
        self.reading
            .lock()
            .expect("MockLoadProbe mutex poisoned - a test thread panicked while holding the lock")
    }

    /// Number of times the probe was sampled.
    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }
}

impl Default for MockLoadProbe {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl LoadProbe for MockLoadProbe {
    fn sample(&self, now: DateTime<Utc>) -> Result<LoadSnapshot, ProbeError> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        let reading = *self.reading();

        let (cpu_percent, memory_percent) = reading.ok_or(ProbeError::Unsupported)?;
        Ok(LoadSnapshot {
            cpu_percent,
            memory_percent,
            sampled_at: now,
        })
    }
}
