//! Wall clock for production.
//!
//! State written to a shared store is stamped with UTC wall time, since
//! every worker must read the same timestamps. Tests use `MockClock` from
//! [`crate::infrastructure::mocks`] instead.

use crate::application::ports::Clock;
use chrono::{DateTime, Utc};

/// Reads the host's UTC time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
