//! Mock clock for testing.

use crate::application::ports::Clock;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Mock clock for testing.
///
/// Allows tests to control time progression explicitly, enabling deterministic
/// testing of token refill, circuit timeouts, and cache expiry.
///
/// # Examples
///
/// ```
/// use loadgate::infrastructure::mocks::MockClock;
/// use loadgate::application::ports::Clock;
/// use std::time::Duration;
///
/// let clock = MockClock::default();
/// let start = clock.now();
///
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(clock.now(), start + chrono::Duration::seconds(10));
/// ```
///
/// # Thread Safety
///
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific time.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.time() += delta(duration);
    }

    /// Move the clock backwards, as an NTP correction would.
    pub fn rewind(&self, duration: Duration) {
        *self.time() -= delta(duration);
    }

    /// Set the clock to a specific time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time() = time;
    }

    fn time(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl Default for MockClock {
    /// Noon UTC on a fixed date, so day partitions are predictable.
    fn default() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 15, 12, 0, 0)
            .single()
            .expect("fixed start date is valid");
        Self::new(start)
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time()
    }
}
