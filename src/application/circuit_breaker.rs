//! Per-dependency circuit breakers on the shared store.
//!
//! Each dependency's [`CircuitRecord`] lives at `circuit_breaker:<name>` and
//! every transition runs inside one atomic store update, so all workers
//! sharing the store see the same circuit. Calls are rejected without being
//! attempted while the circuit is open; those rejections are not failures.
//!
//! If the store itself is unreachable the breaker fails open: the operation
//! runs and the outcome is logged but not recorded.

use crate::application::alerts::AlertManager;
use crate::application::ports::{Clock, KeyValueStore, KeyValueStoreExt, Mutation, StoreError};
use crate::domain::alert::AlertKind;
use crate::domain::circuit::{CircuitConfig, CircuitRecord, CircuitState, Dependency, Transition};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "circuit_breaker:";

/// Idle circuit records are dropped after this long.
pub const RECORD_TTL: Duration = Duration::from_secs(3600);

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// The circuit is open; the operation was not attempted
    #[error("circuit open for {0}")]
    Open(Dependency),
    /// The operation ran and failed; the failure was recorded
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(e) => Some(e),
            CallError::Open(_) => None,
        }
    }
}

/// Circuit breaker for any number of dependencies.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CircuitConfig,
    alerts: Option<Arc<AlertManager>>,
}

impl CircuitBreaker {
    /// Create a circuit breaker with default thresholds.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, CircuitConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: CircuitConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            alerts: None,
        }
    }

    /// Raise [`AlertKind::CircuitOpened`] whenever a circuit opens.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn key(dependency: &Dependency) -> String {
        format!("{KEY_PREFIX}{dependency}")
    }

    /// Apply `event` to the stored record, moving Open to HalfOpen first if due.
    fn apply<F>(&self, dependency: &Dependency, mut event: F) -> Result<CircuitRecord, StoreError>
    where
        F: FnMut(&mut CircuitRecord, &CircuitConfig, DateTime<Utc>) -> Option<Transition>,
    {
        let now = self.clock.now();
        let config = self.config;

        let step = |record: &mut CircuitRecord| {
            let before = *record;
            let polled = record.poll(&config, now);
            let applied = event(record, &config, now);
            let transitions = (polled, applied);
            if *record == before {
                Mutation::Keep((*record, transitions))
            } else {
                Mutation::Write((*record, transitions))
            }
        };
        let (record, transitions) = self.store.update(&Self::key(dependency), RECORD_TTL, step)?;

        for transition in [transitions.0, transitions.1].into_iter().flatten() {
            self.on_transition(dependency, transition);
        }
        Ok(record)
    }

    fn on_transition(&self, dependency: &Dependency, transition: Transition) {
        match transition.to {
            CircuitState::Open => {
                tracing::warn!(
                    dependency = %dependency,
                    from = %transition.from,
                    open_secs = self.config.open_duration.as_secs_f64(),
                    "Circuit opened"
                );
                if let Some(alerts) = &self.alerts {
                    alerts.send_alert(
                        AlertKind::CircuitOpened,
                        format!("Circuit breaker opened for {dependency}"),
                        json!({
                            "dependency": dependency.name(),
                            "from": transition.from,
                            "failure_threshold": self.config.failure_threshold,
                        }),
                    );
                }
            }
            CircuitState::HalfOpen => {
                tracing::info!(dependency = %dependency, "Circuit half-open, probing");
            }
            CircuitState::Closed => tracing::info!(dependency = %dependency, "Circuit closed"),
        }
    }

    /// Current state, moving Open to HalfOpen once the open duration elapsed.
    pub fn state(&self, dependency: &Dependency) -> Result<CircuitState, StoreError> {
        Ok(self.apply(dependency, |_, _, _| None)?.state)
    }

    pub fn is_open(&self, dependency: &Dependency) -> Result<bool, StoreError> {
        Ok(self.state(dependency)? == CircuitState::Open)
    }

    /// Stored record without triggering any transition.
    pub fn record(&self, dependency: &Dependency) -> Result<CircuitRecord, StoreError> {
        Ok(self.store.load(&Self::key(dependency))?.unwrap_or_default())
    }

    /// Time left before an open circuit starts probing; None unless Open.
    pub fn retry_after(&self, dependency: &Dependency) -> Result<Option<Duration>, StoreError> {
        let record = self.record(dependency)?;
        if record.state != CircuitState::Open {
            return Ok(None);
        }
        let opened_at_ms = record.opened_at_ms.unwrap_or(0);
        let elapsed_ms = (self.clock.now().timestamp_millis() - opened_at_ms).max(0);
        let elapsed = Duration::from_millis(elapsed_ms.unsigned_abs());
        Ok(Some(self.config.open_duration.saturating_sub(elapsed)))
    }

    pub fn record_success(&self, dependency: &Dependency) -> Result<CircuitState, StoreError> {
        Ok(self.apply(dependency, CircuitRecord::on_success)?.state)
    }

    pub fn record_failure(&self, dependency: &Dependency) -> Result<CircuitState, StoreError> {
        Ok(self.apply(dependency, CircuitRecord::on_failure)?.state)
    }

    /// Close the circuit and clear its counters. Returns true if a record existed.
    pub fn reset(&self, dependency: &Dependency) -> Result<bool, StoreError> {
        let existed = self.store.remove(&Self::key(dependency))?;
        if existed {
            tracing::info!(dependency = %dependency, "Circuit reset");
        }
        Ok(existed)
    }

    /// Whether a call may go ahead. Fails open when the store is unavailable.
    fn permits(&self, dependency: &Dependency) -> bool {
        match self.is_open(dependency) {
            Ok(open) => !open,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    dependency = %dependency,
                    "Circuit state unavailable, allowing call"
                );
                true
            }
        }
    }

    fn report(&self, dependency: &Dependency, success: bool) {
        let recorded = if success {
            self.record_success(dependency)
        } else {
            self.record_failure(dependency)
        };
        if let Err(e) = recorded {
            tracing::warn!(
                error = %e,
                dependency = %dependency,
                success,
                "Failed to record call outcome"
            );
        }
    }

    /// Run `op` through the circuit for `dependency`.
    ///
    /// # Errors
    /// `CallError::Open` if the circuit is open (op not invoked), or
    /// `CallError::Inner` with op's own error after recording the failure.
    pub fn call<T, E, F>(&self, dependency: &Dependency, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.permits(dependency) {
            return Err(CallError::Open(dependency.clone()));
        }

        let result = op();
        self.report(dependency, result.is_ok());
        result.map_err(CallError::Inner)
    }

    /// Async counterpart of [`CircuitBreaker::call`].
    pub async fn call_async<T, E, Fut>(
        &self,
        dependency: &Dependency,
        op: Fut,
    ) -> Result<T, CallError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.permits(dependency) {
            return Err(CallError::Open(dependency.clone()));
        }

        let result = op.await;
        self.report(dependency, result.is_ok());
        result.map_err(CallError::Inner)
    }
}
