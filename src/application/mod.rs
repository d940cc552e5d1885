//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain types against the shared store:
//! - Admission checks (adaptive throttler, priority rate limiter, circuit breaker)
//! - Admission pipeline combining the checks
//! - Metrics time series, alerting, and health monitoring
//! - Outbox relay and the shutdown handle for background loops
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod alerts;
pub mod circuit_breaker;
pub mod metrics;
pub mod monitor;
pub mod outbox;
pub mod pipeline;
pub mod ports;
pub mod rate_limiter;
pub mod shutdown;
pub mod stats;
pub mod status;
pub mod throttler;
pub mod timeseries;
