//! Domain layer - pure types and state machines with no I/O.
//!
//! - Token bucket refill math and priority classes
//! - Circuit breaker transitions
//! - Host load thresholds
//! - Outbox message lifecycle
//! - Metric samples and request summaries
//! - Alert kinds and rules
//!
//! All types in this layer take the current time as an argument and are
//! easily testable.

pub mod alert;
pub mod bucket;
pub mod circuit;
pub mod load;
pub mod outbox;
pub mod sample;
