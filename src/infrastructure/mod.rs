//! Infrastructure layer - external adapters and integrations.
//!
//! This layer provides adapters for:
//! - Clock abstraction (system time vs mock)
//! - Shared key/value stores (sharded in-memory maps, Redis)
//! - Host load probes
//! - Outbox stores (in-memory, SQLite)

pub mod clock;
pub mod load_probe;
pub mod outbox_store;
pub mod storage;

#[cfg(feature = "redis-storage")]
pub mod redis_storage;

#[cfg(feature = "sqlite")]
pub mod sqlite_outbox;

/// Mock implementations for testing.
///
/// This module is only available when the `test-helpers` feature is enabled,
/// or during test builds. It provides controllable test doubles for the
/// clock, load probe, and broker, plus a layer that captures log events.
///
/// To use these mocks in integration tests, add to your `Cargo.toml`:
/// ```toml
/// [dev-dependencies]
/// loadgate = { version = "*", features = ["test-helpers"] }
/// ```
#[cfg(any(test, feature = "test-helpers"))]
pub mod mocks;
