//! Mock implementations for testing.
//!
//! Test doubles for the clock, load probe, broker, and a tracing layer that
//! captures events.

pub mod broker;
pub mod clock;
pub mod layer;
pub mod load;

pub use broker::{PublishedMessage, RecordingBroker};
pub use clock::MockClock;
pub use layer::{CapturedEvent, MockCaptureLayer};
pub use load::MockLoadProbe;
