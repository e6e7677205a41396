//! RAID Control Plane Module
//!
//! Coordinates the pool engine, the host and the state store to run setup,
//! expansion, replacement and the failsafe transition, and reports their
//! progress.

pub mod api;
pub mod engine;
pub mod host;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod recovery;

pub use api::*;
pub use engine::*;
pub use host::*;
pub use metrics::*;
pub use orchestrator::*;
pub use progress::*;
pub use recovery::*;
