//! Device Registry Module
//!
//! Tracks every device ever seen in the bays under its stable id, with
//! present/absent state and normalized capacity class.

pub mod device_registry;
pub mod events;

pub use device_registry::*;
pub use events::*;
