//! Hardware Discovery Module
//!
//! Discovers the NVMe devices in the internal bays.

pub mod scanner;

pub use scanner::*;
