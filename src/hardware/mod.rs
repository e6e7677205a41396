//! Hardware Module
//!
//! Bay discovery, capacity classification and the device registry.

pub mod classification;
pub mod discovery;
pub mod registry;

pub use classification::*;
pub use discovery::*;
pub use registry::*;
