//! API Module
//!
//! REST endpoints for pool management and boot recovery, plus the
//! server-sent event stream for operation progress.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
