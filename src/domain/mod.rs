//! Domain layer - Core types and port definitions
//!
//! This module defines the pool and operation records shared by every
//! component, and the traits (ports) that adapters implement, following
//! hexagonal architecture principles.

pub mod operation;
pub mod pool;
pub mod ports;

pub use operation::*;
pub use pool::*;
pub use ports::*;
