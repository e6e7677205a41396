//! Hardware Classification Module
//!
//! Normalizes device capacities into comparable classes.

pub mod capacity;

pub use capacity::*;
