//! Pool Engine Adapters
//!
//! Provides implementations of [`PoolEngine`]:
//! - ZFS: drives `zpool`/`zfs` on the appliance
//! - Simulated: in-memory engine for standalone mode and tests

pub mod simulated;
pub mod zfs;

pub use simulated::*;
pub use zfs::*;

use crate::domain::ports::PoolEngineRef;
use crate::error::{Error, Result};
use std::sync::Arc;

/// Factory for creating pool engines
pub struct EngineFactory;

impl EngineFactory {
    /// Create an engine by name
    pub fn create(name: &str, config: EngineConfig) -> Result<PoolEngineRef> {
        match name.to_lowercase().as_str() {
            "zfs" => Ok(Arc::new(ZfsEngine::new(config.zfs))),
            "simulated" | "sim" => Ok(Arc::new(SimulatedEngine::new(config.simulated))),
            other => Err(Error::Configuration(format!("unknown engine: {}", other))),
        }
    }
}

/// Combined engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub zfs: ZfsConfig,
    pub simulated: SimulatedEngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_by_name() {
        let engine = EngineFactory::create("ZFS", EngineConfig::default()).unwrap();
        assert_eq!(engine.engine_name(), "zfs");

        let engine = EngineFactory::create("simulated", EngineConfig::default()).unwrap();
        assert_eq!(engine.engine_name(), "simulated");

        assert!(EngineFactory::create("btrfs", EngineConfig::default()).is_err());
    }
}
