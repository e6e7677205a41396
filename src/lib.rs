//! RAID Lifecycle Manager
//!
//! Manages the storage pool of a multi-bay appliance: initial setup, adding
//! devices, replacing devices, and the in-place conversion of a single-disk
//! storage pool into a redundant failsafe pool that survives a reboot in
//! the middle of the conversion.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          REST API / SSE topics                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐        ┌────────────────────────────────┐ │
//! │  │  Operation Orchestrator  │◄───────│     Boot Recovery Checker      │ │
//! │  │  (one operation at once) │        │  (resume, mount checks)        │ │
//! │  └─────┬──────────┬─────────┘        └────────────────────────────────┘ │
//! │        │          │                                                     │
//! │        │    ┌─────┴──────────────┐     ┌─────────────────────────────┐  │
//! │        │    │  Progress writer   │────►│  Progress event bus (push)  │  │
//! │        │    └─────┬──────────────┘     └─────────────────────────────┘  │
//! │        │          │                                                     │
//! │  ┌─────┴───────┐ ┌┴────────────┐ ┌───────────────┐ ┌──────────────────┐ │
//! │  │ Pool engine │ │ State store │ │ Host control  │ │ Device registry  │ │
//! │  │ (zfs / sim) │ │ (file/mem)  │ │ (reboot etc.) │ │ (bays, classes)  │ │
//! │  └─────────────┘ └─────────────┘ └───────────────┘ └──────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, recovery, engines, progress and the API
//! - [`hardware`]: bay discovery, capacity classes and the device registry
//! - [`store`]: durable pool descriptor and operation records
//! - [`domain`]: core domain types and traits
//! - [`error`]: error types and handling

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BootRecoveryChecker, EngineConfig, EngineFactory, HostConfig,
    ManagerConfig, OperationOrchestrator, PoolStatus, ProgressEventBus, RaidMetrics,
    RecordingHost, SimulatedBays, SimulatedEngine, StartupReport, SystemHost, ZfsConfig,
};

pub use domain::{
    Device, DeviceId, DeviceProber, HostControl, OperationKind, OperationRecord, PoolDescriptor,
    PoolEngine, PoolMember, ProgressEvent, ProgressState, ProgressTopic, RaidType,
};

pub use error::{Error, ErrorClass, Result};

pub use hardware::{BayScanner, CapacityClass, DeviceRegistry, RegistryEvent, ScannerConfig};

pub use store::{FileStateStore, MemoryStateStore, StateStore, StateStoreRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
