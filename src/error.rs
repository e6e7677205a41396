//! Error types for the RAID lifecycle manager
//!
//! Provides structured error types for device discovery, the pool state
//! store, the pooled storage engine and the operation orchestrator.

use thiserror::Error;

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    #[error("device already in array")]
    DeviceAlreadyInArray { device: String },

    #[error("replace target already in array")]
    ReplaceTargetInArray { device: String },

    #[error("transition device already in array")]
    TransitionDeviceInArray { device: String },

    #[error("Device {device} is not in the array")]
    DeviceNotMember { device: String },

    #[error("Operation already in progress: {kind}")]
    OperationInProgress { kind: String },

    #[error("No replace operation is in progress")]
    NoReplaceInProgress,

    #[error("RAID array doesn't exist")]
    PoolMissing,

    #[error("RAID array already exists: {pool}")]
    PoolAlreadyExists { pool: String },

    #[error("Operation requires a {expected} array")]
    WrongRaidType { expected: String },

    #[error("Can only transition single-disk arrays (array has {members} devices)")]
    TransitionRequiresSingleDevice { members: usize },

    #[error("Device {device} is too small: class {class_bytes} bytes, required {required_bytes} bytes")]
    DeviceTooSmall {
        device: String,
        class_bytes: u64,
        required_bytes: u64,
    },

    #[error("Invalid setup request: {0}")]
    InvalidSetup(String),

    // =========================================================================
    // Hardware Discovery Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    #[error("Engine command failed: {command} - {reason}")]
    EngineCommand { command: String, reason: String },

    #[error("Engine status parse error: {0}")]
    EngineStatusParse(String),

    // =========================================================================
    // Boot Integrity Errors
    // =========================================================================
    #[error("Initial RAID setup failed: {0}")]
    InitialSetupFailed(String),

    #[error("Pool descriptor is inconsistent: {0}")]
    InconsistentDescriptor(String),

    // =========================================================================
    // State Store Errors
    // =========================================================================
    #[error("State store error: {0}")]
    StateStore(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any state was mutated
    Precondition,
    /// The pooled storage engine failed
    Engine,
    /// Boot-time integrity problem (missing members, failed setup)
    Integrity,
    /// Persisted state could not be read or written
    Storage,
    /// Bugs and misconfiguration
    Internal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DeviceAlreadyInArray { .. }
            | Error::ReplaceTargetInArray { .. }
            | Error::TransitionDeviceInArray { .. }
            | Error::DeviceNotMember { .. }
            | Error::OperationInProgress { .. }
            | Error::NoReplaceInProgress
            | Error::PoolMissing
            | Error::PoolAlreadyExists { .. }
            | Error::WrongRaidType { .. }
            | Error::TransitionRequiresSingleDevice { .. }
            | Error::DeviceTooSmall { .. }
            | Error::InvalidSetup(_)
            | Error::DeviceNotFound { .. } => ErrorClass::Precondition,

            Error::EngineCommand { .. }
            | Error::EngineStatusParse(_)
            | Error::HardwareDiscovery(_) => ErrorClass::Engine,

            Error::InitialSetupFailed(_) | Error::InconsistentDescriptor(_) => {
                ErrorClass::Integrity
            }

            Error::StateStore(_) | Error::JsonParse(_) | Error::YamlParse(_) | Error::Io(_) => {
                ErrorClass::Storage
            }

            Error::Internal(_) | Error::Configuration(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error was a synchronous precondition rejection
    pub fn is_precondition(&self) -> bool {
        self.class() == ErrorClass::Precondition
    }

    /// Check if this error is worth an explicit retry by the caller.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OperationInProgress { .. } | Error::EngineCommand { .. } | Error::Io(_)
        )
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;
