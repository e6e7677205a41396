//! Domain Ports - Core trait definitions for the RAID lifecycle manager
//!
//! These traits define the boundaries between the domain logic and external
//! systems: the pooled storage engine, block-device enumeration, and the host
//! (reboot, boot markers, user accounts). Adapters implement these traits to
//! provide concrete functionality.

use crate::error::Result;
use crate::hardware::classification::CapacityClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Device Identity
// =============================================================================

/// Hardware-stable identifier of a physical device.
///
/// Derived from the device's model/serial identity (the `/dev/disk/by-id`
/// name), never from OS enumeration order, so it survives reboots and moving
/// the drive to a different bay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for DeviceId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

// =============================================================================
// Pool Types
// =============================================================================

/// Redundancy layout of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidType {
    /// Independent members, capacity is additive, no redundancy
    Storage,
    /// Single-parity group tolerating the loss of one member
    Failsafe,
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaidType::Storage => write!(f, "storage"),
            RaidType::Failsafe => write!(f, "failsafe"),
        }
    }
}

impl std::str::FromStr for RaidType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "storage" => Ok(RaidType::Storage),
            "failsafe" => Ok(RaidType::Failsafe),
            other => Err(crate::error::Error::InvalidSetup(format!(
                "unknown raid type: {}",
                other
            ))),
        }
    }
}

/// Health of a pool or of a single member, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolHealth {
    Online,
    Degraded,
    Faulted,
    Offline,
    Unavail,
    Removed,
    Suspended,
}

impl PoolHealth {
    /// Parse the engine's state string
    pub fn parse(state: &str) -> Option<Self> {
        match state.to_uppercase().as_str() {
            "ONLINE" => Some(PoolHealth::Online),
            "DEGRADED" => Some(PoolHealth::Degraded),
            "FAULTED" => Some(PoolHealth::Faulted),
            "OFFLINE" => Some(PoolHealth::Offline),
            "UNAVAIL" => Some(PoolHealth::Unavail),
            "REMOVED" => Some(PoolHealth::Removed),
            "SUSPENDED" => Some(PoolHealth::Suspended),
            _ => None,
        }
    }

    /// Whether data is still being served
    pub fn is_serving(&self) -> bool {
        matches!(self, PoolHealth::Online | PoolHealth::Degraded)
    }
}

impl std::fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolHealth::Online => "ONLINE",
            PoolHealth::Degraded => "DEGRADED",
            PoolHealth::Faulted => "FAULTED",
            PoolHealth::Offline => "OFFLINE",
            PoolHealth::Unavail => "UNAVAIL",
            PoolHealth::Removed => "REMOVED",
            PoolHealth::Suspended => "SUSPENDED",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Hardware Discovery Types
// =============================================================================

/// A device as reported by one enumeration pass over the bays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbedDevice {
    /// Stable hardware identity
    pub id: DeviceId,
    /// Physical bay number, if the bay map knows the controller
    pub slot: Option<u8>,
    /// OS enumeration path (e.g., /dev/nvme0n1), informational only
    pub device_path: String,
    /// Raw reported capacity
    pub size_bytes: u64,
    /// Model name
    pub model: String,
    /// Serial number
    pub serial: String,
}

/// A physical storage device known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub slot: Option<u8>,
    pub device_path: String,
    pub size_bytes: u64,
    pub size_class: CapacityClass,
    pub model: String,
    pub serial: String,
    /// Whether the device was seen on the last enumeration pass
    pub present: bool,
}

// =============================================================================
// Engine Types
// =============================================================================

/// Kind of background scan the engine is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    /// Rebuilding redundancy onto a new or replaced member
    Resilver,
    /// Reflowing data across a widened redundancy group
    Expand,
}

/// State of a background scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Scanning,
    Finished,
    Canceled,
}

/// Progress of the engine's current (or most recent) scan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub kind: ScanKind,
    pub state: ScanState,
    /// Work done so far, in engine units
    pub done: u64,
    /// Total work, in engine units. May grow while scanning.
    pub total: u64,
}

impl ScanStatus {
    /// Completion as a whole percentage, never above 100
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = (self.done as u128 * 100) / self.total as u128;
        pct.min(100) as u8
    }
}

/// A member vdev as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMember {
    pub id: DeviceId,
    pub health: PoolHealth,
    pub read_errors: u64,
    pub write_errors: u64,
    pub checksum_errors: u64,
}

/// Live view of an imported pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub health: PoolHealth,
    pub raid_type: RaidType,
    pub members: Vec<EngineMember>,
    pub scan: Option<ScanStatus>,
    pub total_space: u64,
    pub used_space: u64,
}

impl EngineStatus {
    /// Find a member by id
    pub fn member(&self, id: &DeviceId) -> Option<&EngineMember> {
        self.members.iter().find(|m| &m.id == id)
    }
}

/// Progress of the pre-reboot data sync of a failsafe migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub written_bytes: u64,
    pub estimated_bytes: u64,
}

impl MigrationProgress {
    /// Completion fraction in [0, 1]
    pub fn fraction(&self) -> f64 {
        if self.estimated_bytes == 0 {
            return 0.0;
        }
        (self.written_bytes as f64 / self.estimated_bytes as f64).clamp(0.0, 1.0)
    }
}

/// A device visible to a trial import of the configured pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCandidate {
    pub id: DeviceId,
    pub healthy: bool,
}

// =============================================================================
// Pool Engine Port
// =============================================================================

/// Port for the pooled copy-on-write storage engine.
///
/// Only the orchestrator mutates the engine. Long-running work (resilver,
/// expansion) is started by a call and then observed through `pool_status`.
#[async_trait]
pub trait PoolEngine: Send + Sync {
    /// Engine name for logs
    fn engine_name(&self) -> &str;

    /// Live status of a pool, `None` if it is not imported
    async fn pool_status(&self, pool: &str) -> Result<Option<EngineStatus>>;

    /// Prepare devices and create a new pool
    async fn create_pool(&self, pool: &str, devices: &[DeviceId], raid_type: RaidType)
        -> Result<()>;

    /// Add a member. Storage pools gain an independent member immediately;
    /// failsafe pools widen the redundancy group and start an expansion scan.
    async fn add_member(&self, pool: &str, device: &DeviceId, raid_type: RaidType) -> Result<()>;

    /// Swap `old` for `new`, starting a resilver onto `new`
    async fn replace_member(&self, pool: &str, old: &DeviceId, new: &DeviceId) -> Result<()>;

    /// Abort an in-flight replace, leaving `old` as the member
    async fn cancel_replace(&self, pool: &str, old: &DeviceId, new: &DeviceId) -> Result<()>;

    /// Grow a member to its full partition size after a replace
    async fn expand_member(&self, pool: &str, device: &DeviceId) -> Result<()>;

    /// Create the degraded redundant layout on `new` and snapshot `pool`.
    /// Returns the estimated number of bytes the sync will transfer.
    async fn prepare_migration(&self, pool: &str, current: &DeviceId, new: &DeviceId)
        -> Result<u64>;

    /// Copy the pool's data onto the migration layout. Runs until done.
    async fn sync_migration(&self, pool: &str) -> Result<()>;

    /// Sync progress, `None` when no migration layout exists
    async fn migration_progress(&self, pool: &str) -> Result<Option<MigrationProgress>>;

    /// Arrange for the boot layer to swap the migration layout in on reboot
    async fn stage_migration(&self, pool: &str) -> Result<()>;

    /// After the reboot: retire the old layout and resilver `original`
    /// into the new redundancy group
    async fn join_migrated_member(&self, pool: &str, original: &DeviceId) -> Result<()>;

    /// Remove every migration artefact after a failure
    async fn abort_migration(&self, pool: &str) -> Result<()>;

    /// Remove leftover migration snapshots after success
    async fn cleanup_migration(&self, pool: &str) -> Result<()>;

    /// Devices a trial import of the pool can see
    async fn import_candidates(&self, pool: &str) -> Result<Vec<ImportCandidate>>;
}

// =============================================================================
// Device Prober Port
// =============================================================================

/// Port for enumerating the fixed internal bays
#[async_trait]
pub trait DeviceProber: Send + Sync {
    /// Enumerate every device currently present
    async fn probe(&self) -> Result<Vec<ProbedDevice>>;
}

// =============================================================================
// Host Control Port
// =============================================================================

/// Port for host-level side effects and boot markers
#[async_trait]
pub trait HostControl: Send + Sync {
    /// Reboot the machine
    async fn reboot(&self) -> Result<()>;

    /// Whether the boot layer reported that the pool failed to mount
    async fn mount_failure_reported(&self) -> Result<bool>;

    /// Whether a user account has been created
    async fn account_exists(&self) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type PoolEngineRef = Arc<dyn PoolEngine>;
pub type DeviceProberRef = Arc<dyn DeviceProber>;
pub type HostControlRef = Arc<dyn HostControl>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raid_type_round_trip_names() {
        assert_eq!(format!("{}", RaidType::Storage), "storage");
        assert_eq!(format!("{}", RaidType::Failsafe), "failsafe");
        assert_eq!("FailSafe".parse::<RaidType>().unwrap(), RaidType::Failsafe);
        assert!("mirror".parse::<RaidType>().is_err());
    }

    #[test]
    fn test_pool_health_parse() {
        assert_eq!(PoolHealth::parse("ONLINE"), Some(PoolHealth::Online));
        assert_eq!(PoolHealth::parse("degraded"), Some(PoolHealth::Degraded));
        assert_eq!(PoolHealth::parse("bogus"), None);
        assert!(PoolHealth::Degraded.is_serving());
        assert!(!PoolHealth::Faulted.is_serving());
    }

    #[test]
    fn test_scan_percent() {
        let scan = ScanStatus {
            kind: ScanKind::Resilver,
            state: ScanState::Scanning,
            done: 50,
            total: 200,
        };
        assert_eq!(scan.percent(), 25);

        let overflow = ScanStatus { done: 300, ..scan };
        assert_eq!(overflow.percent(), 100);

        let empty = ScanStatus { total: 0, ..scan };
        assert_eq!(empty.percent(), 0);
    }

    #[test]
    fn test_migration_fraction() {
        let progress = MigrationProgress {
            written_bytes: 30,
            estimated_bytes: 120,
        };
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);

        let unknown = MigrationProgress {
            written_bytes: 30,
            estimated_bytes: 0,
        };
        assert_eq!(unknown.fraction(), 0.0);
    }
}
