//! Boot Recovery
//!
//! Runs once at process start: refreshes the device registry, resumes any
//! operation left in the store, and answers the boot-time integrity
//! queries used by the recovery UI.

use crate::controlplane::metrics::RaidMetrics;
use crate::controlplane::orchestrator::OperationOrchestrator;
use crate::domain::operation::OperationRecord;
use crate::domain::ports::{DeviceId, HostControlRef, PoolEngineRef};
use crate::error::{Error, Result};
use crate::hardware::registry::DeviceRegistry;
use crate::store::StateStoreRef;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether one expected pool member was seen at boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MountDeviceStatus {
    pub id: DeviceId,
    pub is_ok: bool,
}

/// Outcome of the startup pass
#[derive(Debug, Clone)]
pub struct StartupReport {
    pub pool_exists: bool,
    pub mount_failure: bool,
    /// The operation found in the active slot, as it was found
    pub resumed: Option<OperationRecord>,
}

/// Startup checks and resume
pub struct BootRecoveryChecker {
    orchestrator: Arc<OperationOrchestrator>,
    registry: Arc<DeviceRegistry>,
    store: StateStoreRef,
    engine: PoolEngineRef,
    host: HostControlRef,
    metrics: Arc<RaidMetrics>,
}

impl BootRecoveryChecker {
    pub fn new(
        orchestrator: Arc<OperationOrchestrator>,
        registry: Arc<DeviceRegistry>,
        store: StateStoreRef,
        engine: PoolEngineRef,
        host: HostControlRef,
        metrics: Arc<RaidMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            registry,
            store,
            engine,
            host,
            metrics,
        })
    }

    /// Refresh devices and resume whatever the previous process left running
    pub async fn run_startup(&self) -> Result<StartupReport> {
        if let Err(e) = self.registry.refresh().await {
            warn!(error = %e, "Device enumeration failed at startup");
        }

        let pool = self.store.read_pool_descriptor().await?;
        self.metrics.set_pool_members(pool.members.len());

        let mount_failure = self.check_mount_failure().await?;
        if mount_failure {
            warn!(pool = ?pool.pool_name, "Pool failed to mount at boot");
        }

        let resumed = self.orchestrator.resume().await?;
        info!(
            pool = ?pool.pool_name,
            members = pool.members.len(),
            resumed = resumed.as_ref().map(|r| r.kind_name()),
            "Startup recovery finished"
        );

        Ok(StartupReport {
            pool_exists: pool.exists(),
            mount_failure,
            resumed,
        })
    }

    /// True when the configured pool failed to assemble at boot
    pub async fn check_mount_failure(&self) -> Result<bool> {
        if self.host.mount_failure_reported().await? {
            return Ok(true);
        }

        let pool = self.store.read_pool_descriptor().await?;
        let Some(name) = pool.pool_name.as_deref() else {
            return Ok(false);
        };

        match self.engine.pool_status(name).await {
            Ok(Some(status)) => Ok(!status.health.is_serving()),
            Ok(None) => Ok(true),
            Err(e) => {
                warn!(pool = name, error = %e, "Cannot query pool, treating as not mounted");
                Ok(true)
            }
        }
    }

    /// Per-member presence for every device the descriptor expects
    pub async fn check_mount_failure_devices(&self) -> Result<Vec<MountDeviceStatus>> {
        if let Err(e) = self.registry.refresh().await {
            warn!(error = %e, "Device enumeration failed");
        }

        let pool = self.store.read_pool_descriptor().await?;
        let Some(name) = pool.pool_name.as_deref() else {
            return Ok(Vec::new());
        };

        let candidates = match self.engine.import_candidates(name).await {
            Ok(candidates) => Some(candidates),
            Err(e) => {
                debug!(pool = name, error = %e, "Import probe failed, using presence only");
                None
            }
        };

        Ok(pool
            .members
            .iter()
            .map(|member| {
                let probe_ok = candidates
                    .as_ref()
                    .and_then(|c| c.iter().find(|c| c.id == member.id))
                    .map(|c| c.healthy)
                    .unwrap_or(true);
                MountDeviceStatus {
                    id: member.id.clone(),
                    is_ok: self.registry.is_present(&member.id) && probe_ok,
                }
            })
            .collect())
    }

    /// Whether first-boot pool creation is done.
    ///
    /// Errors when the last setup attempt failed.
    pub async fn check_initial_raid_setup_status(&self) -> Result<bool> {
        if let Some(message) = self.store.read_setup_failure().await? {
            return Err(Error::InitialSetupFailed(message));
        }
        if !self.store.read_pool_descriptor().await?.exists() {
            return Ok(false);
        }
        self.host.account_exists().await
    }
}
