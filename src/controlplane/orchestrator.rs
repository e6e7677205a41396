//! Operation Orchestrator
//!
//! The only component that mutates the pool engine. It runs the state
//! machines for initial setup, AddDevice, ReplaceDevice and
//! TransitionToFailsafe:
//! - precondition checks run synchronously, before any state is written
//! - a single operation may hold the store's active slot at a time
//! - background monitors poll the engine and report through one
//!   [`ProgressWriter`] per operation

use crate::controlplane::metrics::RaidMetrics;
use crate::controlplane::progress::{
    rebuild_phase_progress, sync_phase_progress, PoolStatus, ProgressEventBus, ProgressWriter,
    RebuildMonitor, StatusReader,
};
use crate::domain::operation::{
    ExpansionState, OperationKind, OperationRecord, ProgressState, ReplaceState, TransitionState,
    REBOOT_PROGRESS, REBUILD_START_PROGRESS,
};
use crate::domain::pool::{PoolDescriptor, PoolMember};
use crate::domain::ports::{
    Device, DeviceId, HostControlRef, PoolEngineRef, PoolHealth, RaidType, ScanKind, ScanState,
};
use crate::error::{Error, Result};
use crate::hardware::classification::CapacityClass;
use crate::hardware::registry::DeviceRegistry;
use crate::store::StateStoreRef;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of an add or replace whose engine call never happened
const NOT_SUBMITTED: &str = "interrupted before the engine accepted the device";

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for the orchestrator and boot recovery
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Prefix of generated pool names
    pub pool_base_name: String,
    /// Interval between engine polls while an operation runs
    pub poll_interval: Duration,
    /// Pause between persisting `rebooting` and requesting the reboot
    pub reboot_delay: Duration,
    /// Interval of the background rebuild monitor
    pub pool_monitor_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_base_name: "raid".to_string(),
            poll_interval: Duration::from_secs(2),
            reboot_delay: Duration::from_secs(5),
            pool_monitor_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives every pool mutation
pub struct OperationOrchestrator {
    config: ManagerConfig,
    registry: Arc<DeviceRegistry>,
    store: StateStoreRef,
    engine: PoolEngineRef,
    host: HostControlRef,
    bus: Arc<ProgressEventBus>,
    metrics: Arc<RaidMetrics>,
    status: StatusReader,
    /// Serializes precondition checks with claiming the operation slot
    admission: Mutex<()>,
    /// Cancels the running replace monitor
    replace_cancel: parking_lot::Mutex<Option<CancellationToken>>,
    /// Stops background monitors without finishing their operations
    shutdown: CancellationToken,
}

impl OperationOrchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: ManagerConfig,
        registry: Arc<DeviceRegistry>,
        store: StateStoreRef,
        engine: PoolEngineRef,
        host: HostControlRef,
        bus: Arc<ProgressEventBus>,
        metrics: Arc<RaidMetrics>,
    ) -> Arc<Self> {
        let status = StatusReader::new(store.clone(), engine.clone(), registry.clone());
        Arc::new(Self {
            config,
            registry,
            store,
            engine,
            host,
            bus,
            metrics,
            status,
            admission: Mutex::new(()),
            replace_cancel: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<ProgressEventBus> {
        &self.bus
    }

    /// Composed pool status; never fails because of the engine
    pub async fn status(&self) -> Result<PoolStatus> {
        self.status.current_status().await
    }

    /// Publish resilvers the engine starts on its own until shutdown
    pub fn spawn_rebuild_monitor(&self) {
        let monitor = RebuildMonitor::new(
            self.status.clone(),
            self.bus.clone(),
            self.config.pool_monitor_interval,
        );
        tokio::spawn(monitor.run(self.shutdown.clone()));
    }

    /// Stop background monitors. Running operations stay in the store and
    /// are resumed by the next process.
    pub fn shutdown(&self) {
        info!("Stopping operation monitors");
        self.shutdown.cancel();
    }

    // =========================================================================
    // Initial Setup
    // =========================================================================

    /// Create the pool from `devices`
    pub async fn setup(&self, devices: &[DeviceId], raid_type: RaidType) -> Result<PoolDescriptor> {
        let _admission = self.admission.lock().await;

        let pool = self.store.read_pool_descriptor().await?;
        if let Some(name) = &pool.pool_name {
            return Err(Error::PoolAlreadyExists { pool: name.clone() });
        }
        self.ensure_idle().await?;

        if devices.is_empty() {
            return Err(Error::InvalidSetup("at least one device is required".into()));
        }
        if raid_type == RaidType::Failsafe && devices.len() < 2 {
            return Err(Error::InvalidSetup(
                "a failsafe array needs at least two devices".into(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|id| !seen.insert(*id)) {
            return Err(Error::InvalidSetup(format!("device {} listed twice", dup)));
        }

        self.refresh_registry().await;
        let members = devices
            .iter()
            .map(|id| {
                self.registry
                    .present_device(id)
                    .map(|d| PoolMember::new(d.id, d.size_class))
            })
            .collect::<Result<Vec<_>>>()?;

        let name = generate_pool_name(&self.config.pool_base_name);
        info!(pool = %name, members = members.len(), %raid_type, "Creating pool");

        if let Err(e) = self.engine.create_pool(&name, devices, raid_type).await {
            error!(pool = %name, error = %e, "Initial setup failed");
            self.store.write_setup_failure(Some(e.to_string())).await?;
            self.metrics.record_outcome("setup", "error");
            return Err(e);
        }

        let descriptor = PoolDescriptor::create(name, raid_type, members)?;
        self.store.write_pool_descriptor(&descriptor).await?;
        self.store.write_setup_failure(None).await?;
        self.metrics.set_pool_members(descriptor.members.len());
        self.metrics.record_outcome("setup", "finished");

        info!(pool = ?descriptor.pool_name, usable_space = descriptor.usable_space(), "Pool created");
        Ok(descriptor)
    }

    // =========================================================================
    // AddDevice
    // =========================================================================

    /// Add `id` to the pool. Storage pools finish immediately; failsafe
    /// pools return while the expansion runs in the background.
    pub async fn add_device(self: &Arc<Self>, id: &DeviceId) -> Result<OperationRecord> {
        let admission = self.admission.lock().await;

        let pool = self.store.read_pool_descriptor().await?;
        let name = pool.name()?.to_string();
        if pool.contains(id) {
            return Err(Error::DeviceAlreadyInArray {
                device: id.to_string(),
            });
        }
        self.ensure_idle().await?;

        let device = self.present_device(id).await?;
        if pool.raid_type == RaidType::Failsafe {
            if let Some(smallest) = pool.members.iter().map(|m| m.size_class).min() {
                ensure_substitutes(&device, smallest)?;
            }
        }

        let mut writer = self
            .claim(OperationKind::AddDevice {
                device: id.clone(),
                size_class: device.size_class,
                raid_type: pool.raid_type,
                state: ExpansionState::Expanding,
                progress: 0,
                engine_submitted: false,
                error: None,
            })
            .await?;
        drop(admission);

        info!(pool = %name, device = %id, raid_type = %pool.raid_type, "Adding device");
        if let Err(e) = self.engine.add_member(&name, id, pool.raid_type).await {
            error!(pool = %name, device = %id, error = %e, "Engine refused to add device");
            writer
                .finish(ExpansionState::Canceled, Some(e.to_string()))
                .await?;
            return Err(e);
        }
        if let Err(e) = writer.update(mark_engine_submitted).await {
            warn!(pool = %name, device = %id, error = %e, "Failed to persist engine submission");
        }

        match pool.raid_type {
            RaidType::Storage => {
                let next = pool.with_member_added(PoolMember::new(id.clone(), device.size_class))?;
                self.store.write_pool_descriptor(&next).await?;
                self.metrics.set_pool_members(next.members.len());
                writer.finish(ExpansionState::Finished, None).await
            }
            RaidType::Failsafe => {
                let record = writer.record().clone();
                self.spawn_monitor("expansion", &record.id, self.clone().monitor_expansion(writer));
                Ok(record)
            }
        }
    }

    async fn monitor_expansion(self: Arc<Self>, mut writer: ProgressWriter) -> Result<()> {
        let OperationKind::AddDevice {
            device,
            size_class,
            engine_submitted,
            ..
        } = writer.record().operation.clone()
        else {
            return Err(Error::Internal("expansion monitor on wrong record".into()));
        };
        let name = self.store.read_pool_descriptor().await?.name()?.to_string();

        loop {
            match self.engine.pool_status(&name).await {
                Err(e) => warn!(pool = %name, error = %e, "Engine status unavailable"),
                Ok(None) => {
                    writer
                        .finish(
                            ExpansionState::Canceled,
                            Some(format!("pool {} is no longer imported", name)),
                        )
                        .await?;
                    return Ok(());
                }
                Ok(Some(status)) => match status.scan {
                    Some(scan) if scan.kind == ScanKind::Expand && scan.state == ScanState::Scanning => {
                        writer
                            .advance(ExpansionState::Expanding, scan.percent())
                            .await?;
                    }
                    Some(scan) if scan.kind == ScanKind::Expand && scan.state == ScanState::Canceled => {
                        writer
                            .finish(
                                ExpansionState::Canceled,
                                Some("expansion was canceled by the engine".into()),
                            )
                            .await?;
                        return Ok(());
                    }
                    _ if status.member(&device).is_some() => {
                        let pool = self.store.read_pool_descriptor().await?;
                        if !pool.contains(&device) {
                            let next = pool.with_member_added(PoolMember::new(device.clone(), size_class))?;
                            self.store.write_pool_descriptor(&next).await?;
                            self.metrics.set_pool_members(next.members.len());
                        }
                        writer.finish(ExpansionState::Finished, None).await?;
                        info!(pool = %name, device = %device, "Expansion finished");
                        return Ok(());
                    }
                    _ if !engine_submitted => {
                        warn!(pool = %name, device = %device, "Device never reached the engine");
                        writer
                            .finish(ExpansionState::Canceled, Some(NOT_SUBMITTED.into()))
                            .await?;
                        return Ok(());
                    }
                    _ => debug!(pool = %name, device = %device, "Waiting for expansion to start"),
                },
            }

            if self.pause(None).await {
                return Ok(());
            }
        }
    }

    // =========================================================================
    // ReplaceDevice
    // =========================================================================

    /// Replace member `old` with `new`; the resilver runs in the background
    pub async fn replace_device(self: &Arc<Self>, old: &DeviceId, new: &DeviceId) -> Result<OperationRecord> {
        let admission = self.admission.lock().await;

        let pool = self.store.read_pool_descriptor().await?;
        let name = pool.name()?.to_string();
        if pool.contains(new) {
            return Err(Error::ReplaceTargetInArray {
                device: new.to_string(),
            });
        }
        let old_member = pool
            .member(old)
            .ok_or_else(|| Error::DeviceNotMember {
                device: old.to_string(),
            })?
            .clone();
        self.ensure_idle().await?;

        let device = self.present_device(new).await?;
        ensure_substitutes(&device, old_member.size_class)?;

        let mut writer = self
            .claim(OperationKind::ReplaceDevice {
                old_device: old.clone(),
                new_device: new.clone(),
                new_size_class: device.size_class,
                state: ReplaceState::Rebuilding,
                progress: 0,
                engine_submitted: false,
                error: None,
            })
            .await?;
        // admission stays held until the monitor owns the token, so a
        // cancel can only arrive once there is something to cancel
        let cancel = self.install_replace_token();

        info!(pool = %name, old = %old, new = %new, "Replacing device");
        if let Err(e) = self.engine.replace_member(&name, old, new).await {
            error!(pool = %name, old = %old, new = %new, error = %e, "Engine refused to replace device");
            self.replace_cancel.lock().take();
            writer
                .finish(ReplaceState::Canceled, Some(e.to_string()))
                .await?;
            return Err(e);
        }
        if let Err(e) = writer.update(mark_engine_submitted).await {
            warn!(pool = %name, new = %new, error = %e, "Failed to persist engine submission");
        }

        let record = writer.record().clone();
        self.start_replace_monitor(writer, cancel);
        drop(admission);
        Ok(record)
    }

    /// Cancel the in-flight replace
    pub async fn cancel_replace(self: &Arc<Self>) -> Result<()> {
        let _admission = self.admission.lock().await;
        let active = self.store.read_active_operation().await?;
        let record = match active {
            Some(r) if !r.is_terminal() && matches!(r.operation, OperationKind::ReplaceDevice { .. }) => r,
            _ => return Err(Error::NoReplaceInProgress),
        };

        let token = self.replace_cancel.lock().take();
        match token {
            Some(token) => {
                info!(op = %record.id, "Canceling replace");
                token.cancel();
                Ok(())
            }
            None => {
                // nothing is monitoring the record in this process
                let writer = self.resume_writer(record);
                self.finish_canceled_replace(writer).await
            }
        }
    }

    fn install_replace_token(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.replace_cancel.lock() = Some(cancel.clone());
        cancel
    }

    fn start_replace_monitor(self: &Arc<Self>, writer: ProgressWriter, cancel: CancellationToken) {
        let op_id = writer.record().id.clone();
        self.spawn_monitor("replace", &op_id, self.clone().monitor_replace(writer, cancel));
    }

    async fn monitor_replace(self: Arc<Self>, mut writer: ProgressWriter, cancel: CancellationToken) -> Result<()> {
        let OperationKind::ReplaceDevice {
            old_device,
            new_device,
            engine_submitted,
            ..
        } = writer.record().operation.clone()
        else {
            return Err(Error::Internal("replace monitor on wrong record".into()));
        };
        let name = self.store.read_pool_descriptor().await?.name()?.to_string();

        loop {
            if cancel.is_cancelled() {
                return self.finish_canceled_replace(writer).await;
            }

            match self.engine.pool_status(&name).await {
                Err(e) => warn!(pool = %name, error = %e, "Engine status unavailable"),
                Ok(None) => {
                    self.replace_cancel.lock().take();
                    writer
                        .finish(
                            ReplaceState::Canceled,
                            Some(format!("pool {} is no longer imported", name)),
                        )
                        .await?;
                    return Ok(());
                }
                Ok(Some(status)) => match status.scan {
                    Some(scan) if scan.kind == ScanKind::Resilver && scan.state == ScanState::Scanning => {
                        writer
                            .advance(ReplaceState::Rebuilding, scan.percent())
                            .await?;
                    }
                    Some(scan) if scan.kind == ScanKind::Resilver && scan.state == ScanState::Canceled => {
                        self.replace_cancel.lock().take();
                        writer
                            .finish(
                                ReplaceState::Canceled,
                                Some("resilver was canceled by the engine".into()),
                            )
                            .await?;
                        return Ok(());
                    }
                    _ => {
                        let online = status
                            .member(&new_device)
                            .map(|m| m.health == PoolHealth::Online)
                            .unwrap_or(false);
                        if online {
                            return self.complete_replace(writer, &name, &old_device, &new_device).await;
                        }
                        if !engine_submitted && status.member(&new_device).is_none() {
                            warn!(pool = %name, new = %new_device, "Replacement never reached the engine");
                            self.replace_cancel.lock().take();
                            writer
                                .finish(ReplaceState::Canceled, Some(NOT_SUBMITTED.into()))
                                .await?;
                            return Ok(());
                        }
                    }
                },
            }

            if self.pause(Some(&cancel)).await {
                return Ok(());
            }
        }
    }

    async fn complete_replace(
        &self,
        writer: ProgressWriter,
        name: &str,
        old: &DeviceId,
        new: &DeviceId,
    ) -> Result<()> {
        self.replace_cancel.lock().take();
        if !writer.holds_slot().await? {
            warn!(op = %writer.record().id, pool = %name, "Replace no longer holds the slot, pool descriptor left unchanged");
            return Ok(());
        }
        if let Err(e) = self.engine.expand_member(name, new).await {
            warn!(pool = %name, device = %new, error = %e, "Failed to expand replaced member");
        }

        let new_size_class = match &writer.record().operation {
            OperationKind::ReplaceDevice { new_size_class, .. } => *new_size_class,
            _ => return Err(Error::Internal("replace completion on wrong record".into())),
        };
        let pool = self.store.read_pool_descriptor().await?;
        if !pool.contains(new) {
            let next = pool.with_member_replaced(old, PoolMember::new(new.clone(), new_size_class))?;
            self.store.write_pool_descriptor(&next).await?;
            self.metrics.set_pool_members(next.members.len());
            info!(pool = %name, usable_space = next.usable_space(), "Pool descriptor updated");
        }

        writer.finish(ReplaceState::Finished, None).await?;
        info!(pool = %name, old = %old, new = %new, "Replace finished");
        Ok(())
    }

    async fn finish_canceled_replace(&self, writer: ProgressWriter) -> Result<()> {
        let OperationKind::ReplaceDevice {
            old_device, new_device, ..
        } = writer.record().operation.clone()
        else {
            return Err(Error::Internal("replace cancel on wrong record".into()));
        };
        let name = self.store.read_pool_descriptor().await?.name()?.to_string();

        let error = match self.engine.cancel_replace(&name, &old_device, &new_device).await {
            Ok(()) => None,
            Err(e) => {
                warn!(pool = %name, error = %e, "Engine failed to detach replacement");
                Some(e.to_string())
            }
        };
        writer.finish(ReplaceState::Canceled, error).await?;
        info!(pool = %name, old = %old_device, new = %new_device, "Replace canceled");
        Ok(())
    }

    // =========================================================================
    // TransitionToFailsafe
    // =========================================================================

    /// Convert a single-device storage pool into a failsafe pool with `id`.
    ///
    /// The sync runs in the background and ends with a reboot; the rebuild
    /// phase is picked up by [`resume`](Self::resume) in the next process.
    pub async fn transition_to_failsafe(self: &Arc<Self>, id: &DeviceId) -> Result<OperationRecord> {
        let admission = self.admission.lock().await;

        let pool = self.store.read_pool_descriptor().await?;
        let name = pool.name()?.to_string();
        if pool.contains(id) {
            return Err(Error::TransitionDeviceInArray {
                device: id.to_string(),
            });
        }
        if pool.raid_type != RaidType::Storage {
            return Err(Error::WrongRaidType {
                expected: RaidType::Storage.to_string(),
            });
        }
        let original = match pool.members.as_slice() {
            [only] => only.clone(),
            members => {
                return Err(Error::TransitionRequiresSingleDevice {
                    members: members.len(),
                })
            }
        };
        self.ensure_idle().await?;

        let device = self.present_device(id).await?;
        ensure_substitutes(&device, original.size_class)?;

        let writer = self
            .claim(OperationKind::FailsafeTransition {
                original_device: original.id.clone(),
                original_size_class: original.size_class,
                new_device: id.clone(),
                new_size_class: device.size_class,
                state: TransitionState::Syncing,
                progress: 0,
                members_joined: false,
                error: None,
            })
            .await?;
        drop(admission);

        info!(pool = %name, original = %original.id, new = %id, "Starting failsafe transition");
        if let Err(e) = self.engine.prepare_migration(&name, &original.id, id).await {
            error!(pool = %name, error = %e, "Failed to prepare migration");
            self.abort_migration(&name).await;
            writer
                .finish(TransitionState::Error, Some(e.to_string()))
                .await?;
            return Err(e);
        }

        let record = writer.record().clone();
        self.spawn_monitor("transition-sync", &record.id, self.clone().run_sync_phase(writer, name));
        Ok(record)
    }

    async fn run_sync_phase(self: Arc<Self>, mut writer: ProgressWriter, name: String) -> Result<()> {
        let engine = self.engine.clone();
        let pool = name.clone();
        let mut sync = tokio::spawn(async move { engine.sync_migration(&pool).await });

        let outcome = loop {
            tokio::select! {
                joined = &mut sync => {
                    break joined
                        .map_err(|e| Error::Internal(format!("sync task failed: {}", e)))
                        .and_then(|r| r);
                }
                _ = self.shutdown.cancelled() => {
                    sync.abort();
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.engine.migration_progress(&name).await {
                        Ok(Some(p)) => {
                            writer
                                .advance(TransitionState::Syncing, sync_phase_progress(p.fraction()))
                                .await?;
                        }
                        Ok(None) => {}
                        Err(e) => debug!(pool = %name, error = %e, "Sync progress unavailable"),
                    }
                }
            }
        };

        let staged = match outcome {
            Ok(()) => self.engine.stage_migration(&name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            error!(pool = %name, error = %e, "Failsafe sync failed");
            self.abort_migration(&name).await;
            writer
                .finish(TransitionState::Error, Some(e.to_string()))
                .await?;
            return Ok(());
        }

        writer
            .advance(TransitionState::Rebooting, REBOOT_PROGRESS)
            .await?;
        info!(pool = %name, delay = ?self.config.reboot_delay, "Migration staged, reboot required");

        tokio::select! {
            _ = tokio::time::sleep(self.config.reboot_delay) => {}
            _ = self.shutdown.cancelled() => return Ok(()),
        }
        if let Err(e) = self.host.reboot().await {
            error!(error = %e, "Reboot failed; the transition resumes on the next boot");
        }
        Ok(())
    }

    async fn resume_transition(self: Arc<Self>, mut writer: ProgressWriter) -> Result<()> {
        let OperationKind::FailsafeTransition {
            original_device,
            original_size_class,
            new_device,
            new_size_class,
            members_joined,
            ..
        } = writer.record().operation.clone()
        else {
            return Err(Error::Internal("transition resume on wrong record".into()));
        };
        let pool = self.store.read_pool_descriptor().await?;
        let name = pool.name()?.to_string();

        writer
            .advance(TransitionState::Rebuilding, REBUILD_START_PROGRESS)
            .await?;

        if !members_joined {
            info!(pool = %name, device = %original_device, "Joining original device to failsafe array");
            if let Err(e) = self.engine.join_migrated_member(&name, &original_device).await {
                error!(pool = %name, error = %e, "Failed to join original device");
                writer
                    .finish(TransitionState::Error, Some(e.to_string()))
                    .await?;
                return Ok(());
            }
            writer
                .update(|op| {
                    if let OperationKind::FailsafeTransition { members_joined, .. } = op {
                        *members_joined = true;
                    }
                })
                .await?;
        }

        self.record_failsafe_members(
            pool,
            vec![
                PoolMember::new(new_device, new_size_class),
                PoolMember::new(original_device.clone(), original_size_class),
            ],
        )
        .await?;

        loop {
            match self.engine.pool_status(&name).await {
                Err(e) => warn!(pool = %name, error = %e, "Engine status unavailable"),
                Ok(None) => {
                    writer
                        .finish(
                            TransitionState::Error,
                            Some(format!("pool {} is not imported after reboot", name)),
                        )
                        .await?;
                    return Ok(());
                }
                Ok(Some(status)) => match status.scan {
                    Some(scan) if scan.kind == ScanKind::Resilver && scan.state == ScanState::Scanning => {
                        writer
                            .advance(TransitionState::Rebuilding, rebuild_phase_progress(scan.percent()))
                            .await?;
                    }
                    Some(scan) if scan.kind == ScanKind::Resilver && scan.state == ScanState::Canceled => {
                        writer
                            .finish(
                                TransitionState::Error,
                                Some("rebuild was canceled by the engine".into()),
                            )
                            .await?;
                        return Ok(());
                    }
                    _ => {
                        let online = status
                            .member(&original_device)
                            .map(|m| m.health == PoolHealth::Online)
                            .unwrap_or(false);
                        if online {
                            if let Err(e) = self.engine.cleanup_migration(&name).await {
                                warn!(pool = %name, error = %e, "Failed to clean up migration");
                            }
                            writer.finish(TransitionState::Complete, None).await?;
                            info!(pool = %name, "Failsafe transition complete");
                            return Ok(());
                        }
                    }
                },
            }

            if self.pause(None).await {
                return Ok(());
            }
        }
    }

    async fn record_failsafe_members(&self, pool: PoolDescriptor, members: Vec<PoolMember>) -> Result<()> {
        if pool.raid_type == RaidType::Failsafe && pool.members == members {
            return Ok(());
        }
        let next = PoolDescriptor {
            raid_type: RaidType::Failsafe,
            members,
            updated_at: Some(Utc::now()),
            ..pool
        };
        next.validate()?;
        self.store.write_pool_descriptor(&next).await?;
        self.metrics.set_pool_members(next.members.len());
        Ok(())
    }

    // =========================================================================
    // Resume
    // =========================================================================

    /// Pick up the operation left in the store by a previous process.
    ///
    /// Returns the record as found, or `None` if the slot was empty.
    pub async fn resume(self: &Arc<Self>) -> Result<Option<OperationRecord>> {
        let Some(record) = self.store.read_active_operation().await? else {
            return Ok(None);
        };

        if record.is_terminal() {
            debug!(op = %record.id, "Moving finished operation out of the active slot");
            self.store.finish_operation(&record).await?;
            return Ok(Some(record));
        }

        info!(
            op = %record.id,
            kind = record.kind_name(),
            state = %record.state(),
            progress = record.progress(),
            "Resuming operation"
        );
        let writer = self.resume_writer(record.clone());
        match &record.operation {
            OperationKind::AddDevice { .. } => {
                self.spawn_monitor("expansion", &record.id, self.clone().monitor_expansion(writer));
            }
            OperationKind::ReplaceDevice { .. } => {
                let cancel = self.install_replace_token();
                self.start_replace_monitor(writer, cancel);
            }
            OperationKind::FailsafeTransition { state, .. } if state.survives_reboot() => {
                self.spawn_monitor(
                    "transition-rebuild",
                    &record.id,
                    self.clone().resume_transition(writer),
                );
            }
            OperationKind::FailsafeTransition { .. } => {
                let pool = self.store.read_pool_descriptor().await?;
                if let Ok(name) = pool.name() {
                    self.abort_migration(name).await;
                }
                warn!(op = %record.id, "Transition was interrupted before the reboot");
                writer
                    .finish(
                        TransitionState::Error,
                        Some("transition interrupted before reboot".into()),
                    )
                    .await?;
            }
        }
        Ok(Some(record))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn claim(&self, operation: OperationKind) -> Result<ProgressWriter> {
        ProgressWriter::claim(
            OperationRecord::new(operation),
            self.store.clone(),
            self.bus.clone(),
            self.metrics.clone(),
        )
        .await
    }

    fn resume_writer(&self, record: OperationRecord) -> ProgressWriter {
        ProgressWriter::resume(record, self.store.clone(), self.bus.clone(), self.metrics.clone())
    }

    async fn ensure_idle(&self) -> Result<()> {
        match self.store.read_active_operation().await? {
            Some(active) if !active.is_terminal() => Err(Error::OperationInProgress {
                kind: active.kind_name().to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn refresh_registry(&self) {
        if let Err(e) = self.registry.refresh().await {
            warn!(error = %e, "Device enumeration failed, using last known devices");
        }
    }

    async fn present_device(&self, id: &DeviceId) -> Result<Device> {
        self.refresh_registry().await;
        self.registry.present_device(id)
    }

    async fn abort_migration(&self, name: &str) {
        if let Err(e) = self.engine.abort_migration(name).await {
            warn!(pool = %name, error = %e, "Failed to remove migration artefacts");
        }
    }

    /// Sleep one poll interval. Returns true when the orchestrator is
    /// shutting down; an optional token cuts the sleep short.
    async fn pause(&self, wake: Option<&CancellationToken>) -> bool {
        let wake = async {
            match wake {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            _ = wake => false,
            _ = self.shutdown.cancelled() => true,
        }
    }

    /// Run an operation monitor. A monitor that fails leaves no operation
    /// behind: its record is finished unsuccessfully.
    fn spawn_monitor<F>(self: &Arc<Self>, name: &'static str, op_id: &str, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let op_id = op_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(monitor = name, op = %op_id, error = %e, "Operation monitor failed");
                this.abandon(&op_id, &e).await;
            }
        });
    }

    async fn abandon(&self, op_id: &str, failure: &Error) {
        let record = match self.store.read_active_operation().await {
            Ok(Some(record)) if record.id == op_id && !record.is_terminal() => record,
            Ok(_) => return,
            Err(e) => {
                error!(op = op_id, error = %e, "Cannot read operation left by failed monitor");
                return;
            }
        };

        let state: ProgressState = match &record.operation {
            OperationKind::AddDevice { .. } => ExpansionState::Canceled.into(),
            OperationKind::ReplaceDevice { .. } => {
                self.replace_cancel.lock().take();
                ReplaceState::Canceled.into()
            }
            OperationKind::FailsafeTransition { state, .. } => {
                if !state.survives_reboot() {
                    if let Ok(pool) = self.store.read_pool_descriptor().await {
                        if let Ok(name) = pool.name() {
                            self.abort_migration(name).await;
                        }
                    }
                }
                TransitionState::Error.into()
            }
        };

        warn!(op = op_id, outcome = %state, "Finishing operation of failed monitor");
        if let Err(e) = self
            .resume_writer(record)
            .finish(state, Some(failure.to_string()))
            .await
        {
            error!(op = op_id, error = %e, "Failed to finish operation of failed monitor");
        }
    }
}

fn mark_engine_submitted(op: &mut OperationKind) {
    match op {
        OperationKind::AddDevice {
            engine_submitted, ..
        }
        | OperationKind::ReplaceDevice {
            engine_submitted, ..
        } => *engine_submitted = true,
        OperationKind::FailsafeTransition { .. } => {}
    }
}

fn ensure_substitutes(device: &Device, required: CapacityClass) -> Result<()> {
    if device.size_class.can_substitute(required) {
        return Ok(());
    }
    Err(Error::DeviceTooSmall {
        device: device.id.to_string(),
        class_bytes: device.size_class.bytes(),
        required_bytes: required.bytes(),
    })
}

fn generate_pool_name(base: &str) -> String {
    let mut hasher = DefaultHasher::new();
    Utc::now().timestamp_nanos_opt().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    format!("{}-{:08x}", base, hasher.finish() as u32)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controlplane::engine::{simulated_device, SimulatedBays, SimulatedEngine, SimulatedEngineConfig};
    use crate::controlplane::host::RecordingHost;
    use crate::domain::operation::{ProgressState, ProgressTopic, RebuildState};
    use crate::domain::ports::{PoolEngine, ProbedDevice};
    use crate::store::{FileStateStore, MemoryStateStore, StateStore};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    pub(crate) const TWO_TB: u64 = 2_000_398_934_016;
    pub(crate) const FOUR_TB: u64 = 4_000_787_030_016;

    pub(crate) struct Harness {
        pub orchestrator: Arc<OperationOrchestrator>,
        pub engine: Arc<SimulatedEngine>,
        pub bays: Arc<SimulatedBays>,
        pub registry: Arc<DeviceRegistry>,
        pub store: StateStoreRef,
        pub host: Arc<RecordingHost>,
    }

    impl Harness {
        pub async fn new(devices: Vec<ProbedDevice>) -> Self {
            Self::with_store(devices, Arc::new(MemoryStateStore::new())).await
        }

        pub async fn with_store(devices: Vec<ProbedDevice>, store: StateStoreRef) -> Self {
            let engine = Arc::new(SimulatedEngine::new(SimulatedEngineConfig {
                scan_step: 10,
                sync_chunks: 4,
                sync_chunk_delay: Duration::from_millis(5),
                migration_bytes: 1_000_000,
            }));
            let bays = Arc::new(SimulatedBays::new(devices));
            Self::assemble(engine, bays, store).await
        }

        /// A second process over the same engine, bays and store
        pub async fn restart(&self, store: StateStoreRef) -> Self {
            self.orchestrator.shutdown();
            Self::assemble(self.engine.clone(), self.bays.clone(), store).await
        }

        async fn assemble(engine: Arc<SimulatedEngine>, bays: Arc<SimulatedBays>, store: StateStoreRef) -> Self {
            let registry = DeviceRegistry::new(bays.clone());
            registry.refresh().await.unwrap();
            let host = Arc::new(RecordingHost::new());
            let orchestrator = OperationOrchestrator::new(
                fast_config(),
                registry.clone(),
                store.clone(),
                engine.clone(),
                host.clone(),
                ProgressEventBus::new(256),
                RaidMetrics::new().unwrap(),
            );
            Self {
                orchestrator,
                engine,
                bays,
                registry,
                store,
                host,
            }
        }

        pub async fn wait_idle(&self) -> OperationRecord {
            for _ in 0..2000 {
                if self.store.read_active_operation().await.unwrap().is_none() {
                    if let Some(last) = self.store.read_last_operation().await.unwrap() {
                        return last;
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panic!("operation did not finish");
        }
    }

    pub(crate) fn fast_config() -> ManagerConfig {
        ManagerConfig {
            pool_base_name: "raid".to_string(),
            poll_interval: Duration::from_millis(2),
            reboot_delay: Duration::from_millis(1),
            pool_monitor_interval: Duration::from_millis(2),
        }
    }

    pub(crate) fn bays(sizes: &[u64]) -> Vec<ProbedDevice> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| simulated_device(&format!("nvme-DEV_{}", i + 1), i as u8 + 1, *size))
            .collect()
    }

    fn id(n: usize) -> DeviceId {
        DeviceId::new(format!("nvme-DEV_{}", n))
    }

    #[tokio::test]
    async fn test_setup_creates_pool() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, FOUR_TB])).await;

        let pool = h
            .orchestrator
            .setup(&[id(1), id(2)], RaidType::Storage)
            .await
            .unwrap();
        let name = pool.name().unwrap().to_string();
        assert!(name.starts_with("raid-"));
        assert_eq!(h.engine.pool_members(&name), vec![id(1), id(2)]);
        assert_eq!(h.store.read_pool_descriptor().await.unwrap(), pool);

        let again = h.orchestrator.setup(&[id(3)], RaidType::Storage).await;
        assert_matches!(again, Err(Error::PoolAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_setup_preconditions() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;

        assert_matches!(
            h.orchestrator.setup(&[], RaidType::Storage).await,
            Err(Error::InvalidSetup(_))
        );
        assert_matches!(
            h.orchestrator.setup(&[id(1)], RaidType::Failsafe).await,
            Err(Error::InvalidSetup(_))
        );
        assert_matches!(
            h.orchestrator.setup(&[id(1), id(1)], RaidType::Failsafe).await,
            Err(Error::InvalidSetup(_))
        );
        assert_matches!(
            h.orchestrator.setup(&[id(9)], RaidType::Storage).await,
            Err(Error::DeviceNotFound { .. })
        );
        assert!(!h.store.read_pool_descriptor().await.unwrap().exists());
    }

    #[tokio::test]
    async fn test_setup_failure_is_recorded() {
        let h = Harness::new(bays(&[TWO_TB])).await;
        h.engine.fail_next("create_pool");

        let result = h.orchestrator.setup(&[id(1)], RaidType::Storage).await;
        assert_matches!(result, Err(Error::EngineCommand { .. }));
        assert!(h.store.read_setup_failure().await.unwrap().is_some());

        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        assert!(h.store.read_setup_failure().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_to_storage_is_immediate() {
        let h = Harness::new(bays(&[TWO_TB, FOUR_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        let record = h.orchestrator.add_device(&id(2)).await.unwrap();
        assert_eq!(record.state(), ProgressState::Expansion(ExpansionState::Finished));
        assert_eq!(record.progress(), 100);

        let status = h.orchestrator.status().await.unwrap();
        assert_eq!(status.devices.len(), 2);
        assert_eq!(status.usable_space, 6_000_000_000_000);
        assert_eq!(status.status, Some(PoolHealth::Online));
    }

    #[tokio::test]
    async fn test_add_rejects_member_without_mutation() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        let before = h.store.read_pool_descriptor().await.unwrap();

        let result = h.orchestrator.add_device(&id(1)).await;
        assert_matches!(result, Err(Error::DeviceAlreadyInArray { .. }));
        assert_eq!(result.unwrap_err().to_string(), "device already in array");
        assert_eq!(h.store.read_pool_descriptor().await.unwrap(), before);
        assert!(h.store.read_active_operation().await.unwrap().is_none());
        assert!(h.store.read_last_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_to_failsafe_expands_in_background() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB, FOUR_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2), id(3)], RaidType::Failsafe)
            .await
            .unwrap();

        let mut events = h.orchestrator.bus().subscribe(ProgressTopic::Expansion);
        let record = h.orchestrator.add_device(&id(4)).await.unwrap();
        assert_eq!(record.state(), ProgressState::Expansion(ExpansionState::Expanding));

        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Expansion(ExpansionState::Finished));
        assert_eq!(done.progress(), 100);

        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.members.len(), 4);
        assert_eq!(pool.usable_space(), 6_000_000_000_000);

        let mut last = 0;
        while let Some(event) = events.try_recv() {
            assert!(event.progress >= last);
            last = event.progress;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_failsafe_add_requires_smallest_class() {
        let h = Harness::new(bays(&[FOUR_TB, FOUR_TB, TWO_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Failsafe)
            .await
            .unwrap();
        assert_matches!(
            h.orchestrator.add_device(&id(3)).await,
            Err(Error::DeviceTooSmall { .. })
        );
    }

    #[tokio::test]
    async fn test_replace_in_storage_grows_capacity() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, FOUR_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Storage)
            .await
            .unwrap();
        let mut events = h.orchestrator.bus().subscribe(ProgressTopic::Replace);

        h.orchestrator.replace_device(&id(1), &id(3)).await.unwrap();

        let mut polled = Vec::new();
        loop {
            let status = h.orchestrator.status().await.unwrap();
            let replace = status.replace.unwrap();
            polled.push(replace.progress);
            if !replace.active {
                assert_eq!(status.usable_space, 6_000_000_000_000);
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(polled.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(polled.last(), Some(&100));

        let mut pushed = Vec::new();
        while let Some(event) = events.try_recv() {
            pushed.push(event.progress);
        }
        assert!(pushed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pushed.last(), Some(&100));

        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.member_ids(), vec![id(3), id(2)]);
    }

    #[tokio::test]
    async fn test_replace_in_failsafe_keeps_capacity() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB, FOUR_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2), id(3)], RaidType::Failsafe)
            .await
            .unwrap();
        let before = h.store.read_pool_descriptor().await.unwrap().usable_space();

        h.orchestrator.replace_device(&id(1), &id(4)).await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Finished));

        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert!(pool.contains(&id(4)));
        assert_eq!(pool.usable_space(), before);
    }

    #[tokio::test]
    async fn test_failsafe_capacity_grows_once_every_member_is_larger() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB, FOUR_TB, FOUR_TB, FOUR_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2), id(3)], RaidType::Failsafe)
            .await
            .unwrap();
        let before = h.orchestrator.status().await.unwrap().usable_space;
        assert_eq!(before, 4_000_000_000_000);

        for (old, new) in [(1, 4), (2, 5), (3, 6)] {
            let record = h.orchestrator.replace_device(&id(old), &id(new)).await.unwrap();
            let done = h.wait_idle().await;
            assert_eq!(done.id, record.id);
            assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Finished));

            let usable = h.orchestrator.status().await.unwrap().usable_space;
            if new < 6 {
                // a smaller member still bounds every stripe
                assert_eq!(usable, before);
            }
        }

        let status = h.orchestrator.status().await.unwrap();
        assert_eq!(status.usable_space, 8_000_000_000_000);
        assert!(status.usable_space > before);
        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.member_ids(), vec![id(4), id(5), id(6)]);
    }

    #[tokio::test]
    async fn test_replace_preconditions() {
        let h = Harness::new(bays(&[FOUR_TB, FOUR_TB, TWO_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Storage)
            .await
            .unwrap();

        let err = h.orchestrator.replace_device(&id(1), &id(2)).await.unwrap_err();
        assert_eq!(err.to_string(), "replace target already in array");
        assert_matches!(
            h.orchestrator.replace_device(&id(3), &id(1)).await,
            Err(Error::ReplaceTargetInArray { .. })
        );
        assert_matches!(
            h.orchestrator.replace_device(&id(9), &id(3)).await,
            Err(Error::DeviceNotMember { .. })
        );
        assert_matches!(
            h.orchestrator.replace_device(&id(1), &id(3)).await,
            Err(Error::DeviceTooSmall { .. })
        );
        assert!(h.store.read_active_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_operation_is_rejected() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB, TWO_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Storage)
            .await
            .unwrap();
        let record = h.orchestrator.replace_device(&id(1), &id(3)).await.unwrap();

        assert_matches!(
            h.orchestrator.add_device(&id(4)).await,
            Err(Error::OperationInProgress { .. })
        );
        assert_matches!(
            h.orchestrator.replace_device(&id(2), &id(4)).await,
            Err(Error::OperationInProgress { .. })
        );

        // either still running or finished by its own monitor, never touched by the rejections
        let active = h.store.read_active_operation().await.unwrap();
        let last = h.store.read_last_operation().await.unwrap();
        let current = active.or(last).unwrap();
        assert_eq!(current.id, record.id);
        assert_ne!(current.state(), ProgressState::Replace(ReplaceState::Canceled));
    }

    #[tokio::test]
    async fn test_cancel_replace() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        assert_matches!(
            h.orchestrator.cancel_replace().await,
            Err(Error::NoReplaceInProgress)
        );

        h.orchestrator.replace_device(&id(1), &id(2)).await.unwrap();
        h.orchestrator.cancel_replace().await.unwrap();

        let done = h.wait_idle().await;
        let state = done.state();
        // the resilver may win the race against the cancel
        assert!(matches!(
            state,
            ProgressState::Replace(ReplaceState::Canceled | ReplaceState::Finished)
        ));
        if state == ProgressState::Replace(ReplaceState::Canceled) {
            assert!(done.progress() < 100);
            let pool = h.store.read_pool_descriptor().await.unwrap();
            assert_eq!(pool.member_ids(), vec![id(1)]);
        }
    }

    #[tokio::test]
    async fn test_cancel_during_slow_engine_call() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        let pool = h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        let name = pool.name().unwrap().to_string();
        h.engine.delay_next("replace_member", Duration::from_millis(50));

        let orchestrator = h.orchestrator.clone();
        let replace = tokio::spawn(async move { orchestrator.replace_device(&id(1), &id(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.store.read_active_operation().await.unwrap().is_some());

        // waits for the engine call, then cancels the running resilver
        h.orchestrator.cancel_replace().await.unwrap();
        let record = replace.await.unwrap().unwrap();

        let done = h.wait_idle().await;
        assert_eq!(done.id, record.id);
        assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Canceled));
        assert!(done.error().is_none());

        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.member_ids(), vec![id(1)]);
        assert_eq!(h.engine.pool_members(&name), vec![id(1)]);
    }

    #[tokio::test]
    async fn test_engine_failure_cancels_replace() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        h.engine.fail_next("replace_member");

        let result = h.orchestrator.replace_device(&id(1), &id(2)).await;
        assert_matches!(result, Err(Error::EngineCommand { .. }));

        let last = h.store.read_last_operation().await.unwrap().unwrap();
        assert_eq!(last.state(), ProgressState::Replace(ReplaceState::Canceled));
        assert!(last.error().is_some());
        assert!(h.store.read_active_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_preconditions() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Storage)
            .await
            .unwrap();

        let err = h.orchestrator.transition_to_failsafe(&id(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "transition device already in array");
        assert_matches!(
            h.orchestrator.transition_to_failsafe(&id(3)).await,
            Err(Error::TransitionRequiresSingleDevice { members: 2 })
        );

        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB])).await;
        h.orchestrator
            .setup(&[id(1), id(2)], RaidType::Failsafe)
            .await
            .unwrap();
        assert_matches!(
            h.orchestrator.transition_to_failsafe(&id(3)).await,
            Err(Error::WrongRaidType { .. })
        );
    }

    #[tokio::test]
    async fn test_transition_survives_reboot() {
        let dir = TempDir::new().unwrap();
        let store: StateStoreRef = Arc::new(FileStateStore::open(dir.path(), "raid").await.unwrap());
        let h = Harness::with_store(bays(&[TWO_TB, TWO_TB]), store).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        let mut before_reboot = h.orchestrator.bus().subscribe(ProgressTopic::FailsafeTransition);
        h.orchestrator.transition_to_failsafe(&id(2)).await.unwrap();

        for _ in 0..2000 {
            if h.host.reboots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(h.host.reboots(), 1);

        let persisted = h.store.read_active_operation().await.unwrap().unwrap();
        assert_eq!(persisted.state(), ProgressState::Transition(TransitionState::Rebooting));
        assert_eq!(persisted.progress(), 50);

        let mut pushed = Vec::new();
        while let Some(event) = before_reboot.try_recv() {
            pushed.push(event.progress);
        }

        // the boot layer swaps pools, then a fresh process starts
        h.engine.simulate_reboot();
        let store: StateStoreRef = Arc::new(FileStateStore::open(dir.path(), "raid").await.unwrap());
        let h2 = h.restart(store).await;
        let mut after_reboot = h2.orchestrator.bus().subscribe(ProgressTopic::FailsafeTransition);

        let status = h2.orchestrator.status().await.unwrap();
        assert_eq!(status.failsafe_transition_status.unwrap().progress, 50);

        let resumed = h2.orchestrator.resume().await.unwrap().unwrap();
        assert_eq!(resumed.id, persisted.id);

        let done = h2.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Transition(TransitionState::Complete));
        assert_eq!(done.progress(), 100);
        assert_eq!(h.engine.sync_calls(), 1);

        while let Some(event) = after_reboot.try_recv() {
            pushed.push(event.progress);
        }
        assert!(pushed.windows(2).all(|w| w[0] <= w[1]));
        assert!(pushed.iter().any(|p| *p > 50 && *p < 100));
        assert_eq!(pushed.last(), Some(&100));

        let pool = h2.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.raid_type, RaidType::Failsafe);
        assert_eq!(pool.member_ids(), vec![id(2), id(1)]);
    }

    #[tokio::test]
    async fn test_transition_interrupted_before_reboot() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        let record = OperationRecord::new(OperationKind::FailsafeTransition {
            original_device: id(1),
            original_size_class: CapacityClass::from_raw(TWO_TB),
            new_device: id(2),
            new_size_class: CapacityClass::from_raw(TWO_TB),
            state: TransitionState::Syncing,
            progress: 20,
            members_joined: false,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();

        h.orchestrator.resume().await.unwrap();
        assert!(h.store.read_active_operation().await.unwrap().is_none());
        let last = h.store.read_last_operation().await.unwrap().unwrap();
        assert_eq!(last.state(), ProgressState::Transition(TransitionState::Error));
        assert_eq!(last.progress(), 20);
        assert_eq!(last.error(), Some("transition interrupted before reboot"));
    }

    #[tokio::test]
    async fn test_transition_polled_progress_is_monotonic() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        h.orchestrator.transition_to_failsafe(&id(2)).await.unwrap();

        let mut polled = Vec::new();
        let mut states = Vec::new();
        let mut observe = |(state, progress): (ProgressState, u8)| {
            polled.push(progress);
            if states.last() != Some(&state) {
                states.push(state);
            }
        };

        for _ in 0..2000 {
            let t = h.orchestrator.status().await.unwrap().failsafe_transition_status.unwrap();
            observe((t.state, t.progress));
            if h.host.reboots() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(h.host.reboots(), 1);

        h.engine.simulate_reboot();
        let h2 = h.restart(h.store.clone()).await;
        let t = h2.orchestrator.status().await.unwrap().failsafe_transition_status.unwrap();
        observe((t.state, t.progress));

        h2.orchestrator.resume().await.unwrap();
        for _ in 0..2000 {
            let t = h2.orchestrator.status().await.unwrap().failsafe_transition_status.unwrap();
            observe((t.state, t.progress));
            if !t.active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(polled.windows(2).all(|w| w[0] <= w[1]), "{:?}", polled);
        assert!(polled.contains(&REBOOT_PROGRESS));
        assert!(polled.iter().any(|p| *p > REBOOT_PROGRESS && *p < 100));
        assert_eq!(polled.last(), Some(&100));
        assert_eq!(
            states,
            vec![
                ProgressState::Transition(TransitionState::Syncing),
                ProgressState::Transition(TransitionState::Rebooting),
                ProgressState::Transition(TransitionState::Rebuilding),
                ProgressState::Transition(TransitionState::Complete),
            ]
        );
    }

    #[tokio::test]
    async fn test_add_interrupted_before_engine_frees_slot() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        // claimed, then the process died before the engine saw the device
        let record = OperationRecord::new(OperationKind::AddDevice {
            device: id(2),
            size_class: CapacityClass::from_raw(TWO_TB),
            raid_type: RaidType::Storage,
            state: ExpansionState::Expanding,
            progress: 0,
            engine_submitted: false,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();

        let resumed = h.orchestrator.resume().await.unwrap().unwrap();
        assert_eq!(resumed.id, record.id);
        let done = h.wait_idle().await;
        assert_eq!(done.id, record.id);
        assert_eq!(done.state(), ProgressState::Expansion(ExpansionState::Canceled));
        assert_eq!(done.error(), Some(NOT_SUBMITTED));
        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.member_ids(), vec![id(1)]);

        let added = h.orchestrator.add_device(&id(3)).await.unwrap();
        assert_eq!(added.state(), ProgressState::Expansion(ExpansionState::Finished));
    }

    #[tokio::test]
    async fn test_add_accepted_by_engine_completes_on_resume() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        let pool = h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        let name = pool.name().unwrap().to_string();

        // the engine took the device but the flag never reached the store
        let record = OperationRecord::new(OperationKind::AddDevice {
            device: id(2),
            size_class: CapacityClass::from_raw(TWO_TB),
            raid_type: RaidType::Storage,
            state: ExpansionState::Expanding,
            progress: 0,
            engine_submitted: false,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();
        h.engine.add_member(&name, &id(2), RaidType::Storage).await.unwrap();

        h.orchestrator.resume().await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Expansion(ExpansionState::Finished));
        let pool = h.store.read_pool_descriptor().await.unwrap();
        assert_eq!(pool.member_ids(), vec![id(1), id(2)]);
    }

    #[tokio::test]
    async fn test_replace_interrupted_before_engine_frees_slot() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();

        let record = OperationRecord::new(OperationKind::ReplaceDevice {
            old_device: id(1),
            new_device: id(2),
            new_size_class: CapacityClass::from_raw(TWO_TB),
            state: ReplaceState::Rebuilding,
            progress: 0,
            engine_submitted: false,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();

        h.orchestrator.resume().await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Canceled));
        assert_eq!(done.error(), Some(NOT_SUBMITTED));

        h.orchestrator.replace_device(&id(1), &id(3)).await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Finished));
    }

    #[tokio::test]
    async fn test_failed_monitor_releases_slot() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;

        // no pool yet, so the monitor fails on its first descriptor read
        let record = OperationRecord::new(OperationKind::AddDevice {
            device: id(2),
            size_class: CapacityClass::from_raw(TWO_TB),
            raid_type: RaidType::Failsafe,
            state: ExpansionState::Expanding,
            progress: 30,
            engine_submitted: true,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();

        h.orchestrator.resume().await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.id, record.id);
        assert_eq!(done.state(), ProgressState::Expansion(ExpansionState::Canceled));
        assert_eq!(done.progress(), 30);
        assert!(done.error().is_some());

        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_rebuild_is_reported() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB, TWO_TB])).await;
        let pool = h
            .orchestrator
            .setup(&[id(1), id(2), id(3)], RaidType::Failsafe)
            .await
            .unwrap();
        let name = pool.name().unwrap().to_string();
        assert!(h.orchestrator.status().await.unwrap().rebuild.is_none());

        let mut events = h.orchestrator.bus().subscribe(ProgressTopic::Rebuild);
        h.engine.start_resilver(&name);
        h.orchestrator.spawn_rebuild_monitor();

        let mut pushed = Vec::new();
        for _ in 0..2000 {
            match events.try_recv() {
                Some(event) => {
                    let terminal = event.state.is_terminal();
                    pushed.push(event);
                    if terminal {
                        break;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(1)).await,
            }
        }
        assert!(pushed.len() >= 2);
        assert!(pushed.windows(2).all(|w| w[0].progress <= w[1].progress));
        assert!(pushed[..pushed.len() - 1]
            .iter()
            .all(|e| e.state == ProgressState::Rebuild(RebuildState::Rebuilding) && e.progress <= 99));
        let last = pushed.last().unwrap();
        assert_eq!(last.state, ProgressState::Rebuild(RebuildState::Finished));
        assert_eq!(last.progress, 100);

        // a second rebuild, read through polling
        h.engine.start_resilver(&name);
        let mut polled = Vec::new();
        for _ in 0..2000 {
            let rebuild = h.orchestrator.status().await.unwrap().rebuild.unwrap();
            polled.push(rebuild.progress);
            if rebuild.state == RebuildState::Finished {
                break;
            }
            assert!(rebuild.progress <= 99);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(polled.windows(2).all(|w| w[0] <= w[1]), "{:?}", polled);
        assert_eq!(polled.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_replace_resilver_is_not_a_rebuild() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        let pool = h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        let name = pool.name().unwrap().to_string();

        let record = OperationRecord::new(OperationKind::ReplaceDevice {
            old_device: id(1),
            new_device: id(2),
            new_size_class: CapacityClass::from_raw(TWO_TB),
            state: ReplaceState::Rebuilding,
            progress: 0,
            engine_submitted: true,
            error: None,
        });
        h.store.claim_operation(&record).await.unwrap();
        h.engine.replace_member(&name, &id(1), &id(2)).await.unwrap();

        let status = h.orchestrator.status().await.unwrap();
        assert!(status.replace.unwrap().active);
        assert!(status.rebuild.is_none());

        h.orchestrator.resume().await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Replace(ReplaceState::Finished));
    }

    #[tokio::test]
    async fn test_sync_failure_ends_in_error() {
        let h = Harness::new(bays(&[TWO_TB, TWO_TB])).await;
        h.orchestrator.setup(&[id(1)], RaidType::Storage).await.unwrap();
        h.engine.fail_next("sync_migration");

        h.orchestrator.transition_to_failsafe(&id(2)).await.unwrap();
        let done = h.wait_idle().await;
        assert_eq!(done.state(), ProgressState::Transition(TransitionState::Error));
        assert!(done.error().is_some());
        assert_eq!(h.host.reboots(), 0);

        let status = h.orchestrator.status().await.unwrap();
        let transition = status.failsafe_transition_status.unwrap();
        assert!(!transition.active);
        assert_eq!(status.raid_type, Some(RaidType::Storage));
    }
}
