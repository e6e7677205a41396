//! Simulated Engine
//!
//! In-memory stand-in for the pooled storage engine, used by standalone mode
//! and by the orchestrator tests. Background scans advance a fixed step on
//! every status read, and the pre-reboot sync runs in timed chunks.

use crate::domain::ports::{
    DeviceId, DeviceProber, EngineMember, EngineStatus, ImportCandidate, MigrationProgress,
    PoolEngine, PoolHealth, ProbedDevice, RaidType, ScanKind, ScanState, ScanStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated engine
#[derive(Debug, Clone)]
pub struct SimulatedEngineConfig {
    /// Scan work done per status read, out of 100
    pub scan_step: u64,
    /// Number of chunks the migration sync is split into
    pub sync_chunks: u64,
    /// Delay between sync chunks
    pub sync_chunk_delay: Duration,
    /// Bytes a migration sync pretends to transfer
    pub migration_bytes: u64,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            scan_step: 20,
            sync_chunks: 5,
            sync_chunk_delay: Duration::from_millis(200),
            migration_bytes: 64 * 1024 * 1024 * 1024, // 64 GiB
        }
    }
}

// =============================================================================
// Simulated State
// =============================================================================

#[derive(Debug, Clone)]
enum ScanWork {
    Replace { old: DeviceId },
    Expand,
    Join,
    /// Resilver the engine started on its own
    Heal,
}

#[derive(Debug, Clone)]
struct SimScan {
    kind: ScanKind,
    state: ScanState,
    done: u64,
    work: ScanWork,
}

#[derive(Debug, Clone)]
struct SimPool {
    raid_type: RaidType,
    members: Vec<EngineMember>,
    scan: Option<SimScan>,
    imported: bool,
}

impl SimPool {
    fn contains(&self, id: &DeviceId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    fn scanning(&self) -> bool {
        matches!(&self.scan, Some(s) if s.state == ScanState::Scanning)
    }
}

#[derive(Debug, Clone)]
struct SimMigration {
    pool: String,
    new: DeviceId,
    estimated: u64,
    written: u64,
    staged: bool,
    rebooted: bool,
}

#[derive(Debug, Default)]
struct SimState {
    pools: BTreeMap<String, SimPool>,
    migration: Option<SimMigration>,
    sync_calls: u32,
    failing: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
}

impl SimState {
    fn pool_mut(&mut self, pool: &str) -> Result<&mut SimPool> {
        self.pools
            .get_mut(pool)
            .filter(|p| p.imported)
            .ok_or_else(|| command_error("status", format!("cannot open '{}': no such pool", pool)))
    }

    fn check(&mut self, command: &'static str) -> Result<()> {
        if self.failing.remove(command) {
            return Err(command_error(command, "injected failure".into()));
        }
        Ok(())
    }
}

fn command_error(command: &str, reason: String) -> Error {
    Error::EngineCommand {
        command: command.to_string(),
        reason,
    }
}

fn online(id: &DeviceId) -> EngineMember {
    EngineMember {
        id: id.clone(),
        health: PoolHealth::Online,
        read_errors: 0,
        write_errors: 0,
        checksum_errors: 0,
    }
}

// =============================================================================
// Simulated Engine
// =============================================================================

/// In-memory pooled storage engine
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    state: Mutex<SimState>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Number of times the migration sync has been started
    pub fn sync_calls(&self) -> u32 {
        self.state.lock().sync_calls
    }

    /// Make the next call of `command` (e.g. `"replace_member"`) fail
    pub fn fail_next(&self, command: &'static str) {
        self.state.lock().failing.insert(command);
    }

    /// Make the next call of `command` take at least `delay`
    pub fn delay_next(&self, command: &'static str, delay: Duration) {
        self.state.lock().delays.insert(command, delay);
    }

    /// Start a resilver no operation asked for, as after a member fault
    pub fn start_resilver(&self, pool: &str) {
        if let Some(p) = self.state.lock().pools.get_mut(pool) {
            p.scan = Some(SimScan {
                kind: ScanKind::Resilver,
                state: ScanState::Scanning,
                done: 0,
                work: ScanWork::Heal,
            });
        }
    }

    async fn injected_delay(&self, command: &'static str) {
        let delay = self.state.lock().delays.remove(command);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply what the boot layer does on reboot: a staged migration
    /// replaces the pool with its degraded redundant layout
    pub fn simulate_reboot(&self) {
        let mut state = self.state.lock();
        let Some(migration) = state.migration.as_mut() else {
            return;
        };
        if !migration.staged {
            return;
        }
        migration.rebooted = true;
        let new = migration.new.clone();
        let name = migration.pool.clone();
        info!(pool = %name, "Simulated reboot swapped in migrated pool");

        state.pools.insert(
            name,
            SimPool {
                raid_type: RaidType::Failsafe,
                members: vec![online(&new)],
                scan: None,
                imported: true,
            },
        );
    }

    /// Hide a pool as if it failed to import
    pub fn export_pool(&self, pool: &str) {
        if let Some(p) = self.state.lock().pools.get_mut(pool) {
            p.imported = false;
        }
    }

    /// Set a member's health
    pub fn set_member_health(&self, pool: &str, id: &DeviceId, health: PoolHealth) {
        if let Some(p) = self.state.lock().pools.get_mut(pool) {
            if let Some(m) = p.members.iter_mut().find(|m| &m.id == id) {
                m.health = health;
            }
        }
    }

    /// Member ids of a pool, in engine order
    pub fn pool_members(&self, pool: &str) -> Vec<DeviceId> {
        self.state
            .lock()
            .pools
            .get(pool)
            .map(|p| p.members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    fn advance_scan(&self, pool: &mut SimPool) {
        let Some(scan) = pool.scan.as_mut() else {
            return;
        };
        if scan.state != ScanState::Scanning {
            return;
        }
        scan.done = (scan.done + self.config.scan_step).min(100);
        if scan.done < 100 {
            return;
        }

        scan.state = ScanState::Finished;
        if let ScanWork::Replace { old } = &scan.work {
            let old = old.clone();
            pool.members.retain(|m| m.id != old);
        }
    }

    fn status_of(pool: &SimPool) -> EngineStatus {
        let member_down = pool.members.iter().any(|m| m.health != PoolHealth::Online);
        let rebuilding = matches!(
            &pool.scan,
            Some(SimScan { state: ScanState::Scanning, work: ScanWork::Expand | ScanWork::Join | ScanWork::Heal, .. })
        );
        let health = if pool.members.iter().all(|m| !m.health.is_serving()) {
            PoolHealth::Faulted
        } else if member_down || rebuilding {
            PoolHealth::Degraded
        } else {
            PoolHealth::Online
        };

        EngineStatus {
            health,
            raid_type: pool.raid_type,
            members: pool.members.clone(),
            scan: pool.scan.as_ref().map(|s| ScanStatus {
                kind: s.kind,
                state: s.state,
                done: s.done,
                total: 100,
            }),
            total_space: 0,
            used_space: 0,
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimulatedEngineConfig::default())
    }
}

#[async_trait]
impl PoolEngine for SimulatedEngine {
    fn engine_name(&self) -> &str {
        "simulated"
    }

    async fn pool_status(&self, pool: &str) -> Result<Option<EngineStatus>> {
        let mut state = self.state.lock();
        state.check("pool_status")?;
        let Some(p) = state.pools.get_mut(pool).filter(|p| p.imported) else {
            return Ok(None);
        };
        self.advance_scan(p);
        Ok(Some(Self::status_of(p)))
    }

    async fn create_pool(&self, pool: &str, devices: &[DeviceId], raid_type: RaidType) -> Result<()> {
        let mut state = self.state.lock();
        state.check("create_pool")?;
        if state.pools.contains_key(pool) {
            return Err(command_error("create_pool", format!("pool '{}' already exists", pool)));
        }
        state.pools.insert(
            pool.to_string(),
            SimPool {
                raid_type,
                members: devices.iter().map(online).collect(),
                scan: None,
                imported: true,
            },
        );
        debug!(pool, members = devices.len(), %raid_type, "Simulated pool created");
        Ok(())
    }

    async fn add_member(&self, pool: &str, device: &DeviceId, raid_type: RaidType) -> Result<()> {
        self.injected_delay("add_member").await;
        let mut state = self.state.lock();
        state.check("add_member")?;
        let p = state.pool_mut(pool)?;
        if p.contains(device) {
            return Err(command_error("add_member", format!("{} is already in use", device)));
        }
        if p.scanning() {
            return Err(command_error("add_member", "a scan is in progress".into()));
        }

        p.members.push(online(device));
        if raid_type == RaidType::Failsafe {
            p.scan = Some(SimScan {
                kind: ScanKind::Expand,
                state: ScanState::Scanning,
                done: 0,
                work: ScanWork::Expand,
            });
        }
        Ok(())
    }

    async fn replace_member(&self, pool: &str, old: &DeviceId, new: &DeviceId) -> Result<()> {
        self.injected_delay("replace_member").await;
        let mut state = self.state.lock();
        state.check("replace_member")?;
        let p = state.pool_mut(pool)?;
        if !p.contains(old) {
            return Err(command_error("replace_member", format!("no such device in pool: {}", old)));
        }
        if p.contains(new) {
            return Err(command_error("replace_member", format!("{} is already in use", new)));
        }

        p.members.push(online(new));
        p.scan = Some(SimScan {
            kind: ScanKind::Resilver,
            state: ScanState::Scanning,
            done: 0,
            work: ScanWork::Replace { old: old.clone() },
        });
        Ok(())
    }

    async fn cancel_replace(&self, pool: &str, _old: &DeviceId, new: &DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("cancel_replace")?;
        let p = state.pool_mut(pool)?;
        match p.scan.as_mut() {
            Some(scan) if matches!(scan.work, ScanWork::Replace { .. }) && scan.state == ScanState::Scanning => {
                scan.state = ScanState::Canceled;
            }
            _ => {
                return Err(command_error("cancel_replace", "no replace in progress".into()));
            }
        }
        p.members.retain(|m| &m.id != new);
        Ok(())
    }

    async fn expand_member(&self, pool: &str, device: &DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("expand_member")?;
        let p = state.pool_mut(pool)?;
        if !p.contains(device) {
            return Err(command_error("expand_member", format!("no such device in pool: {}", device)));
        }
        Ok(())
    }

    async fn prepare_migration(&self, pool: &str, current: &DeviceId, new: &DeviceId) -> Result<u64> {
        let mut state = self.state.lock();
        state.check("prepare_migration")?;
        let p = state.pool_mut(pool)?;
        if p.members.len() != 1 || !p.contains(current) {
            return Err(command_error(
                "prepare_migration",
                format!("{} is not the only member of {}", current, pool),
            ));
        }
        let estimated = self.config.migration_bytes;
        state.migration = Some(SimMigration {
            pool: pool.to_string(),
            new: new.clone(),
            estimated,
            written: 0,
            staged: false,
            rebooted: false,
        });
        Ok(estimated)
    }

    async fn sync_migration(&self, pool: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.sync_calls += 1;
            state.check("sync_migration")?;
            if !matches!(&state.migration, Some(m) if m.pool == pool) {
                return Err(command_error("sync_migration", "no migration prepared".into()));
            }
        }

        let chunks = self.config.sync_chunks.max(1);
        for _ in 0..chunks {
            tokio::time::sleep(self.config.sync_chunk_delay).await;
            let mut state = self.state.lock();
            let migration = state
                .migration
                .as_mut()
                .ok_or_else(|| command_error("sync_migration", "migration aborted".into()))?;
            migration.written = (migration.written + migration.estimated / chunks).min(migration.estimated);
        }

        if let Some(migration) = self.state.lock().migration.as_mut() {
            migration.written = migration.estimated;
        }
        Ok(())
    }

    async fn migration_progress(&self, pool: &str) -> Result<Option<MigrationProgress>> {
        let state = self.state.lock();
        Ok(state
            .migration
            .as_ref()
            .filter(|m| m.pool == pool)
            .map(|m| MigrationProgress {
                written_bytes: m.written,
                estimated_bytes: m.estimated,
            }))
    }

    async fn stage_migration(&self, pool: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check("stage_migration")?;
        match state.migration.as_mut() {
            Some(m) if m.pool == pool && m.written >= m.estimated => {
                m.staged = true;
                Ok(())
            }
            _ => Err(command_error("stage_migration", "migration is not synced".into())),
        }
    }

    async fn join_migrated_member(&self, pool: &str, original: &DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        state.check("join_migrated_member")?;
        if !matches!(&state.migration, Some(m) if m.pool == pool && m.rebooted) {
            return Err(command_error("join_migrated_member", "migrated pool is not active".into()));
        }
        let p = state.pool_mut(pool)?;
        if p.contains(original) {
            return Ok(());
        }
        p.members.push(online(original));
        p.scan = Some(SimScan {
            kind: ScanKind::Resilver,
            state: ScanState::Scanning,
            done: 0,
            work: ScanWork::Join,
        });
        Ok(())
    }

    async fn abort_migration(&self, pool: &str) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(&state.migration, Some(m) if m.pool == pool) {
            state.migration = None;
        }
        Ok(())
    }

    async fn cleanup_migration(&self, pool: &str) -> Result<()> {
        self.abort_migration(pool).await
    }

    async fn import_candidates(&self, pool: &str) -> Result<Vec<ImportCandidate>> {
        let mut state = self.state.lock();
        state.check("import_candidates")?;
        Ok(state
            .pools
            .get(pool)
            .map(|p| {
                p.members
                    .iter()
                    .map(|m| ImportCandidate {
                        id: m.id.clone(),
                        healthy: m.health == PoolHealth::Online,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Simulated Bays
// =============================================================================

/// Device prober over a mutable, in-memory set of bays
#[derive(Default)]
pub struct SimulatedBays {
    devices: Mutex<Vec<ProbedDevice>>,
}

impl SimulatedBays {
    pub fn new(devices: Vec<ProbedDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }

    /// `count` identical devices in slots 1..=count
    pub fn uniform(count: u8, size_bytes: u64) -> Self {
        Self::new(
            (1..=count)
                .map(|slot| simulated_device(&format!("nvme-SIM_{:02}", slot), slot, size_bytes))
                .collect(),
        )
    }

    /// Put a device into a bay, replacing any device with the same id
    pub fn insert(&self, device: ProbedDevice) {
        let mut devices = self.devices.lock();
        devices.retain(|d| d.id != device.id);
        devices.push(device);
    }

    /// Pull a device out of its bay
    pub fn remove(&self, id: &DeviceId) {
        self.devices.lock().retain(|d| &d.id != id);
    }
}

#[async_trait]
impl DeviceProber for SimulatedBays {
    async fn probe(&self) -> Result<Vec<ProbedDevice>> {
        Ok(self.devices.lock().clone())
    }
}

/// A simulated probe result
pub fn simulated_device(id: &str, slot: u8, size_bytes: u64) -> ProbedDevice {
    ProbedDevice {
        id: DeviceId::new(id),
        slot: Some(slot),
        device_path: format!("/dev/nvme{}n1", slot.saturating_sub(1)),
        size_bytes,
        model: "Simulated NVMe".to_string(),
        serial: id.trim_start_matches("nvme-").to_string(),
    }
}
