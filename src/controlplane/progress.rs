//! Progress Event Bus
//!
//! Push and poll views of operation progress. [`ProgressWriter`] is the only
//! path that changes an operation record: it writes the state store first
//! and publishes the same record to the bus second, so a poll issued after
//! any event observes at least that event.
//!
//! Resilvers the engine starts without an operation (a failsafe member
//! coming back after a fault) have no writer; [`RebuildMonitor`] derives
//! them from engine status and publishes them on their own topic.

use crate::controlplane::metrics::RaidMetrics;
use crate::domain::operation::{
    OperationKind, OperationRecord, ProgressEvent, ProgressState, ProgressTopic, RebuildState,
    MAX_RUNNING_PROGRESS,
};
use crate::domain::ports::{DeviceId, PoolEngineRef, PoolHealth, RaidType, ScanKind, ScanState, ScanStatus};
use crate::error::{Error, Result};
use crate::hardware::classification::CapacityClass;
use crate::hardware::registry::DeviceRegistry;
use crate::store::StateStoreRef;
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Event Bus
// =============================================================================

/// Fan-out of progress events, one broadcast channel per topic
pub struct ProgressEventBus {
    senders: HashMap<ProgressTopic, broadcast::Sender<ProgressEvent>>,
}

impl ProgressEventBus {
    /// Create a bus whose per-subscriber buffer holds `capacity` events
    pub fn new(capacity: usize) -> Arc<Self> {
        let senders = ProgressTopic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity).0))
            .collect();
        Arc::new(Self { senders })
    }

    /// Subscribe to a topic. Only events published after this call arrive.
    pub fn subscribe(&self, topic: ProgressTopic) -> ProgressSubscription {
        ProgressSubscription {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: ProgressTopic) -> usize {
        self.sender(topic).receiver_count()
    }

    /// Publish to the event's topic. Returns the number of receivers.
    pub(crate) fn publish(&self, event: ProgressEvent) -> usize {
        self.sender(event.topic).send(event).unwrap_or(0)
    }

    fn sender(&self, topic: ProgressTopic) -> &broadcast::Sender<ProgressEvent> {
        // every topic gets a channel in new()
        &self.senders[&topic]
    }
}

/// A live subscription to one topic
pub struct ProgressSubscription {
    topic: ProgressTopic,
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl ProgressSubscription {
    pub fn topic(&self) -> ProgressTopic {
        self.topic
    }

    /// Next event. A subscriber that fell behind skips to the oldest
    /// retained event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

// =============================================================================
// Progress Writer
// =============================================================================

/// The single writer for one operation
pub struct ProgressWriter {
    record: OperationRecord,
    store: StateStoreRef,
    bus: Arc<ProgressEventBus>,
    metrics: Arc<RaidMetrics>,
}

impl ProgressWriter {
    /// Occupy the operation slot with `record` and announce it
    pub(crate) async fn claim(
        record: OperationRecord,
        store: StateStoreRef,
        bus: Arc<ProgressEventBus>,
        metrics: Arc<RaidMetrics>,
    ) -> Result<Self> {
        store.claim_operation(&record).await?;
        let writer = Self {
            record,
            store,
            bus,
            metrics,
        };
        writer.announce();
        Ok(writer)
    }

    /// Take over a record found in the store at startup
    pub(crate) fn resume(
        record: OperationRecord,
        store: StateStoreRef,
        bus: Arc<ProgressEventBus>,
        metrics: Arc<RaidMetrics>,
    ) -> Self {
        Self {
            record,
            store,
            bus,
            metrics,
        }
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub fn progress(&self) -> u8 {
        self.record.progress()
    }

    /// Whether the store's active slot still holds this operation
    pub(crate) async fn holds_slot(&self) -> Result<bool> {
        Ok(matches!(
            self.store.read_active_operation().await?,
            Some(active) if active.id == self.record.id && !active.is_terminal()
        ))
    }

    /// Move to a running state. Progress never goes backwards and never
    /// reaches 100 before a terminal state.
    pub(crate) async fn advance(&mut self, state: impl Into<ProgressState>, progress: u8) -> Result<()> {
        let state = state.into();
        if state.is_terminal() {
            return Err(Error::Internal(format!(
                "{} is terminal, use finish()",
                state
            )));
        }

        let progress = progress.min(MAX_RUNNING_PROGRESS).max(self.record.progress());
        if state == self.record.state() && progress == self.record.progress() {
            return Ok(());
        }

        let mut next = self.record.clone();
        next.apply(state, progress, None)?;
        self.store.write_active_operation(&next).await?;
        self.record = next;

        debug!(
            op = %self.record.id,
            kind = self.record.kind_name(),
            state = %state,
            progress,
            "Operation progress"
        );
        self.announce();
        Ok(())
    }

    /// Change kind-specific fields and persist them
    pub(crate) async fn update(&mut self, change: impl FnOnce(&mut OperationKind)) -> Result<()> {
        let mut next = self.record.clone();
        change(&mut next.operation);
        next.updated_at = chrono::Utc::now();
        self.store.write_active_operation(&next).await?;
        self.record = next;
        Ok(())
    }

    /// Record a terminal state and free the slot. Success ends at 100,
    /// anything else keeps the last progress value.
    pub(crate) async fn finish(
        mut self,
        state: impl Into<ProgressState>,
        error: Option<String>,
    ) -> Result<OperationRecord> {
        let state = state.into();
        if !state.is_terminal() {
            return Err(Error::Internal(format!("{} is not terminal", state)));
        }

        let progress = if state.is_success() {
            100
        } else {
            self.record.progress()
        };

        let mut next = self.record.clone();
        next.apply(state, progress, error)?;
        self.store.finish_operation(&next).await?;
        self.record = next;

        self.metrics
            .record_outcome(self.record.kind_name(), &state.to_string());
        self.announce();
        Ok(self.record)
    }

    fn announce(&self) {
        self.metrics
            .observe_progress(self.record.kind_name(), self.record.progress());
        self.bus.publish(self.record.event());
    }
}

// =============================================================================
// Status Composition
// =============================================================================

/// Progress of one operation as shown in the pool status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgress {
    pub id: String,
    pub state: ProgressState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// False once the operation reached a terminal state
    pub active: bool,
}

impl OperationProgress {
    fn from_record(record: &OperationRecord, active: bool) -> Self {
        Self {
            id: record.id.clone(),
            state: record.state(),
            progress: record.progress(),
            error: record.error().map(str::to_string),
            active: active && !record.is_terminal(),
        }
    }
}

/// One pool member in the status view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDeviceStatus {
    pub id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u8>,
    pub size_class: CapacityClass,
    /// Engine-reported health, absent when the engine cannot be queried
    pub health: Option<PoolHealth>,
    pub present: bool,
}

/// A resilver the engine runs outside any operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebuildStatus {
    pub state: RebuildState,
    pub progress: u8,
}

impl RebuildStatus {
    pub fn event(&self) -> ProgressEvent {
        ProgressEvent {
            topic: ProgressTopic::Rebuild,
            operation_id: None,
            state: self.state.into(),
            progress: self.progress,
            error: None,
        }
    }
}

/// The single object a polling client needs
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub exists: bool,
    pub name: Option<String>,
    pub raid_type: Option<RaidType>,
    pub status: Option<PoolHealth>,
    pub devices: Vec<PoolDeviceStatus>,
    pub usable_space: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace: Option<OperationProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failsafe_transition_status: Option<OperationProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expansion: Option<OperationProgress>,
    /// Only while no replace or transition owns the resilver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuild: Option<RebuildStatus>,
}

/// Builds [`PoolStatus`] from the store, the engine and the registry
#[derive(Clone)]
pub struct StatusReader {
    store: StateStoreRef,
    engine: PoolEngineRef,
    registry: Arc<DeviceRegistry>,
    /// Highest progress reported for the current rebuild
    rebuild_floor: Arc<parking_lot::Mutex<u8>>,
}

impl StatusReader {
    pub fn new(store: StateStoreRef, engine: PoolEngineRef, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            store,
            engine,
            registry,
            rebuild_floor: Arc::new(parking_lot::Mutex::new(0)),
        }
    }

    /// Current status. Engine failures degrade to unknown health.
    pub async fn current_status(&self) -> Result<PoolStatus> {
        let pool = self.store.read_pool_descriptor().await?;
        let active = self.store.read_active_operation().await?;
        let last = self.store.read_last_operation().await?;

        let engine_status = match pool.pool_name.as_deref() {
            Some(name) => match self.engine.pool_status(name).await {
                Ok(status) => status,
                Err(e) => {
                    debug!(pool = name, "Engine status unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        let devices = pool
            .members
            .iter()
            .map(|member| {
                let known = self.registry.get(&member.id);
                PoolDeviceStatus {
                    id: member.id.clone(),
                    slot: known.as_ref().and_then(|d| d.slot),
                    size_class: member.size_class,
                    health: engine_status
                        .as_ref()
                        .and_then(|s| s.member(&member.id))
                        .map(|m| m.health),
                    present: known.map(|d| d.present).unwrap_or(false),
                }
            })
            .collect();

        let mut status = PoolStatus {
            exists: pool.exists(),
            name: pool.pool_name.clone(),
            raid_type: pool.exists().then_some(pool.raid_type),
            status: engine_status.as_ref().map(|s| s.health),
            devices,
            usable_space: pool.usable_space(),
            replace: None,
            failsafe_transition_status: None,
            expansion: None,
            rebuild: None,
        };

        let owns_resilver = active.as_ref().is_some_and(|r| {
            !r.is_terminal()
                && matches!(r.topic(), ProgressTopic::Replace | ProgressTopic::FailsafeTransition)
        });
        if !owns_resilver {
            status.rebuild = engine_status
                .as_ref()
                .and_then(|s| s.scan)
                .and_then(|scan| self.rebuild_status(scan));
        }

        // the last outcome first so an active operation of the same kind wins
        for (record, is_active) in last.iter().map(|r| (r, false)).chain(active.iter().map(|r| (r, true))) {
            let view = Some(OperationProgress::from_record(record, is_active));
            match record.topic() {
                ProgressTopic::Replace => status.replace = view,
                ProgressTopic::FailsafeTransition => status.failsafe_transition_status = view,
                ProgressTopic::Expansion => status.expansion = view,
                ProgressTopic::Rebuild => {}
            }
        }

        Ok(status)
    }

    fn rebuild_status(&self, scan: ScanStatus) -> Option<RebuildStatus> {
        if scan.kind != ScanKind::Resilver {
            return None;
        }
        let mut floor = self.rebuild_floor.lock();
        let (state, progress) = match scan.state {
            ScanState::Scanning => {
                let progress = scan.percent().min(MAX_RUNNING_PROGRESS).max(*floor);
                *floor = progress;
                (RebuildState::Rebuilding, progress)
            }
            ScanState::Finished => {
                *floor = 0;
                (RebuildState::Finished, 100)
            }
            ScanState::Canceled => {
                let progress = scan.percent().min(MAX_RUNNING_PROGRESS).max(*floor);
                *floor = 0;
                (RebuildState::Canceled, progress)
            }
        };
        Some(RebuildStatus { state, progress })
    }
}

// =============================================================================
// Rebuild Monitor
// =============================================================================

/// Publishes engine-initiated rebuilds on [`ProgressTopic::Rebuild`]
pub struct RebuildMonitor {
    status: StatusReader,
    bus: Arc<ProgressEventBus>,
    interval: Duration,
}

impl RebuildMonitor {
    pub fn new(status: StatusReader, bus: Arc<ProgressEventBus>, interval: Duration) -> Self {
        Self {
            status,
            bus,
            interval,
        }
    }

    /// Poll until `shutdown` fires. Only changes are published, and a
    /// terminal state only after a running one.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting rebuild monitor");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last: Option<RebuildStatus> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }

            let rebuild = match self.status.current_status().await {
                Ok(status) => status.rebuild,
                Err(e) => {
                    debug!(error = %e, "Rebuild monitor skipped a tick");
                    continue;
                }
            };
            let Some(rebuild) = rebuild else {
                continue;
            };
            let follows_running = matches!(last, Some(l) if !l.state.is_terminal());
            if last == Some(rebuild) || (rebuild.state.is_terminal() && !follows_running) {
                continue;
            }

            debug!(state = %ProgressState::from(rebuild.state), progress = rebuild.progress, "Rebuild progress");
            self.bus.publish(rebuild.event());
            last = Some(rebuild);
        }
    }
}

/// Sync phase: engine completion fraction scaled into 0..=49
pub fn sync_phase_progress(fraction: f64) -> u8 {
    let pct = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u32;
    (pct.min(99) * 49 / 100) as u8
}

/// Rebuild phase: resilver percent scaled into 51..=99
pub fn rebuild_phase_progress(percent: u8) -> u8 {
    let scaled = 51 + u32::from(percent.min(100)) * 48 / 100;
    scaled.min(u32::from(MAX_RUNNING_PROGRESS)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::{ReplaceState, TransitionState};
    use crate::store::{MemoryStateStore, StateStore};
    use futures::StreamExt;

    fn replace_record() -> OperationRecord {
        OperationRecord::new(OperationKind::ReplaceDevice {
            old_device: "nvme-a".into(),
            new_device: "nvme-b".into(),
            new_size_class: CapacityClass(4_000_000_000_000),
            state: ReplaceState::Rebuilding,
            progress: 0,
            engine_submitted: false,
            error: None,
        })
    }

    async fn writer(store: Arc<MemoryStateStore>, bus: Arc<ProgressEventBus>) -> ProgressWriter {
        ProgressWriter::claim(replace_record(), store, bus, RaidMetrics::new().unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_phase_scaling() {
        assert_eq!(sync_phase_progress(0.0), 0);
        assert_eq!(sync_phase_progress(0.5), 24);
        assert_eq!(sync_phase_progress(1.0), 48);
        assert!(sync_phase_progress(1.0) < 50);

        assert_eq!(rebuild_phase_progress(0), 51);
        assert_eq!(rebuild_phase_progress(50), 75);
        assert_eq!(rebuild_phase_progress(100), 99);
    }

    #[tokio::test]
    async fn test_writer_is_monotonic_and_capped() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(64);
        let mut sub = bus.subscribe(ProgressTopic::Replace);
        let mut w = writer(store.clone(), bus.clone()).await;

        w.advance(ReplaceState::Rebuilding, 40).await.unwrap();
        w.advance(ReplaceState::Rebuilding, 30).await.unwrap();
        w.advance(ReplaceState::Rebuilding, 100).await.unwrap();
        assert_eq!(w.progress(), 99);
        let stored = store.read_active_operation().await.unwrap().unwrap();
        assert_eq!(stored.progress(), 99);

        let done = w.finish(ReplaceState::Finished, None).await.unwrap();
        assert_eq!(done.progress(), 100);

        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            seen.push(event.progress);
        }
        // initial announce, 40, 99, 100; the regression to 30 was absorbed
        assert_eq!(seen, vec![0, 40, 99, 100]);
    }

    #[tokio::test]
    async fn test_store_is_written_before_publish() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(64);
        let sub = bus.subscribe(ProgressTopic::Replace);
        let mut w = writer(store.clone(), bus.clone()).await;

        let mut stream = Box::pin(sub.into_stream());
        let _initial = stream.next().await.unwrap();

        w.advance(ReplaceState::Rebuilding, 55).await.unwrap();
        let event = stream.next().await.unwrap();
        let stored = store.read_active_operation().await.unwrap().unwrap();
        assert!(stored.progress() >= event.progress);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(64);
        let mut w = writer(store.clone(), bus.clone()).await;
        w.advance(ReplaceState::Rebuilding, 20).await.unwrap();

        let mut late = bus.subscribe(ProgressTopic::Replace);
        assert!(late.try_recv().is_none());

        w.advance(ReplaceState::Rebuilding, 21).await.unwrap();
        assert_eq!(late.try_recv().unwrap().progress, 21);
    }

    #[tokio::test]
    async fn test_error_keeps_last_progress() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(8);
        let record = OperationRecord::new(OperationKind::FailsafeTransition {
            original_device: "nvme-a".into(),
            original_size_class: CapacityClass(2_000_000_000_000),
            new_device: "nvme-b".into(),
            new_size_class: CapacityClass(2_000_000_000_000),
            state: TransitionState::Syncing,
            progress: 0,
            members_joined: false,
            error: None,
        });
        let mut w = ProgressWriter::claim(record, store.clone(), bus, RaidMetrics::new().unwrap())
            .await
            .unwrap();
        w.advance(TransitionState::Syncing, 31).await.unwrap();

        let done = w
            .finish(TransitionState::Error, Some("send failed".into()))
            .await
            .unwrap();
        assert_eq!(done.progress(), 31);
        assert_eq!(done.error(), Some("send failed"));
        assert!(store.read_active_operation().await.unwrap().is_none());
        assert_eq!(store.read_last_operation().await.unwrap().unwrap().id, done.id);
    }

    #[tokio::test]
    async fn test_writer_loses_slot_once_finished_elsewhere() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(8);
        let w = writer(store.clone(), bus.clone()).await;
        assert!(w.holds_slot().await.unwrap());

        let mut other = ProgressWriter::resume(w.record().clone(), store.clone(), bus, RaidMetrics::new().unwrap());
        other.advance(ReplaceState::Rebuilding, 5).await.unwrap();
        other.finish(ReplaceState::Canceled, None).await.unwrap();
        assert!(!w.holds_slot().await.unwrap());
    }

    #[test]
    fn test_rebuild_event_shape() {
        let rebuild = RebuildStatus {
            state: RebuildState::Rebuilding,
            progress: 37,
        };
        let event = rebuild.event();
        assert_eq!(event.topic, ProgressTopic::Rebuild);
        assert!(event.operation_id.is_none());
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"state": "rebuilding", "progress": 37})
        );
    }

    #[tokio::test]
    async fn test_advance_rejects_terminal_state() {
        let store = Arc::new(MemoryStateStore::new());
        let bus = ProgressEventBus::new(8);
        let mut w = writer(store, bus).await;
        assert!(w.advance(ReplaceState::Finished, 100).await.is_err());
    }
}
