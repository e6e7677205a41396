//! In-memory State Store
//!
//! Volatile store used by tests and by the simulated engine mode.

use crate::domain::{OperationRecord, PoolDescriptor};
use crate::error::Result;
use crate::store::{OperationSlots, StateStore};
use async_trait::async_trait;
use parking_lot::Mutex;

/// State store that lives only as long as the process
#[derive(Default)]
pub struct MemoryStateStore {
    pool: Mutex<PoolDescriptor>,
    slots: Mutex<OperationSlots>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a descriptor
    pub fn with_pool(pool: PoolDescriptor) -> Self {
        Self {
            pool: Mutex::new(pool),
            slots: Mutex::new(OperationSlots::default()),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read_pool_descriptor(&self) -> Result<PoolDescriptor> {
        Ok(self.pool.lock().clone())
    }

    async fn write_pool_descriptor(&self, pool: &PoolDescriptor) -> Result<()> {
        pool.validate()?;
        *self.pool.lock() = pool.clone();
        Ok(())
    }

    async fn read_active_operation(&self) -> Result<Option<OperationRecord>> {
        Ok(self.slots.lock().active.clone())
    }

    async fn read_last_operation(&self) -> Result<Option<OperationRecord>> {
        Ok(self.slots.lock().last.clone())
    }

    async fn claim_operation(&self, record: &OperationRecord) -> Result<()> {
        self.slots.lock().claim(record)
    }

    async fn write_active_operation(&self, record: &OperationRecord) -> Result<()> {
        self.slots.lock().update(record)
    }

    async fn finish_operation(&self, record: &OperationRecord) -> Result<()> {
        self.slots.lock().finish(record)
    }

    async fn clear_active_operation(&self) -> Result<()> {
        self.slots.lock().active = None;
        Ok(())
    }

    async fn read_setup_failure(&self) -> Result<Option<String>> {
        Ok(self.slots.lock().setup_failure.clone())
    }

    async fn write_setup_failure(&self, message: Option<String>) -> Result<()> {
        self.slots.lock().setup_failure = message;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExpansionState, OperationKind, RaidType};
    use crate::error::Error;
    use crate::hardware::classification::CapacityClass;
    use assert_matches::assert_matches;

    fn add_op() -> OperationRecord {
        OperationRecord::new(OperationKind::AddDevice {
            device: "nvme-c".into(),
            size_class: CapacityClass(1_000_000_000_000),
            raid_type: RaidType::Failsafe,
            state: ExpansionState::Expanding,
            progress: 0,
            engine_submitted: false,
            error: None,
        })
    }

    #[tokio::test]
    async fn test_claim_and_finish() {
        let store = MemoryStateStore::new();
        let mut op = add_op();
        store.claim_operation(&op).await.unwrap();
        assert_matches!(
            store.claim_operation(&add_op()).await,
            Err(Error::OperationInProgress { .. })
        );

        op.apply(ExpansionState::Canceled.into(), 12, None).unwrap();
        store.finish_operation(&op).await.unwrap();
        assert!(store.read_active_operation().await.unwrap().is_none());
        assert_eq!(store.read_last_operation().await.unwrap().unwrap().id, op.id);
    }

    #[tokio::test]
    async fn test_rejects_invalid_descriptor() {
        let store = MemoryStateStore::new();
        let mut bad = PoolDescriptor::absent();
        bad.pool_name = Some("raid-1".into());
        assert_matches!(
            store.write_pool_descriptor(&bad).await,
            Err(Error::InconsistentDescriptor(_))
        );
    }
}
