//! Pool State Store
//!
//! Durable record of the pool descriptor and of the single operation slot.
//! Every write is atomic: a reader sees either the previous or the new
//! value, never a partial one.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::domain::{OperationRecord, PoolDescriptor};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// StateStore Trait
// =============================================================================

/// Persistence for the pool descriptor and operation records.
///
/// The store holds at most one active (non-terminal) operation. Finished
/// operations move to a "last" slot so a restarted process can still report
/// how the previous operation ended.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the descriptor. A missing record reads as "no pool".
    async fn read_pool_descriptor(&self) -> Result<PoolDescriptor>;

    /// Replace the descriptor
    async fn write_pool_descriptor(&self, pool: &PoolDescriptor) -> Result<()>;

    /// The operation occupying the slot, if any
    async fn read_active_operation(&self) -> Result<Option<OperationRecord>>;

    /// The most recently finished operation, if any
    async fn read_last_operation(&self) -> Result<Option<OperationRecord>>;

    /// Occupy the slot with a new operation.
    ///
    /// Fails with `OperationInProgress` when a non-terminal operation
    /// already holds it; the held record is left untouched.
    async fn claim_operation(&self, record: &OperationRecord) -> Result<()>;

    /// Overwrite the active record. The ids must match.
    async fn write_active_operation(&self, record: &OperationRecord) -> Result<()>;

    /// Record the terminal state and free the slot in one write
    async fn finish_operation(&self, record: &OperationRecord) -> Result<()>;

    /// Free the slot without recording an outcome
    async fn clear_active_operation(&self) -> Result<()>;

    /// Failure message left by the last initial setup attempt
    async fn read_setup_failure(&self) -> Result<Option<String>>;

    /// Record (or clear, with `None`) the initial setup outcome
    async fn write_setup_failure(&self, message: Option<String>) -> Result<()>;
}

/// Type alias for a shared state store
pub type StateStoreRef = Arc<dyn StateStore>;

/// Both slots of the operation record, persisted together
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct OperationSlots {
    pub active: Option<OperationRecord>,
    pub last: Option<OperationRecord>,
    #[serde(default)]
    pub setup_failure: Option<String>,
}

impl OperationSlots {
    pub(crate) fn claim(&mut self, record: &OperationRecord) -> Result<()> {
        if let Some(active) = &self.active {
            if !active.is_terminal() {
                return Err(crate::error::Error::OperationInProgress {
                    kind: active.kind_name().to_string(),
                });
            }
            self.last = self.active.take();
        }
        self.active = Some(record.clone());
        Ok(())
    }

    pub(crate) fn update(&mut self, record: &OperationRecord) -> Result<()> {
        match &self.active {
            Some(active) if active.id == record.id => {
                self.active = Some(record.clone());
                Ok(())
            }
            Some(active) => Err(crate::error::Error::Internal(format!(
                "operation {} does not hold the slot (held by {})",
                record.id, active.id
            ))),
            None => Err(crate::error::Error::Internal(format!(
                "operation {} does not hold the slot (slot is free)",
                record.id
            ))),
        }
    }

    pub(crate) fn finish(&mut self, record: &OperationRecord) -> Result<()> {
        self.update(record)?;
        self.last = self.active.take();
        Ok(())
    }
}
