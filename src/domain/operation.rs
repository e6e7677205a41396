//! Operation Records
//!
//! Serializable state of the three mutating operations. A record is written
//! to the state store on every transition so that an operation can be
//! reconstructed by a freshly started process, including across a reboot.

use crate::domain::ports::{DeviceId, RaidType};
use crate::error::{Error, Result};
use crate::hardware::classification::CapacityClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest progress value reported while work is still running
pub const MAX_RUNNING_PROGRESS: u8 = 99;

/// Progress at which a failsafe transition waits for the reboot
pub const REBOOT_PROGRESS: u8 = 50;

/// First progress value of the post-reboot rebuild phase
pub const REBUILD_START_PROGRESS: u8 = 51;

// =============================================================================
// Per-Operation States
// =============================================================================

/// AddDevice states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionState {
    Expanding,
    Finished,
    Canceled,
}

/// ReplaceDevice states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceState {
    Rebuilding,
    Finished,
    Canceled,
}

/// States of a resilver the engine runs outside any operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildState {
    Rebuilding,
    Finished,
    Canceled,
}

/// TransitionToFailsafe states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionState {
    Syncing,
    Rebooting,
    Rebuilding,
    Complete,
    Error,
}

impl ExpansionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExpansionState::Expanding)
    }
}

impl ReplaceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplaceState::Rebuilding)
    }
}

impl RebuildState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RebuildState::Rebuilding)
    }
}

impl TransitionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransitionState::Complete | TransitionState::Error)
    }

    /// States a restarted process must resume rather than abandon
    pub fn survives_reboot(&self) -> bool {
        matches!(self, TransitionState::Rebooting | TransitionState::Rebuilding)
    }
}

/// State of any operation, serialized as its bare name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ProgressState {
    Expansion(ExpansionState),
    Replace(ReplaceState),
    Transition(TransitionState),
    Rebuild(RebuildState),
}

impl From<ExpansionState> for ProgressState {
    fn from(state: ExpansionState) -> Self {
        ProgressState::Expansion(state)
    }
}

impl From<ReplaceState> for ProgressState {
    fn from(state: ReplaceState) -> Self {
        ProgressState::Replace(state)
    }
}

impl From<TransitionState> for ProgressState {
    fn from(state: TransitionState) -> Self {
        ProgressState::Transition(state)
    }
}

impl From<RebuildState> for ProgressState {
    fn from(state: RebuildState) -> Self {
        ProgressState::Rebuild(state)
    }
}

impl ProgressState {
    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressState::Expansion(s) => s.is_terminal(),
            ProgressState::Replace(s) => s.is_terminal(),
            ProgressState::Transition(s) => s.is_terminal(),
            ProgressState::Rebuild(s) => s.is_terminal(),
        }
    }

    /// Terminal states that count as success
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ProgressState::Expansion(ExpansionState::Finished)
                | ProgressState::Replace(ReplaceState::Finished)
                | ProgressState::Transition(TransitionState::Complete)
                | ProgressState::Rebuild(RebuildState::Finished)
        )
    }
}

impl std::fmt::Display for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProgressState::Expansion(ExpansionState::Expanding) => "expanding",
            ProgressState::Expansion(ExpansionState::Finished)
            | ProgressState::Replace(ReplaceState::Finished)
            | ProgressState::Rebuild(RebuildState::Finished) => "finished",
            ProgressState::Expansion(ExpansionState::Canceled)
            | ProgressState::Replace(ReplaceState::Canceled)
            | ProgressState::Rebuild(RebuildState::Canceled) => "canceled",
            ProgressState::Replace(ReplaceState::Rebuilding)
            | ProgressState::Transition(TransitionState::Rebuilding)
            | ProgressState::Rebuild(RebuildState::Rebuilding) => "rebuilding",
            ProgressState::Transition(TransitionState::Syncing) => "syncing",
            ProgressState::Transition(TransitionState::Rebooting) => "rebooting",
            ProgressState::Transition(TransitionState::Complete) => "complete",
            ProgressState::Transition(TransitionState::Error) => "error",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Topics and Events
// =============================================================================

/// Push channels for progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressTopic {
    Expansion,
    Replace,
    FailsafeTransition,
    /// Resilvers the engine started on its own
    Rebuild,
}

impl ProgressTopic {
    pub const ALL: [ProgressTopic; 4] = [
        ProgressTopic::Expansion,
        ProgressTopic::Replace,
        ProgressTopic::FailsafeTransition,
        ProgressTopic::Rebuild,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressTopic::Expansion => "raid:expansion-progress",
            ProgressTopic::Replace => "raid:replace-progress",
            ProgressTopic::FailsafeTransition => "raid:failsafe-transition-progress",
            ProgressTopic::Rebuild => "raid:rebuild-progress",
        }
    }
}

impl std::fmt::Display for ProgressTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProgressTopic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProgressTopic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown progress topic: {}", s)))
    }
}

/// A progress update as delivered on a push topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    #[serde(skip)]
    pub topic: ProgressTopic,
    /// Absent for rebuilds the engine started on its own
    #[serde(skip)]
    pub operation_id: Option<String>,
    pub state: ProgressState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Operation Record
// =============================================================================

/// Kind-specific operation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OperationKind {
    AddDevice {
        device: DeviceId,
        size_class: CapacityClass,
        raid_type: RaidType,
        state: ExpansionState,
        progress: u8,
        /// Set once the engine accepted the new member
        #[serde(default)]
        engine_submitted: bool,
        #[serde(default)]
        error: Option<String>,
    },
    ReplaceDevice {
        old_device: DeviceId,
        new_device: DeviceId,
        new_size_class: CapacityClass,
        state: ReplaceState,
        progress: u8,
        #[serde(default)]
        engine_submitted: bool,
        #[serde(default)]
        error: Option<String>,
    },
    FailsafeTransition {
        original_device: DeviceId,
        original_size_class: CapacityClass,
        new_device: DeviceId,
        new_size_class: CapacityClass,
        state: TransitionState,
        progress: u8,
        /// Set once the original device has been joined to the new group
        #[serde(default)]
        members_joined: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Persisted record of one operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub operation: OperationKind,
}

impl OperationRecord {
    /// Start a new record
    pub fn new(operation: OperationKind) -> Self {
        let now = Utc::now();
        Self {
            id: generate_operation_id(now),
            started_at: now,
            updated_at: now,
            operation,
        }
    }

    /// Stable kind name used in logs, metrics and errors
    pub fn kind_name(&self) -> &'static str {
        match self.operation {
            OperationKind::AddDevice { .. } => "add-device",
            OperationKind::ReplaceDevice { .. } => "replace-device",
            OperationKind::FailsafeTransition { .. } => "failsafe-transition",
        }
    }

    pub fn topic(&self) -> ProgressTopic {
        match self.operation {
            OperationKind::AddDevice { .. } => ProgressTopic::Expansion,
            OperationKind::ReplaceDevice { .. } => ProgressTopic::Replace,
            OperationKind::FailsafeTransition { .. } => ProgressTopic::FailsafeTransition,
        }
    }

    pub fn state(&self) -> ProgressState {
        match &self.operation {
            OperationKind::AddDevice { state, .. } => (*state).into(),
            OperationKind::ReplaceDevice { state, .. } => (*state).into(),
            OperationKind::FailsafeTransition { state, .. } => (*state).into(),
        }
    }

    pub fn progress(&self) -> u8 {
        match &self.operation {
            OperationKind::AddDevice { progress, .. }
            | OperationKind::ReplaceDevice { progress, .. }
            | OperationKind::FailsafeTransition { progress, .. } => *progress,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.operation {
            OperationKind::AddDevice { error, .. }
            | OperationKind::ReplaceDevice { error, .. }
            | OperationKind::FailsafeTransition { error, .. } => error.as_deref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether `id` is a device this operation is adding or replacing
    pub fn targets(&self, id: &DeviceId) -> bool {
        match &self.operation {
            OperationKind::AddDevice { device, .. } => device == id,
            OperationKind::ReplaceDevice {
                old_device,
                new_device,
                ..
            } => old_device == id || new_device == id,
            OperationKind::FailsafeTransition {
                original_device,
                new_device,
                ..
            } => original_device == id || new_device == id,
        }
    }

    /// Event mirroring this record
    pub fn event(&self) -> ProgressEvent {
        ProgressEvent {
            topic: self.topic(),
            operation_id: Some(self.id.clone()),
            state: self.state(),
            progress: self.progress(),
            error: self.error().map(str::to_string),
        }
    }

    /// Move to a new state. The state must belong to this operation kind.
    pub fn apply(&mut self, next: ProgressState, value: u8, message: Option<String>) -> Result<()> {
        let value = value.min(100);
        match (&mut self.operation, next) {
            (
                OperationKind::AddDevice {
                    state,
                    progress,
                    error,
                    ..
                },
                ProgressState::Expansion(s),
            ) => {
                *state = s;
                *progress = value;
                if message.is_some() {
                    *error = message;
                }
            }
            (
                OperationKind::ReplaceDevice {
                    state,
                    progress,
                    error,
                    ..
                },
                ProgressState::Replace(s),
            ) => {
                *state = s;
                *progress = value;
                if message.is_some() {
                    *error = message;
                }
            }
            (
                OperationKind::FailsafeTransition {
                    state,
                    progress,
                    error,
                    ..
                },
                ProgressState::Transition(s),
            ) => {
                *state = s;
                *progress = value;
                if message.is_some() {
                    *error = message;
                }
            }
            (_, other) => {
                return Err(Error::Internal(format!(
                    "state {} does not belong to a {} operation",
                    other,
                    self.kind_name()
                )))
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn generate_operation_id(now: DateTime<Utc>) -> String {
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
    format!("op-{:016x}", nanos)
}
