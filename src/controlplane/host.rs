//! Host Adapters
//!
//! Implementations of [`HostControl`]: the real system adapter that reboots
//! via the init system and reads boot-layer markers from disk, and a
//! recording adapter used by standalone mode and tests.

use crate::domain::ports::HostControl;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

/// System host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Written by the boot layer when the pool failed to mount
    pub mount_error_marker: PathBuf,
    /// Present once the first user account has been created
    pub account_marker: PathBuf,
    /// Command line used to reboot
    pub reboot_command: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mount_error_marker: PathBuf::from("/run/raid-manager/mount-error"),
            account_marker: PathBuf::from("/var/lib/raid-manager/account"),
            reboot_command: vec!["systemctl".to_string(), "reboot".to_string()],
        }
    }
}

/// Host adapter for the appliance
pub struct SystemHost {
    config: HostConfig,
}

impl SystemHost {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostControl for SystemHost {
    async fn reboot(&self) -> Result<()> {
        let (program, args) = self
            .config
            .reboot_command
            .split_first()
            .ok_or_else(|| Error::Configuration("empty reboot command".into()))?;

        info!(command = %self.config.reboot_command.join(" "), "Rebooting host");
        let status = Command::new(program).args(args).status().await?;
        if !status.success() {
            return Err(Error::Internal(format!("reboot command exited with {}", status)));
        }
        Ok(())
    }

    async fn mount_failure_reported(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.config.mount_error_marker).await?)
    }

    async fn account_exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.config.account_marker).await?)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    reboots: u32,
    mount_failure: bool,
    account: bool,
}

/// Host adapter that records reboots instead of performing them
#[derive(Debug, Default)]
pub struct RecordingHost {
    state: Mutex<Recorded>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reboots requested so far
    pub fn reboots(&self) -> u32 {
        self.state.lock().reboots
    }

    pub fn set_mount_failure(&self, failed: bool) {
        self.state.lock().mount_failure = failed;
    }

    pub fn set_account(&self, exists: bool) {
        self.state.lock().account = exists;
    }
}

#[async_trait]
impl HostControl for RecordingHost {
    async fn reboot(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.reboots += 1;
        warn!(reboots = state.reboots, "Reboot requested, not performed");
        Ok(())
    }

    async fn mount_failure_reported(&self) -> Result<bool> {
        Ok(self.state.lock().mount_failure)
    }

    async fn account_exists(&self) -> Result<bool> {
        Ok(self.state.lock().account)
    }
}
