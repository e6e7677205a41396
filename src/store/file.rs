//! File-backed State Store
//!
//! Keeps the descriptor as YAML and the operation slots as JSON under a
//! state directory. Writes go to a temporary file that is synced and then
//! renamed over the target.

use crate::domain::{OperationRecord, PoolDescriptor};
use crate::error::Result;
use crate::store::{OperationSlots, StateStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// State store rooted at a directory
pub struct FileStateStore {
    root: PathBuf,
    pool_path: PathBuf,
    operation_path: PathBuf,
    /// Serializes read-modify-write cycles on the operation file
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open (creating the directory if needed) the store for `pool_key`
    pub async fn open(root: impl Into<PathBuf>, pool_key: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            pool_path: root.join(format!("{}.pool.yaml", pool_key)),
            operation_path: root.join(format!("{}.operation.json", pool_key)),
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the state files
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_slots(&self) -> Result<OperationSlots> {
        read_or_default(&self.operation_path, |s| Ok(serde_json::from_str(s)?)).await
    }

    async fn write_slots(&self, slots: &OperationSlots) -> Result<()> {
        let json = serde_json::to_vec_pretty(slots)?;
        write_atomic(&self.operation_path, &json).await
    }
}

async fn read_or_default<T, F>(path: &Path, parse: F) -> Result<T>
where
    T: Default + DeserializeOwned,
    F: FnOnce(&str) -> Result<T>,
{
    match fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(T::default()),
        Ok(contents) => parse(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), bytes = contents.len(), "State file written");
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read_pool_descriptor(&self) -> Result<PoolDescriptor> {
        let pool: PoolDescriptor =
            read_or_default(&self.pool_path, |s| Ok(serde_yaml::from_str(s)?)).await?;
        pool.validate()?;
        Ok(pool)
    }

    async fn write_pool_descriptor(&self, pool: &PoolDescriptor) -> Result<()> {
        pool.validate()?;
        let _guard = self.write_lock.lock().await;
        let yaml = serde_yaml::to_string(pool)?;
        write_atomic(&self.pool_path, yaml.as_bytes()).await
    }

    async fn read_active_operation(&self) -> Result<Option<OperationRecord>> {
        Ok(self.read_slots().await?.active)
    }

    async fn read_last_operation(&self) -> Result<Option<OperationRecord>> {
        Ok(self.read_slots().await?.last)
    }

    async fn claim_operation(&self, record: &OperationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut slots = self.read_slots().await?;
        slots.claim(record)?;
        self.write_slots(&slots).await
    }

    async fn write_active_operation(&self, record: &OperationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut slots = self.read_slots().await?;
        slots.update(record)?;
        self.write_slots(&slots).await
    }

    async fn finish_operation(&self, record: &OperationRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut slots = self.read_slots().await?;
        slots.finish(record)?;
        self.write_slots(&slots).await
    }

    async fn clear_active_operation(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut slots = self.read_slots().await?;
        if slots.active.take().is_some() {
            self.write_slots(&slots).await?;
        }
        Ok(())
    }

    async fn read_setup_failure(&self) -> Result<Option<String>> {
        Ok(self.read_slots().await?.setup_failure)
    }

    async fn write_setup_failure(&self, message: Option<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut slots = self.read_slots().await?;
        slots.setup_failure = message;
        self.write_slots(&slots).await
    }
}
