//! Bay Scanner
//!
//! Enumerates the NVMe namespaces behind the fixed internal bays from sysfs
//! and resolves each to a hardware-stable id through `/dev/disk/by-id`.
//! The physical slot comes from the controller's PCI address via the bay map.

use crate::domain::ports::{DeviceId, DeviceProber, ProbedDevice};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the bay scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// udev by-id symlink directory
    pub by_id_dir: PathBuf,
    /// udev by-path symlink directory
    pub by_path_dir: PathBuf,
    /// PCI address (e.g. `0000:01:00.0`) to bay number
    pub bay_map: BTreeMap<String, u8>,
    /// Minimum device size to include (bytes)
    pub min_size_bytes: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            by_path_dir: PathBuf::from("/dev/disk/by-path"),
            bay_map: BTreeMap::new(),
            min_size_bytes: 1_000_000_000, // 1GB minimum
        }
    }
}

/// Parse a bay map of the form `0000:01:00.0=1,0000:02:00.0=2`
pub fn parse_bay_map(raw: &str) -> Result<BTreeMap<String, u8>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (addr, slot) = entry
            .split_once('=')
            .ok_or_else(|| Error::Configuration(format!("bay map entry without '=': {}", entry)))?;
        let slot: u8 = slot
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid bay number in: {}", entry)))?;
        map.insert(addr.trim().to_lowercase(), slot);
    }
    Ok(map)
}

// =============================================================================
// Bay Scanner
// =============================================================================

/// Scans the internal NVMe bays on Linux systems
pub struct BayScanner {
    config: ScannerConfig,
}

impl BayScanner {
    /// Create a new bay scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Create a scanner with default configuration
    pub fn default_scanner() -> Self {
        Self::new(ScannerConfig::default())
    }

    /// Enumerate every NVMe namespace currently present
    pub fn scan(&self) -> Result<Vec<ProbedDevice>> {
        let block_path = self.config.sysfs_path.join("class/block");
        if !block_path.exists() {
            return Err(Error::HardwareDiscovery(format!(
                "Block device sysfs not found at {}",
                block_path.display()
            )));
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_nvme_namespace(&name) && !entry.path().join("partition").exists() {
                names.push(name);
            }
        }
        // nvme2n1 before nvme10n1
        names.sort_by_key(|n| namespace_sort_key(n));

        let mut devices = Vec::new();
        for (order, name) in names.iter().enumerate() {
            match self.scan_namespace(&block_path.join(name), name, order) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => warn!(device = %name, "Skipping unreadable device: {}", e),
            }
        }

        info!("Found {} NVMe devices", devices.len());
        Ok(devices)
    }

    /// Scan a single namespace. `None` if it is below the size floor.
    fn scan_namespace(&self, sysfs_path: &Path, name: &str, order: usize) -> Result<Option<ProbedDevice>> {
        // Read size (in 512-byte sectors)
        let size_str = self.read_sysfs_attr(sysfs_path, "size")?;
        let sectors: u64 = size_str.trim().parse().map_err(|_| {
            Error::HardwareDiscovery(format!("Invalid size: {}", size_str.trim()))
        })?;
        let size_bytes = sectors * 512;
        if size_bytes < self.config.min_size_bytes {
            debug!(device = %name, size_bytes, "Below minimum size, ignored");
            return Ok(None);
        }

        let model = self
            .read_sysfs_attr(sysfs_path, "device/model")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "Unknown".to_string());
        let serial = self
            .read_sysfs_attr(sysfs_path, "device/serial")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "Unknown".to_string());

        let id = self
            .resolve_stable_id(name)
            .unwrap_or_else(|| synthesize_id(&model, &serial));

        let slot = if self.config.bay_map.is_empty() {
            u8::try_from(order + 1).ok()
        } else {
            self.resolve_pci_address(name)
                .and_then(|addr| self.config.bay_map.get(&addr).copied())
        };

        debug!(device = %name, id = %id, ?slot, size_bytes, "Scanned NVMe namespace");

        Ok(Some(ProbedDevice {
            id,
            slot,
            device_path: format!("/dev/{}", name),
            size_bytes,
            model,
            serial,
        }))
    }

    /// Find the by-id link pointing at `name`, preferring model/serial
    /// names over `nvme-eui.*` aliases
    fn resolve_stable_id(&self, name: &str) -> Option<DeviceId> {
        let pattern = format!("{}/nvme-*", self.config.by_id_dir.display());
        let mut eui = None;

        for link in glob::glob(&pattern).ok()?.flatten() {
            let link_name = match link.file_name() {
                Some(n) => n.to_string_lossy().to_string(),
                None => continue,
            };
            if is_partition_link(&link_name) || !link_points_at(&link, name) {
                continue;
            }
            if link_name.starts_with("nvme-eui.") {
                eui.get_or_insert(link_name);
                continue;
            }
            return Some(DeviceId::new(link_name));
        }

        eui.map(DeviceId::new)
    }

    /// PCI address of the controller behind `name`, from the by-path links
    fn resolve_pci_address(&self, name: &str) -> Option<String> {
        let pattern = format!("{}/pci-*", self.config.by_path_dir.display());

        for link in glob::glob(&pattern).ok()?.flatten() {
            let link_name = match link.file_name() {
                Some(n) => n.to_string_lossy().to_string(),
                None => continue,
            };
            if is_partition_link(&link_name) || !link_points_at(&link, name) {
                continue;
            }
            // pci-0000:01:00.0-nvme-1
            let addr = link_name.strip_prefix("pci-")?.split('-').next()?;
            return Some(addr.to_lowercase());
        }
        None
    }

    /// Read a sysfs attribute
    fn read_sysfs_attr(&self, base_path: &Path, attr: &str) -> Result<String> {
        let path = base_path.join(attr);
        fs::read_to_string(&path).map_err(|e| {
            Error::HardwareDiscovery(format!("Failed to read {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl DeviceProber for BayScanner {
    async fn probe(&self) -> Result<Vec<ProbedDevice>> {
        self.scan()
    }
}

/// `nvme0n1` but not `nvme0n1p1` or the controller node `nvme0`
fn is_nvme_namespace(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    match rest.split_once('n') {
        Some((ctrl, ns)) => {
            !ctrl.is_empty()
                && !ns.is_empty()
                && ctrl.chars().all(|c| c.is_ascii_digit())
                && ns.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn namespace_sort_key(name: &str) -> (u32, u32) {
    let parse = |s: &str| s.parse().unwrap_or(u32::MAX);
    name.strip_prefix("nvme")
        .and_then(|rest| rest.split_once('n'))
        .map(|(ctrl, ns)| (parse(ctrl), parse(ns)))
        .unwrap_or((u32::MAX, u32::MAX))
}

fn is_partition_link(link_name: &str) -> bool {
    match link_name.rsplit_once("-part") {
        Some((_, n)) => !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

fn link_points_at(link: &Path, name: &str) -> bool {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|f| f == name))
        .unwrap_or(false)
}

/// udev-style id for devices without a by-id link
fn synthesize_id(model: &str, serial: &str) -> DeviceId {
    let model = model.split_whitespace().collect::<Vec<_>>().join("_");
    DeviceId::new(format!("nvme-{}_{}", model, serial))
}
