//! ZFS Engine
//!
//! Drives the pooled storage engine through its command-line tools
//! (`zpool`, `zfs`, `sgdisk`, `blockdev`). Members are addressed by their
//! `/dev/disk/by-id` data partition so pool membership follows the device,
//! not its enumeration order.
//!
//! Failsafe migration works on a second pool built from the new device plus
//! an offlined sparse file standing in for the original device. The live
//! pool is snapshotted and sent into it; on reboot the boot layer imports
//! the migrated pool under the original name, after which the original
//! device is partitioned and resilvered in place of the sparse file.

use crate::domain::ports::{
    DeviceId, EngineMember, EngineStatus, ImportCandidate, MigrationProgress, PoolEngine,
    PoolHealth, RaidType, ScanKind, ScanState, ScanStatus,
};
use crate::error::{Error, Result};
use crate::hardware::classification::CapacityClass;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;
const MIGRATION_SNAPSHOT: &str = "migration";

// =============================================================================
// Configuration
// =============================================================================

/// ZFS engine configuration
#[derive(Debug, Clone)]
pub struct ZfsConfig {
    /// Directory of stable device links
    pub by_id_dir: PathBuf,
    /// Where migration scratch files and boot markers live
    pub state_dir: PathBuf,
    /// Parent of pool mount points
    pub mount_root: PathBuf,
    /// Size of the leading state partition
    pub state_partition_mib: u64,
    /// Space left unpartitioned at the end of the device
    pub buffer_mib: u64,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            by_id_dir: PathBuf::from("/dev/disk/by-id"),
            state_dir: PathBuf::from("/var/lib/raid-manager"),
            mount_root: PathBuf::from("/mnt"),
            state_partition_mib: 100,
            buffer_mib: 10,
        }
    }
}

/// Marker consumed by the boot layer to swap the migrated pool in
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MigrationMarker<'a> {
    pool: &'a str,
    migrated_pool: String,
    previous_pool: String,
    placeholder: PathBuf,
}

// =============================================================================
// ZFS Engine
// =============================================================================

pub struct ZfsEngine {
    config: ZfsConfig,
    estimates: Mutex<HashMap<String, u64>>,
}

impl ZfsEngine {
    pub fn new(config: ZfsConfig) -> Self {
        Self {
            config,
            estimates: Mutex::new(HashMap::new()),
        }
    }

    fn disk_path(&self, id: &DeviceId) -> String {
        self.config.by_id_dir.join(id.as_str()).display().to_string()
    }

    fn data_partition(&self, id: &DeviceId) -> String {
        format!("{}-part2", self.disk_path(id))
    }

    fn migrated_pool(pool: &str) -> String {
        format!("{}-next", pool)
    }

    fn previous_pool(pool: &str) -> String {
        format!("{}-previous", pool)
    }

    fn placeholder_path(&self, pool: &str) -> PathBuf {
        self.config.state_dir.join(format!("{}.placeholder", pool))
    }

    fn marker_path(&self, pool: &str) -> PathBuf {
        self.config.state_dir.join(format!("{}.migration.json", pool))
    }

    async fn output<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<Output> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        debug!(command = %format!("{} {}", program, args.join(" ")), "Running engine command");
        Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::EngineCommand {
                command: describe(program, &args),
                reason: e.to_string(),
            })
    }

    async fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<String> {
        let output = self.output(program, args).await?;
        if !output.status.success() {
            let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
            return Err(Error::EngineCommand {
                command: describe(program, &args),
                reason: failure_reason(&output),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn pool_imported(&self, pool: &str) -> bool {
        matches!(self.output("zpool", &["list", "-H", "-o", "name", pool]).await, Ok(o) if o.status.success())
    }

    async fn device_size(&self, id: &DeviceId) -> Result<u64> {
        let out = self.run("blockdev", &["--getsize64", self.disk_path(id).as_str()]).await?;
        out.trim()
            .parse()
            .map_err(|_| Error::EngineCommand {
                command: "blockdev --getsize64".into(),
                reason: format!("unexpected output {:?}", out.trim()),
            })
    }

    /// Lay out the state and data partitions; returns the data partition size
    async fn partition(&self, id: &DeviceId) -> Result<u64> {
        let class = CapacityClass::from_raw(self.device_size(id).await?);
        let data_mib = (class.bytes() / MIB)
            .checked_sub(self.config.state_partition_mib + self.config.buffer_mib)
            .filter(|mib| *mib > 0)
            .ok_or_else(|| Error::DeviceTooSmall {
                device: id.to_string(),
                class_bytes: class.bytes(),
                required_bytes: (self.config.state_partition_mib + self.config.buffer_mib + 1) * MIB,
            })?;

        let disk = self.disk_path(id);
        self.run("sgdisk", &["--zap-all", disk.as_str()]).await?;
        self.run(
            "sgdisk",
            &[
                format!("-n1:0:+{}M", self.config.state_partition_mib),
                "-t1:8300".to_string(),
                format!("-n2:0:+{}M", data_mib),
                "-t2:BF01".to_string(),
                disk.clone(),
            ],
        )
        .await?;
        if let Err(e) = self.run("udevadm", &["settle"]).await {
            warn!(device = %id, error = %e, "udevadm settle failed");
        }

        info!(device = %id, data_mib, "Partitioned device");
        Ok(data_mib * MIB)
    }

    async fn raw_status(&self, pool: &str) -> Result<Option<String>> {
        let output = self.output("zpool", &["status", "-j", "--json-int", pool]).await?;
        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()));
        }
        let reason = failure_reason(&output);
        if reason.contains("no such pool") {
            return Ok(None);
        }
        Err(Error::EngineCommand {
            command: "zpool status".into(),
            reason,
        })
    }

    async fn destroy_quietly(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args).await {
            debug!(error = %e, "Cleanup command failed");
        }
    }

    async fn remove_quietly(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove migration file"),
        }
    }
}

impl Default for ZfsEngine {
    fn default() -> Self {
        Self::new(ZfsConfig::default())
    }
}

#[async_trait]
impl PoolEngine for ZfsEngine {
    fn engine_name(&self) -> &str {
        "zfs"
    }

    async fn pool_status(&self, pool: &str) -> Result<Option<EngineStatus>> {
        match self.raw_status(pool).await? {
            Some(json) => Ok(Some(parse_status_json(pool, &json)?.status)),
            None => Ok(None),
        }
    }

    async fn create_pool(&self, pool: &str, devices: &[DeviceId], raid_type: RaidType) -> Result<()> {
        for device in devices {
            self.partition(device).await?;
        }

        let mountpoint = self.config.mount_root.join(pool).display().to_string();
        let mut args: Vec<String> = ["create", "-f", "-o", "ashift=12", "-o", "autoexpand=on", "-m"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(mountpoint);
        args.push(pool.to_string());
        if raid_type == RaidType::Failsafe {
            args.push("raidz1".to_string());
        }
        args.extend(devices.iter().map(|d| self.data_partition(d)));

        self.run("zpool", &args).await?;
        info!(pool, members = devices.len(), %raid_type, "Pool created");
        Ok(())
    }

    async fn add_member(&self, pool: &str, device: &DeviceId, raid_type: RaidType) -> Result<()> {
        self.partition(device).await?;
        let part = self.data_partition(device);

        match raid_type {
            RaidType::Storage => {
                self.run("zpool", &["add", "-f", pool, part.as_str()]).await?;
            }
            RaidType::Failsafe => {
                let json = self.raw_status(pool).await?.ok_or(Error::PoolMissing)?;
                let vdev = parse_status_json(pool, &json)?
                    .raidz_vdev
                    .ok_or_else(|| Error::EngineStatusParse(format!("{} has no raidz vdev", pool)))?;
                self.run("zpool", &["attach", "-f", pool, vdev.as_str(), part.as_str()]).await?;
            }
        }
        Ok(())
    }

    async fn replace_member(&self, pool: &str, old: &DeviceId, new: &DeviceId) -> Result<()> {
        self.partition(new).await?;
        self.run(
            "zpool",
            &["replace", "-f", pool, self.data_partition(old).as_str(), self.data_partition(new).as_str()],
        )
        .await?;
        Ok(())
    }

    async fn cancel_replace(&self, pool: &str, _old: &DeviceId, new: &DeviceId) -> Result<()> {
        self.run("zpool", &["detach", pool, self.data_partition(new).as_str()]).await?;
        Ok(())
    }

    async fn expand_member(&self, pool: &str, device: &DeviceId) -> Result<()> {
        self.run("zpool", &["online", "-e", pool, self.data_partition(device).as_str()]).await?;
        Ok(())
    }

    async fn prepare_migration(&self, pool: &str, current: &DeviceId, new: &DeviceId) -> Result<u64> {
        let data_bytes = self.partition(new).await?;
        let target = Self::migrated_pool(pool);
        let placeholder = self.placeholder_path(pool);

        tokio::fs::create_dir_all(&self.config.state_dir).await?;
        let file = tokio::fs::File::create(&placeholder).await?;
        file.set_len(data_bytes).await?;
        drop(file);

        let placeholder = placeholder.display().to_string();
        self.run(
            "zpool",
            &[
                "create", "-f", "-o", "ashift=12", "-o", "autoexpand=on", "-m", "none",
                target.as_str(), "raidz1", self.data_partition(new).as_str(), placeholder.as_str(),
            ],
        )
        .await?;
        self.run("zpool", &["offline", target.as_str(), placeholder.as_str()]).await?;
        // an offlined file vdev is replaced by path later; the file itself is not needed
        self.remove_quietly(&self.placeholder_path(pool)).await;

        let snapshot = format!("{}@{}", pool, MIGRATION_SNAPSHOT);
        self.run("zfs", &["snapshot", "-r", snapshot.as_str()]).await?;
        let dry_run = self.run("zfs", &["send", "--raw", "-R", "-nP", snapshot.as_str()]).await?;
        let estimated = parse_send_estimate(&dry_run).unwrap_or(0);
        self.estimates.lock().insert(pool.to_string(), estimated);

        info!(pool, current = %current, new = %new, estimated, "Migration prepared");
        Ok(estimated)
    }

    async fn sync_migration(&self, pool: &str) -> Result<()> {
        let snapshot = format!("{}@{}", pool, MIGRATION_SNAPSHOT);
        let target = Self::migrated_pool(pool);

        let mut send = Command::new("zfs")
            .args(["send", "--raw", "-R", snapshot.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stream: Stdio = send
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("zfs send has no stdout".into()))?
            .try_into()?;

        let receive = Command::new("zfs")
            .args(["receive", "-Fu", target.as_str()])
            .stdin(stream)
            .output()
            .await?;
        let sent = send.wait_with_output().await?;

        if !sent.status.success() {
            return Err(Error::EngineCommand {
                command: "zfs send".into(),
                reason: failure_reason(&sent),
            });
        }
        if !receive.status.success() {
            return Err(Error::EngineCommand {
                command: "zfs receive".into(),
                reason: failure_reason(&receive),
            });
        }
        Ok(())
    }

    async fn migration_progress(&self, pool: &str) -> Result<Option<MigrationProgress>> {
        let target = Self::migrated_pool(pool);
        let output = self.output("zfs", &["list", "-Hp", "-o", "used", target.as_str()]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let written = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0);
        let estimated = self.estimates.lock().get(pool).copied().unwrap_or(0);
        Ok(Some(MigrationProgress {
            written_bytes: written,
            estimated_bytes: estimated,
        }))
    }

    async fn stage_migration(&self, pool: &str) -> Result<()> {
        let marker = MigrationMarker {
            pool,
            migrated_pool: Self::migrated_pool(pool),
            previous_pool: Self::previous_pool(pool),
            placeholder: self.placeholder_path(pool),
        };
        tokio::fs::write(self.marker_path(pool), serde_json::to_vec_pretty(&marker)?).await?;
        info!(pool, "Migration staged for next boot");
        Ok(())
    }

    async fn join_migrated_member(&self, pool: &str, original: &DeviceId) -> Result<()> {
        let previous = Self::previous_pool(pool);
        if self.pool_imported(&previous).await {
            self.run("zpool", &["destroy", "-f", previous.as_str()]).await?;
        }

        self.partition(original).await?;
        let placeholder = self.placeholder_path(pool).display().to_string();
        self.run(
            "zpool",
            &["replace", "-f", pool, placeholder.as_str(), self.data_partition(original).as_str()],
        )
        .await?;
        self.remove_quietly(&self.marker_path(pool)).await;
        Ok(())
    }

    async fn abort_migration(&self, pool: &str) -> Result<()> {
        let target = Self::migrated_pool(pool);
        if self.pool_imported(&target).await {
            self.destroy_quietly("zpool", &["destroy", "-f", target.as_str()]).await;
        }
        let snapshot = format!("{}@{}", pool, MIGRATION_SNAPSHOT);
        self.destroy_quietly("zfs", &["destroy", "-r", snapshot.as_str()]).await;
        self.remove_quietly(&self.placeholder_path(pool)).await;
        self.remove_quietly(&self.marker_path(pool)).await;
        self.estimates.lock().remove(pool);
        Ok(())
    }

    async fn cleanup_migration(&self, pool: &str) -> Result<()> {
        let snapshot = format!("{}@{}", pool, MIGRATION_SNAPSHOT);
        self.destroy_quietly("zfs", &["destroy", "-r", snapshot.as_str()]).await;
        self.remove_quietly(&self.placeholder_path(pool)).await;
        self.remove_quietly(&self.marker_path(pool)).await;
        self.estimates.lock().remove(pool);
        Ok(())
    }

    async fn import_candidates(&self, pool: &str) -> Result<Vec<ImportCandidate>> {
        let output = self.output("zpool", &["import"]).await?;
        // exit status 1 with "no pools available" is a normal empty answer
        Ok(parse_import_output(pool, &String::from_utf8_lossy(&output.stdout)))
    }
}

// =============================================================================
// Output Parsing
// =============================================================================

fn describe(program: &str, args: &[&str]) -> String {
    match args.first() {
        Some(sub) => format!("{} {}", program, sub),
        None => program.to_string(),
    }
}

fn failure_reason(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}

/// Device id of a vdev path such as `/dev/disk/by-id/nvme-X-part2`
fn member_id(path_or_name: &str) -> DeviceId {
    let name = path_or_name.rsplit('/').next().unwrap_or(path_or_name);
    let id = match name.rfind("-part") {
        Some(idx) if name[idx + 5..].chars().all(|c| c.is_ascii_digit()) && idx + 5 < name.len() => {
            &name[..idx]
        }
        _ => name,
    };
    DeviceId::new(id)
}

fn as_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn scan_state(value: Option<&Value>) -> Option<ScanState> {
    match value.and_then(Value::as_str)? {
        "SCANNING" => Some(ScanState::Scanning),
        "FINISHED" => Some(ScanState::Finished),
        "CANCELED" => Some(ScanState::Canceled),
        _ => None,
    }
}

#[derive(Debug)]
struct ParsedStatus {
    status: EngineStatus,
    raidz_vdev: Option<String>,
}

fn walk_vdevs(vdevs: &serde_json::Map<String, Value>, members: &mut Vec<EngineMember>, raidz: &mut Option<String>) {
    for (name, vdev) in vdevs {
        match vdev.get("vdev_type").and_then(Value::as_str) {
            Some("disk") => {
                let path = vdev.get("path").and_then(Value::as_str).unwrap_or(name);
                members.push(EngineMember {
                    id: member_id(path),
                    health: vdev
                        .get("state")
                        .and_then(Value::as_str)
                        .and_then(PoolHealth::parse)
                        .unwrap_or(PoolHealth::Unavail),
                    read_errors: as_u64(vdev.get("read_errors")),
                    write_errors: as_u64(vdev.get("write_errors")),
                    checksum_errors: as_u64(vdev.get("checksum_errors")),
                });
            }
            Some("raidz") if raidz.is_none() => *raidz = Some(name.clone()),
            _ => {}
        }
        if let Some(children) = vdev.get("vdevs").and_then(Value::as_object) {
            walk_vdevs(children, members, raidz);
        }
    }
}

/// Parse `zpool status -j --json-int <pool>` output
fn parse_status_json(pool: &str, json: &str) -> Result<ParsedStatus> {
    let root: Value = serde_json::from_str(json)?;
    let entry = root
        .get("pools")
        .and_then(|p| p.get(pool))
        .ok_or_else(|| Error::EngineStatusParse(format!("pool {} missing from status", pool)))?;

    let state = entry.get("state").and_then(Value::as_str).unwrap_or_default();
    let health = PoolHealth::parse(state)
        .ok_or_else(|| Error::EngineStatusParse(format!("unknown pool state {:?}", state)))?;

    let mut members = Vec::new();
    let mut raidz_vdev = None;
    let mut total_space = 0;
    let mut used_space = 0;
    if let Some(vdevs) = entry.get("vdevs").and_then(Value::as_object) {
        if let Some(root_vdev) = vdevs.get(pool) {
            total_space = as_u64(root_vdev.get("total_space"));
            used_space = as_u64(root_vdev.get("alloc_space"));
        }
        walk_vdevs(vdevs, &mut members, &mut raidz_vdev);
    }

    let expand = entry.get("raidz_expand_stats").and_then(|stats| {
        Some(ScanStatus {
            kind: ScanKind::Expand,
            state: scan_state(stats.get("state"))?,
            done: as_u64(stats.get("reflowed")),
            total: as_u64(stats.get("to_reflow")),
        })
    });
    let resilver = entry.get("scan_stats").and_then(|stats| {
        if stats.get("function").and_then(Value::as_str) != Some("RESILVER") {
            return None;
        }
        Some(ScanStatus {
            kind: ScanKind::Resilver,
            state: scan_state(stats.get("state"))?,
            done: as_u64(stats.get("issued")),
            total: as_u64(stats.get("to_examine")),
        })
    });
    let scan = match (expand, resilver) {
        (Some(e), _) if e.state == ScanState::Scanning => Some(e),
        (_, Some(r)) if r.state == ScanState::Scanning => Some(r),
        (e, r) => r.or(e),
    };

    Ok(ParsedStatus {
        status: EngineStatus {
            health,
            raid_type: if raidz_vdev.is_some() {
                RaidType::Failsafe
            } else {
                RaidType::Storage
            },
            members,
            scan,
            total_space,
            used_space,
        },
        raidz_vdev,
    })
}

/// Parse the `size` line of `zfs send -nP`
fn parse_send_estimate(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("size"), Some(bytes)) => bytes.parse().ok(),
            _ => None,
        }
    })
}

/// Parse `zpool import` listing for the devices of `pool`
fn parse_import_output(pool: &str, output: &str) -> Vec<ImportCandidate> {
    let mut candidates = Vec::new();
    let mut current: Option<&str> = None;
    let mut in_config = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("pool:") {
            current = Some(name.trim());
            in_config = false;
            continue;
        }
        if trimmed == "config:" {
            in_config = true;
            continue;
        }
        if !in_config || current != Some(pool) {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let (Some(name), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name == pool || name.starts_with("raidz") || name.starts_with("mirror") {
            continue;
        }
        if PoolHealth::parse(state).is_none() {
            continue;
        }
        candidates.push(ImportCandidate {
            id: member_id(name),
            healthy: state == "ONLINE",
        });
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const RESILVERING: &str = r#"{
      "output_version": {"command": "zpool status", "vers_major": 0, "vers_minor": 1},
      "pools": {
        "raid-1a2b": {
          "name": "raid-1a2b",
          "state": "DEGRADED",
          "vdevs": {
            "raid-1a2b": {
              "name": "raid-1a2b", "vdev_type": "root", "state": "DEGRADED",
              "alloc_space": 1000, "total_space": 8000,
              "vdevs": {
                "raidz1-0": {
                  "name": "raidz1-0", "vdev_type": "raidz", "state": "DEGRADED",
                  "vdevs": {
                    "nvme-Samsung_SSD_990_PRO_4TB_S7KG1-part2": {
                      "vdev_type": "disk", "state": "ONLINE",
                      "path": "/dev/disk/by-id/nvme-Samsung_SSD_990_PRO_4TB_S7KG1-part2",
                      "read_errors": 0, "write_errors": 0, "checksum_errors": 2
                    },
                    "nvme-WD_Black_SN850X_4000GB_22-part2": {
                      "vdev_type": "disk", "state": "ONLINE",
                      "path": "/dev/disk/by-id/nvme-WD_Black_SN850X_4000GB_22-part2",
                      "read_errors": "0", "write_errors": "0", "checksum_errors": "0"
                    }
                  }
                }
              }
            }
          },
          "scan_stats": {
            "function": "RESILVER", "state": "SCANNING",
            "to_examine": 400, "examined": 300, "issued": 100
          }
        }
      }
    }"#;

    #[test]
    fn test_parse_resilvering_status() {
        let parsed = parse_status_json("raid-1a2b", RESILVERING).unwrap();
        let status = parsed.status;

        assert_eq!(status.health, PoolHealth::Degraded);
        assert_eq!(status.raid_type, RaidType::Failsafe);
        assert_eq!(parsed.raidz_vdev.as_deref(), Some("raidz1-0"));
        assert_eq!(status.total_space, 8000);
        assert_eq!(status.members.len(), 2);
        assert_eq!(
            status.members[0].id,
            DeviceId::from("nvme-Samsung_SSD_990_PRO_4TB_S7KG1")
        );
        assert_eq!(status.members[0].checksum_errors, 2);

        let scan = status.scan.unwrap();
        assert_eq!(scan.kind, ScanKind::Resilver);
        assert_eq!(scan.state, ScanState::Scanning);
        assert_eq!(scan.percent(), 25);
    }

    #[test]
    fn test_parse_status_missing_pool() {
        let result = parse_status_json("other", RESILVERING);
        assert_matches!(result, Err(Error::EngineStatusParse(_)));
        assert_matches!(parse_status_json("x", "not json"), Err(Error::JsonParse(_)));
    }

    #[test]
    fn test_member_id_strips_partition() {
        assert_eq!(member_id("/dev/disk/by-id/nvme-A_1-part2"), DeviceId::from("nvme-A_1"));
        assert_eq!(member_id("nvme-A_1"), DeviceId::from("nvme-A_1"));
        assert_eq!(member_id("nvme-A-party"), DeviceId::from("nvme-A-party"));
    }

    #[tokio::test]
    async fn test_abort_without_placeholder_clears_marker() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = ZfsEngine::new(ZfsConfig {
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        });

        // the placeholder is gone once prepared, only the marker remains
        tokio::fs::write(engine.marker_path("raid-x"), b"{}").await.unwrap();
        assert!(!engine.placeholder_path("raid-x").exists());

        engine.abort_migration("raid-x").await.unwrap();
        assert!(!engine.marker_path("raid-x").exists());
    }

    #[test]
    fn test_send_estimate() {
        let out = "full\traid@migration\t123\nsize\t4096\n";
        assert_eq!(parse_send_estimate(out), Some(4096));
        assert_eq!(parse_send_estimate(""), None);
    }

    #[test]
    fn test_import_listing() {
        let out = "   pool: other
     id: 1
  state: ONLINE
 config:

        other                 ONLINE
          nvme-X-part2        ONLINE

   pool: raid-1a2b
     id: 2
  state: DEGRADED
 action: The pool can be imported despite missing or damaged devices.
 config:

        raid-1a2b                 DEGRADED
          raidz1-0                DEGRADED
            nvme-A-part2          ONLINE
            nvme-B-part2          UNAVAIL  cannot open
";
        let candidates = parse_import_output("raid-1a2b", out);
        assert_eq!(
            candidates,
            vec![
                ImportCandidate { id: "nvme-A".into(), healthy: true },
                ImportCandidate { id: "nvme-B".into(), healthy: false },
            ]
        );
    }
}
