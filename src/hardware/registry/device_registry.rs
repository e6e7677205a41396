//! Device Registry
//!
//! Merges each enumeration pass into a registry keyed by stable device id.
//! Entries are never removed: a device that disappears is marked absent and
//! keeps its id, slot history and capacity class.

use crate::domain::ports::{Device, DeviceId, DeviceProberRef, ProbedDevice};
use crate::error::{Error, Result};
use crate::hardware::classification::CapacityClass;
use crate::hardware::registry::RegistryEvent;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Registry of every device seen in the bays
pub struct DeviceRegistry {
    /// Hardware enumeration
    prober: DeviceProberRef,
    /// Known devices by stable id
    devices: RwLock<BTreeMap<DeviceId, Device>>,
    /// Time of the last successful enumeration
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    /// Event broadcaster
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new, empty registry
    pub fn new(prober: DeviceProberRef) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(256);
        Arc::new(Self {
            prober,
            devices: RwLock::new(BTreeMap::new()),
            last_refresh: RwLock::new(None),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Enumerate the bays and merge the result.
    ///
    /// A failed enumeration leaves the registry as it was.
    pub async fn refresh(&self) -> Result<()> {
        let probed = self.prober.probe().await?;
        let events = self.merge(probed);

        for event in events {
            debug!(device = %event.device_id(), ?event, "Registry change");
            let _ = self.event_sender.send(event);
        }
        *self.last_refresh.write() = Some(Utc::now());
        Ok(())
    }

    fn merge(&self, probed: Vec<ProbedDevice>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let mut devices = self.devices.write();

        for p in probed {
            if !seen.insert(p.id.clone()) {
                warn!(device = %p.id, "Device reported twice in one scan, ignoring duplicate");
                continue;
            }

            match devices.get_mut(&p.id) {
                Some(known) => {
                    if !known.present {
                        events.push(RegistryEvent::DevicePresent {
                            device_id: p.id.to_string(),
                            slot: p.slot,
                        });
                    }
                    known.slot = p.slot;
                    known.device_path = p.device_path;
                    known.size_bytes = p.size_bytes;
                    known.size_class = CapacityClass::from_raw(p.size_bytes);
                    known.present = true;
                }
                None => {
                    info!(device = %p.id, slot = ?p.slot, size_bytes = p.size_bytes, "Discovered device");
                    events.push(RegistryEvent::DeviceDiscovered {
                        device_id: p.id.to_string(),
                        slot: p.slot,
                        size_bytes: p.size_bytes,
                    });
                    devices.insert(
                        p.id.clone(),
                        Device {
                            size_class: CapacityClass::from_raw(p.size_bytes),
                            id: p.id,
                            slot: p.slot,
                            device_path: p.device_path,
                            size_bytes: p.size_bytes,
                            model: p.model,
                            serial: p.serial,
                            present: true,
                        },
                    );
                }
            }
        }

        for (id, device) in devices.iter_mut() {
            if device.present && !seen.contains(id) {
                info!(device = %id, "Device is no longer present");
                device.present = false;
                events.push(RegistryEvent::DeviceAbsent {
                    device_id: id.to_string(),
                });
            }
        }

        events
    }

    /// Refresh and return the devices currently present, ordered by slot
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        self.refresh().await?;
        let mut present: Vec<Device> = self
            .devices
            .read()
            .values()
            .filter(|d| d.present)
            .cloned()
            .collect();
        present.sort_by(|a, b| (a.slot.is_none(), a.slot, &a.id).cmp(&(b.slot.is_none(), b.slot, &b.id)));
        Ok(present)
    }

    /// Every device ever seen, present or not
    pub fn known_devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    /// Get a device by id
    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    /// Check if a device was present on the last enumeration
    pub fn is_present(&self, id: &DeviceId) -> bool {
        self.devices.read().get(id).map(|d| d.present).unwrap_or(false)
    }

    /// A present device, or [`Error::DeviceNotFound`]
    pub fn present_device(&self, id: &DeviceId) -> Result<Device> {
        self.get(id)
            .filter(|d| d.present)
            .ok_or_else(|| Error::DeviceNotFound {
                device: id.to_string(),
            })
    }

    /// Time of the last successful enumeration
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DeviceProber;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Prober returning whatever the test put in the bays
    #[derive(Default)]
    struct FakeBays {
        devices: Mutex<Vec<ProbedDevice>>,
    }

    impl FakeBays {
        fn set(&self, devices: Vec<ProbedDevice>) {
            *self.devices.lock() = devices;
        }
    }

    #[async_trait]
    impl DeviceProber for FakeBays {
        async fn probe(&self) -> Result<Vec<ProbedDevice>> {
            Ok(self.devices.lock().clone())
        }
    }

    fn probed(id: &str, slot: u8, path: &str, size: u64) -> ProbedDevice {
        ProbedDevice {
            id: id.into(),
            slot: Some(slot),
            device_path: path.to_string(),
            size_bytes: size,
            model: "Acme".to_string(),
            serial: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_devices_normalizes_size() {
        let bays = Arc::new(FakeBays::default());
        bays.set(vec![
            probed("nvme-a", 2, "/dev/nvme1n1", 4_096_805_658_624),
            probed("nvme-b", 1, "/dev/nvme0n1", 4_000_000_010_000),
        ]);
        let registry = DeviceRegistry::new(bays.clone());

        let devices = registry.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.as_str(), "nvme-b");
        assert_eq!(devices[0].size_class, devices[1].size_class);
        assert!(registry.last_refresh().is_some());
    }

    #[tokio::test]
    async fn test_absent_devices_are_kept() {
        let bays = Arc::new(FakeBays::default());
        bays.set(vec![
            probed("nvme-a", 1, "/dev/nvme0n1", 2_000_398_934_016),
            probed("nvme-b", 2, "/dev/nvme1n1", 2_000_398_934_016),
        ]);
        let registry = DeviceRegistry::new(bays.clone());
        let mut events = registry.subscribe();
        registry.refresh().await.unwrap();

        bays.set(vec![probed("nvme-a", 1, "/dev/nvme0n1", 2_000_398_934_016)]);
        let devices = registry.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(registry.known_devices().len(), 2);
        assert!(!registry.is_present(&"nvme-b".into()));
        assert!(registry.present_device(&"nvme-b".into()).is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2],
            RegistryEvent::DeviceAbsent {
                device_id: "nvme-b".to_string()
            }
        );

        bays.set(vec![
            probed("nvme-a", 1, "/dev/nvme0n1", 2_000_398_934_016),
            probed("nvme-b", 2, "/dev/nvme1n1", 2_000_398_934_016),
        ]);
        registry.refresh().await.unwrap();
        assert!(registry.is_present(&"nvme-b".into()));
        assert_matches::assert_matches!(
            events.try_recv(),
            Ok(RegistryEvent::DevicePresent { .. })
        );
    }

    #[tokio::test]
    async fn test_id_is_stable_across_slot_swap() {
        let bays = Arc::new(FakeBays::default());
        bays.set(vec![
            probed("nvme-a", 1, "/dev/nvme0n1", 2_000_398_934_016),
            probed("nvme-b", 2, "/dev/nvme1n1", 4_000_787_030_016),
        ]);
        let registry = DeviceRegistry::new(bays.clone());
        registry.refresh().await.unwrap();
        let class_b = registry.get(&"nvme-b".into()).unwrap().size_class;

        // drives swapped between bays, OS enumeration order flips too
        bays.set(vec![
            probed("nvme-b", 1, "/dev/nvme0n1", 4_000_787_030_016),
            probed("nvme-a", 2, "/dev/nvme1n1", 2_000_398_934_016),
        ]);
        registry.refresh().await.unwrap();

        let b = registry.get(&"nvme-b".into()).unwrap();
        assert_eq!(b.slot, Some(1));
        assert_eq!(b.device_path, "/dev/nvme0n1");
        assert_eq!(b.size_class, class_b);
        assert_eq!(registry.known_devices().len(), 2);
    }
}
