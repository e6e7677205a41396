//! Registry Events
//!
//! Events emitted by the device registry for external consumers to react to
//! devices appearing in, or disappearing from, the bays.

use serde::{Deserialize, Serialize};

/// Events emitted by the device registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A device id was seen for the first time
    DeviceDiscovered {
        device_id: String,
        slot: Option<u8>,
        size_bytes: u64,
    },

    /// A previously absent device is back
    DevicePresent { device_id: String, slot: Option<u8> },

    /// A known device was missing from the last enumeration
    DeviceAbsent { device_id: String },
}

impl RegistryEvent {
    /// Get the device ID associated with this event
    pub fn device_id(&self) -> &str {
        match self {
            RegistryEvent::DeviceDiscovered { device_id, .. } => device_id,
            RegistryEvent::DevicePresent { device_id, .. } => device_id,
            RegistryEvent::DeviceAbsent { device_id } => device_id,
        }
    }

    /// Whether the device is present after this event
    pub fn is_presence(&self) -> bool {
        !matches!(self, RegistryEvent::DeviceAbsent { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_device_id() {
        let event = RegistryEvent::DeviceDiscovered {
            device_id: "nvme-Acme_A1".to_string(),
            slot: Some(1),
            size_bytes: 4_000_787_030_016,
        };
        assert_eq!(event.device_id(), "nvme-Acme_A1");
        assert!(event.is_presence());

        let event = RegistryEvent::DeviceAbsent {
            device_id: "nvme-Acme_A1".to_string(),
        };
        assert!(!event.is_presence());
    }
}
