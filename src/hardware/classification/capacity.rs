//! Capacity Classification
//!
//! Buckets raw device capacities into coarse classes so that drives sold as
//! the same nominal size ("4TB") compare equal even though the byte counts
//! reported by different vendors and controllers differ by tens of GB.

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Below this size devices are classified by their exact raw size
pub const CLASS_FLOOR_BYTES: u64 = 1_000_000_000_000;

/// Granularity of capacity classes at or above [`CLASS_FLOOR_BYTES`]
pub const CLASS_STEP_BYTES: u64 = 250_000_000_000;

// =============================================================================
// Capacity Class
// =============================================================================

/// Normalized capacity of a device, in bytes.
///
/// Classes are totally ordered, and `normalize` is monotonic: a larger raw
/// size never yields a smaller class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapacityClass(pub u64);

impl CapacityClass {
    /// Classify a raw device size
    pub fn from_raw(size_bytes: u64) -> Self {
        Self(normalize(size_bytes))
    }

    /// Normalized size in bytes
    #[inline]
    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Whether a device of this class can stand in for one of `other`
    #[inline]
    pub fn can_substitute(&self, other: CapacityClass) -> bool {
        *self >= other
    }
}

impl std::fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0;
        if bytes >= CLASS_FLOOR_BYTES {
            // Always a multiple of 250GB here, so two decimals are exact
            write!(f, "{:.2}TB", bytes as f64 / 1e12)
        } else {
            write!(f, "{}GB", bytes / 1_000_000_000)
        }
    }
}

/// Round a raw device size down to its capacity class.
///
/// Sizes under 1TB are returned unchanged. From 1TB upwards the size is
/// floored to the nearest 250GB, so 4,000,000,010,000 and 4,096,805,658,624
/// both land on the 4,000,000,000,000 class.
pub fn normalize(size_bytes: u64) -> u64 {
    if size_bytes >= CLASS_FLOOR_BYTES {
        (size_bytes / CLASS_STEP_BYTES) * CLASS_STEP_BYTES
    } else {
        size_bytes
    }
}

/// Usable space of a non-redundant pool: every member counts in full
pub fn striped_capacity(classes: &[CapacityClass]) -> u64 {
    classes.iter().map(|c| c.bytes()).sum()
}

/// Usable space of a single-parity redundancy group.
///
/// Every member is truncated to the smallest class, and one member's worth
/// of space goes to parity.
pub fn single_parity_capacity(classes: &[CapacityClass]) -> u64 {
    match classes.iter().min() {
        Some(smallest) if classes.len() > 1 => {
            smallest.bytes().saturating_mul(classes.len() as u64 - 1)
        }
        Some(smallest) => smallest.bytes(),
        None => 0,
    }
}
