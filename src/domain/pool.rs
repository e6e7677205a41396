//! Pool Descriptor
//!
//! The persisted, engine-independent description of the pool: its name,
//! redundancy layout and ordered member list.

use crate::domain::ports::{DeviceId, RaidType};
use crate::error::{Error, Result};
use crate::hardware::classification::{self, CapacityClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A member of the pool and the capacity class it joined with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMember {
    pub id: DeviceId,
    pub size_class: CapacityClass,
}

impl PoolMember {
    pub fn new(id: impl Into<DeviceId>, size_class: CapacityClass) -> Self {
        Self {
            id: id.into(),
            size_class,
        }
    }
}

/// Persisted pool descriptor.
///
/// `pool_name == None` means no pool has been created. While a pool exists
/// the member list is never empty and never holds the same id twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub pool_name: Option<String>,
    pub raid_type: RaidType,
    pub members: Vec<PoolMember>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PoolDescriptor {
    fn default() -> Self {
        Self::absent()
    }
}

impl PoolDescriptor {
    /// Descriptor for a system without a pool
    pub fn absent() -> Self {
        Self {
            pool_name: None,
            raid_type: RaidType::Storage,
            members: Vec::new(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Descriptor for a freshly created pool
    pub fn create(
        pool_name: impl Into<String>,
        raid_type: RaidType,
        members: Vec<PoolMember>,
    ) -> Result<Self> {
        let now = Utc::now();
        let descriptor = Self {
            pool_name: Some(pool_name.into()),
            raid_type,
            members,
            created_at: Some(now),
            updated_at: Some(now),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn exists(&self) -> bool {
        self.pool_name.is_some()
    }

    /// Pool name, or [`Error::PoolMissing`]
    pub fn name(&self) -> Result<&str> {
        self.pool_name.as_deref().ok_or(Error::PoolMissing)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn member(&self, id: &DeviceId) -> Option<&PoolMember> {
        self.members.iter().find(|m| &m.id == id)
    }

    pub fn member_ids(&self) -> Vec<DeviceId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Usable space derived from member classes and layout
    pub fn usable_space(&self) -> u64 {
        if !self.exists() {
            return 0;
        }
        let classes: Vec<CapacityClass> = self.members.iter().map(|m| m.size_class).collect();
        match self.raid_type {
            RaidType::Storage => classification::striped_capacity(&classes),
            RaidType::Failsafe => classification::single_parity_capacity(&classes),
        }
    }

    /// Check the membership invariants
    pub fn validate(&self) -> Result<()> {
        if !self.exists() {
            if !self.members.is_empty() {
                return Err(Error::InconsistentDescriptor(
                    "members recorded without a pool".into(),
                ));
            }
            return Ok(());
        }

        if self.members.is_empty() {
            return Err(Error::InconsistentDescriptor(
                "pool exists with no members".into(),
            ));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(&member.id) {
                return Err(Error::InconsistentDescriptor(format!(
                    "device {} listed twice",
                    member.id
                )));
            }
        }

        Ok(())
    }

    /// Append a member, preserving order
    pub fn with_member_added(&self, member: PoolMember) -> Result<Self> {
        if self.contains(&member.id) {
            return Err(Error::DeviceAlreadyInArray {
                device: member.id.to_string(),
            });
        }
        let mut next = self.clone();
        next.members.push(member);
        next.updated_at = Some(Utc::now());
        next.validate()?;
        Ok(next)
    }

    /// Swap `old` for `new` in place, keeping its position
    pub fn with_member_replaced(&self, old: &DeviceId, new: PoolMember) -> Result<Self> {
        if self.contains(&new.id) {
            return Err(Error::ReplaceTargetInArray {
                device: new.id.to_string(),
            });
        }
        let mut next = self.clone();
        let slot = next
            .members
            .iter_mut()
            .find(|m| &m.id == old)
            .ok_or_else(|| Error::DeviceNotMember {
                device: old.to_string(),
            })?;
        *slot = new;
        next.updated_at = Some(Utc::now());
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const FOUR_TB: CapacityClass = CapacityClass(4_000_000_000_000);
    const TWO_TB: CapacityClass = CapacityClass(2_000_000_000_000);

    #[test]
    fn test_absent_descriptor() {
        let pool = PoolDescriptor::absent();
        assert!(!pool.exists());
        assert_eq!(pool.usable_space(), 0);
        assert_matches!(pool.name(), Err(Error::PoolMissing));
        pool.validate().unwrap();
    }

    #[test]
    fn test_create_rejects_empty_and_duplicates() {
        let empty = PoolDescriptor::create("pool-a", RaidType::Storage, vec![]);
        assert_matches!(empty, Err(Error::InconsistentDescriptor(_)));

        let dup = PoolDescriptor::create(
            "pool-a",
            RaidType::Storage,
            vec![PoolMember::new("nvme-a", FOUR_TB), PoolMember::new("nvme-a", FOUR_TB)],
        );
        assert_matches!(dup, Err(Error::InconsistentDescriptor(_)));
    }

    #[test]
    fn test_usable_space_by_layout() {
        let members = vec![PoolMember::new("nvme-a", TWO_TB), PoolMember::new("nvme-b", FOUR_TB)];

        let storage = PoolDescriptor::create("pool-a", RaidType::Storage, members.clone()).unwrap();
        assert_eq!(storage.usable_space(), 6_000_000_000_000);

        let failsafe = PoolDescriptor::create("pool-a", RaidType::Failsafe, members).unwrap();
        assert_eq!(failsafe.usable_space(), 2_000_000_000_000);
    }

    #[test]
    fn test_member_replaced_keeps_position() {
        let pool = PoolDescriptor::create(
            "pool-a",
            RaidType::Storage,
            vec![PoolMember::new("nvme-a", TWO_TB), PoolMember::new("nvme-b", TWO_TB)],
        )
        .unwrap();

        let next = pool
            .with_member_replaced(&DeviceId::from("nvme-a"), PoolMember::new("nvme-c", FOUR_TB))
            .unwrap();
        assert_eq!(
            next.member_ids(),
            vec![DeviceId::from("nvme-c"), DeviceId::from("nvme-b")]
        );

        let missing =
            pool.with_member_replaced(&DeviceId::from("nvme-x"), PoolMember::new("nvme-c", FOUR_TB));
        assert_matches!(missing, Err(Error::DeviceNotMember { .. }));

        let existing =
            pool.with_member_replaced(&DeviceId::from("nvme-a"), PoolMember::new("nvme-b", FOUR_TB));
        assert_matches!(existing, Err(Error::ReplaceTargetInArray { .. }));
    }

    #[test]
    fn test_member_added() {
        let pool = PoolDescriptor::create(
            "pool-a",
            RaidType::Storage,
            vec![PoolMember::new("nvme-a", TWO_TB)],
        )
        .unwrap();

        let next = pool.with_member_added(PoolMember::new("nvme-b", FOUR_TB)).unwrap();
        assert_eq!(next.members.len(), 2);

        let dup = next.with_member_added(PoolMember::new("nvme-b", FOUR_TB));
        assert_matches!(dup, Err(Error::DeviceAlreadyInArray { .. }));
    }
}
