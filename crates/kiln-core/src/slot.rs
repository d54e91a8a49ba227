//! Execution slot types.

use crate::build::ResourceProfile;
use crate::ids::{BuildId, SlotId};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Capacity vector of a slot or an aggregate of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_count: u32,
}

impl Capacity {
    pub fn new(cpu_cores: u32, memory_gb: u32, gpu_count: u32) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpu_count,
        }
    }

    /// Whether this capacity covers the profile on every axis.
    pub fn covers(&self, profile: &ResourceProfile) -> bool {
        self.cpu_cores >= profile.cpu_cores
            && self.memory_gb >= profile.memory_gb
            && self.gpu_count >= profile.gpu_count
    }
}

impl Add for Capacity {
    type Output = Capacity;

    fn add(self, rhs: Self) -> Self::Output {
        Capacity {
            cpu_cores: self.cpu_cores + rhs.cpu_cores,
            memory_gb: self.memory_gb + rhs.memory_gb,
            gpu_count: self.gpu_count + rhs.gpu_count,
        }
    }
}

impl AddAssign for Capacity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotHealth {
    Healthy,
    Quarantined,
}

/// Declarative description of a slot, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub node: String,
    pub capacity: Capacity,
    pub gpu_arch: String,
    #[serde(default)]
    pub rocm_version: Option<String>,
}

/// One schedulable execution unit, owned by the resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSlot {
    pub id: SlotId,
    pub node: String,
    pub capacity: Capacity,
    pub gpu_arch: String,
    pub rocm_version: Option<String>,
    pub occupant: Option<BuildId>,
    pub health: SlotHealth,
    pub consecutive_timeouts: u32,
}

impl ResourceSlot {
    pub fn from_spec(spec: SlotSpec) -> Self {
        Self {
            id: SlotId::new(),
            node: spec.node,
            capacity: spec.capacity,
            gpu_arch: spec.gpu_arch,
            rocm_version: spec.rocm_version,
            occupant: None,
            health: SlotHealth::Healthy,
            consecutive_timeouts: 0,
        }
    }

    /// Whether the slot could host the profile, ignoring occupancy and health.
    pub fn can_host(&self, profile: &ResourceProfile) -> bool {
        if !self.capacity.covers(profile) {
            return false;
        }
        if let Some(arch) = &profile.gpu_arch
            && !self.gpu_arch.eq_ignore_ascii_case(arch)
        {
            return false;
        }
        if let Some(version) = &profile.rocm_version
            && self.rocm_version.as_deref() != Some(version.as_str())
        {
            return false;
        }
        true
    }

    /// Whether the slot can be reserved right now for the profile.
    pub fn is_eligible(&self, profile: &ResourceProfile) -> bool {
        self.health == SlotHealth::Healthy && self.occupant.is_none() && self.can_host(profile)
    }
}

/// Grant of a slot to a build, returned by a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHandle {
    pub slot_id: SlotId,
    pub build_id: BuildId,
    pub node: String,
    pub capacity: Capacity,
    pub gpu_arch: String,
}

/// Point-in-time usage report of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub total: Capacity,
    pub allocated: Capacity,
    pub slots_total: usize,
    pub slots_free: usize,
    pub slots_occupied: usize,
    pub slots_quarantined: usize,
}

impl CapacitySnapshot {
    /// Unallocated capacity, including capacity of quarantined slots.
    pub fn free(&self) -> Capacity {
        Capacity::new(
            self.total.cpu_cores.saturating_sub(self.allocated.cpu_cores),
            self.total.memory_gb.saturating_sub(self.allocated.memory_gb),
            self.total.gpu_count.saturating_sub(self.allocated.gpu_count),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> ResourceSlot {
        ResourceSlot::from_spec(SlotSpec {
            node: "node-a".to_string(),
            capacity: Capacity::new(32, 256, 4),
            gpu_arch: "gfx90a".to_string(),
            rocm_version: Some("6.1".to_string()),
        })
    }

    #[test]
    fn test_can_host_by_capacity() {
        let slot = slot();
        assert!(slot.can_host(&ResourceProfile::gpus(4)));
        assert!(!slot.can_host(&ResourceProfile::gpus(8)));
        assert!(!slot.can_host(&ResourceProfile::gpus(1).with_cpu(64, 16)));
    }

    #[test]
    fn test_can_host_by_arch_and_rocm() {
        let slot = slot();
        assert!(slot.can_host(&ResourceProfile::gpus(1).with_arch("GFX90A")));
        assert!(!slot.can_host(&ResourceProfile::gpus(1).with_arch("gfx1100")));
        assert!(slot.can_host(&ResourceProfile::gpus(1).with_rocm("6.1")));
        assert!(!slot.can_host(&ResourceProfile::gpus(1).with_rocm("5.7")));
    }

    #[test]
    fn test_eligibility_requires_free_and_healthy() {
        let mut slot = slot();
        let profile = ResourceProfile::gpus(1);
        assert!(slot.is_eligible(&profile));
        slot.health = SlotHealth::Quarantined;
        assert!(!slot.is_eligible(&profile));
        slot.health = SlotHealth::Healthy;
        slot.occupant = Some(BuildId::new());
        assert!(!slot.is_eligible(&profile));
    }
}
