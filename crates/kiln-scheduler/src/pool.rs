//! Resource pool manager.
//!
//! The pool is the sole owner of execution slots. Build records refer to
//! slots by id only; every reservation, release and health change goes
//! through one async mutex so the operations are linearizable.

use kiln_core::build::ResourceProfile;
use kiln_core::ids::{BuildId, SlotId};
use kiln_core::slot::{CapacitySnapshot, ResourceSlot, SlotHandle, SlotHealth, SlotSpec};
use kiln_core::{Error, Result};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Owns the slot table and hands out exclusive reservations.
pub struct ResourcePool {
    slots: Mutex<Vec<ResourceSlot>>,
    quarantine_threshold: u32,
    snapshot_tx: watch::Sender<CapacitySnapshot>,
}

impl ResourcePool {
    pub fn new(specs: Vec<SlotSpec>, quarantine_threshold: u32) -> Self {
        let slots: Vec<ResourceSlot> = specs.into_iter().map(ResourceSlot::from_spec).collect();
        let (snapshot_tx, _) = watch::channel(snapshot_of(&slots));
        info!(slots = slots.len(), "Resource pool initialized");
        Self {
            slots: Mutex::new(slots),
            quarantine_threshold: quarantine_threshold.max(1),
            snapshot_tx,
        }
    }

    /// Reserve the best-fitting eligible slot for a build.
    ///
    /// Best fit means the fewest surplus GPUs, then the least surplus
    /// memory, then declaration order.
    pub async fn reserve(&self, build_id: BuildId, profile: &ResourceProfile) -> Result<SlotHandle> {
        let mut slots = self.slots.lock().await;

        let best = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_eligible(profile))
            .min_by_key(|(index, slot)| {
                (
                    slot.capacity.gpu_count - profile.gpu_count,
                    slot.capacity.memory_gb - profile.memory_gb,
                    *index,
                )
            })
            .map(|(index, _)| index);

        let Some(index) = best else {
            return Err(Error::ResourceUnavailable(profile.to_string()));
        };

        let slot = &mut slots[index];
        slot.occupant = Some(build_id);
        let handle = SlotHandle {
            slot_id: slot.id,
            build_id,
            node: slot.node.clone(),
            capacity: slot.capacity,
            gpu_arch: slot.gpu_arch.clone(),
        };
        debug!(build_id = %build_id, slot_id = %handle.slot_id, node = %handle.node, "Slot reserved");

        self.publish(&slots);
        Ok(handle)
    }

    /// Release a reservation. The slot must still be held by the handle's build.
    pub async fn release(&self, handle: &SlotHandle) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, handle.slot_id)?;

        if slot.occupant != Some(handle.build_id) {
            return Err(Error::SlotOccupantMismatch {
                slot: handle.slot_id.to_string(),
                build: handle.build_id.to_string(),
            });
        }
        slot.occupant = None;
        debug!(build_id = %handle.build_id, slot_id = %handle.slot_id, "Slot released");

        self.publish(&slots);
        Ok(())
    }

    /// Release a slot regardless of its occupant, returning the evicted build.
    pub async fn force_release(&self, slot_id: SlotId) -> Result<Option<BuildId>> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, slot_id)?;
        let evicted = slot.occupant.take();
        if let Some(build_id) = evicted {
            warn!(build_id = %build_id, slot_id = %slot_id, "Slot force-released");
        }

        self.publish(&slots);
        Ok(evicted)
    }

    pub async fn quarantine(&self, slot_id: SlotId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, slot_id)?;
        slot.health = SlotHealth::Quarantined;
        warn!(slot_id = %slot_id, node = %slot.node, "Slot quarantined");

        self.publish(&slots);
        Ok(())
    }

    /// Return a slot to service and clear its timeout history.
    pub async fn unquarantine(&self, slot_id: SlotId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = find_mut(&mut slots, slot_id)?;
        slot.health = SlotHealth::Healthy;
        slot.consecutive_timeouts = 0;
        info!(slot_id = %slot_id, node = %slot.node, "Slot returned to service");

        self.publish(&slots);
        Ok(())
    }

    /// Count a timeout on the slot. Returns true if this call quarantined it.
    pub async fn record_timeout(&self, slot_id: SlotId) -> Result<bool> {
        let mut slots = self.slots.lock().await;
        let threshold = self.quarantine_threshold;
        let slot = find_mut(&mut slots, slot_id)?;
        slot.consecutive_timeouts += 1;

        let newly_quarantined =
            slot.consecutive_timeouts >= threshold && slot.health == SlotHealth::Healthy;
        if newly_quarantined {
            slot.health = SlotHealth::Quarantined;
            warn!(
                slot_id = %slot_id,
                node = %slot.node,
                timeouts = slot.consecutive_timeouts,
                "Slot quarantined after consecutive timeouts"
            );
        }

        self.publish(&slots);
        Ok(newly_quarantined)
    }

    /// A build on the slot finished without timing out.
    pub async fn record_clean_exit(&self, slot_id: SlotId) -> Result<()> {
        let mut slots = self.slots.lock().await;
        find_mut(&mut slots, slot_id)?.consecutive_timeouts = 0;
        Ok(())
    }

    pub async fn capacity_snapshot(&self) -> CapacitySnapshot {
        snapshot_of(&self.slots.lock().await)
    }

    /// Receiver that observes a new snapshot after every pool mutation.
    pub fn subscribe(&self) -> watch::Receiver<CapacitySnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Whether any declared slot could ever host the profile.
    pub async fn fits_cluster(&self, profile: &ResourceProfile) -> bool {
        self.slots.lock().await.iter().any(|s| s.can_host(profile))
    }

    pub async fn slot(&self, slot_id: SlotId) -> Option<ResourceSlot> {
        self.slots
            .lock()
            .await
            .iter()
            .find(|s| s.id == slot_id)
            .cloned()
    }

    pub async fn slots(&self) -> Vec<ResourceSlot> {
        self.slots.lock().await.clone()
    }

    fn publish(&self, slots: &[ResourceSlot]) {
        self.snapshot_tx.send_replace(snapshot_of(slots));
    }
}

fn find_mut(slots: &mut [ResourceSlot], slot_id: SlotId) -> Result<&mut ResourceSlot> {
    slots
        .iter_mut()
        .find(|s| s.id == slot_id)
        .ok_or_else(|| Error::SlotNotFound(slot_id.to_string()))
}

fn snapshot_of(slots: &[ResourceSlot]) -> CapacitySnapshot {
    let mut snapshot = CapacitySnapshot {
        slots_total: slots.len(),
        ..Default::default()
    };
    for slot in slots {
        snapshot.total += slot.capacity;
        if slot.occupant.is_some() {
            snapshot.allocated += slot.capacity;
            snapshot.slots_occupied += 1;
        }
        if slot.health == SlotHealth::Quarantined {
            snapshot.slots_quarantined += 1;
        } else if slot.occupant.is_none() {
            snapshot.slots_free += 1;
        }
    }
    snapshot
}
