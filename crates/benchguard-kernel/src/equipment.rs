//! [`EquipmentTable`] – arena of per-equipment safety state keyed by id.
//!
//! Each registered instrument gets one [`EquipmentSlot`] holding the driver
//! handle and an async mutex around its [`EquipmentSafety`] (limits, slew
//! state, connection flag).  Every command on an equipment runs with that
//! mutex held, so commands on the same equipment observe a linear sequence of
//! slew transitions while commands on different equipment never contend.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use benchguard_hal::Instrument;
use benchguard_types::{BenchError, EquipmentCategory, EquipmentId, Parameter, SafetyLimits};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::slew::SlewRateLimiter;

/// Mutable safety state of one equipment.
#[derive(Debug)]
pub struct EquipmentSafety {
    pub limits: SafetyLimits,
    pub capabilities: BTreeSet<Parameter>,
    pub slew: SlewRateLimiter,
    pub connected: bool,
}

pub struct EquipmentSlot {
    id: EquipmentId,
    category: EquipmentCategory,
    driver: Arc<dyn Instrument>,
    safety: Mutex<EquipmentSafety>,
}

impl EquipmentSlot {
    pub fn id(&self) -> &EquipmentId {
        &self.id
    }

    pub fn category(&self) -> &EquipmentCategory {
        &self.category
    }

    pub fn driver(&self) -> &Arc<dyn Instrument> {
        &self.driver
    }

    /// Enter this equipment's serialized section.
    pub async fn lock(&self) -> MutexGuard<'_, EquipmentSafety> {
        self.safety.lock().await
    }
}

#[derive(Default)]
pub struct EquipmentTable {
    slots: RwLock<HashMap<EquipmentId, Arc<EquipmentSlot>>>,
}

impl EquipmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under its own id with the given limits.  Any
    /// previously registered equipment with the same id is replaced.
    pub fn register(&self, driver: Arc<dyn Instrument>, limits: SafetyLimits) -> Arc<EquipmentSlot> {
        let id = driver.id().clone();
        let slot = Arc::new(EquipmentSlot {
            id: id.clone(),
            category: driver.category(),
            safety: Mutex::new(EquipmentSafety {
                limits,
                capabilities: driver.capabilities(),
                slew: SlewRateLimiter::new(),
                connected: false,
            }),
            driver,
        });
        if self.slots.write().insert(id.clone(), Arc::clone(&slot)).is_some() {
            warn!(equipment = %id, "equipment re-registered; previous state discarded");
        } else {
            info!(equipment = %id, category = ?slot.category, "equipment registered");
        }
        slot
    }

    /// # Errors
    ///
    /// [`BenchError::UnknownEquipment`] when `id` was never registered.
    pub fn get(&self, id: &EquipmentId) -> Result<Arc<EquipmentSlot>, BenchError> {
        self.slots
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BenchError::UnknownEquipment(id.clone()))
    }

    pub fn contains(&self, id: &EquipmentId) -> bool {
        self.slots.read().contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<EquipmentId> {
        let mut ids: Vec<EquipmentId> = self.slots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All slots, sorted by id so sweeps visit equipment in a stable order.
    pub fn slots(&self) -> Vec<Arc<EquipmentSlot>> {
        let mut slots: Vec<Arc<EquipmentSlot>> = self.slots.read().values().cloned().collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Administrator reconfiguration of an equipment's limits.  Stored slew
    /// values are pulled inside the new ranges.
    pub async fn set_limits(&self, id: &EquipmentId, limits: SafetyLimits) -> Result<(), BenchError> {
        let slot = self.get(id)?;
        let mut safety = slot.lock().await;
        for (parameter, limit) in &limits.parameters {
            safety.slew.clamp_into(*parameter, limit.min, limit.max);
        }
        safety.limits = limits;
        info!(equipment = %id, "safety limits reconfigured");
        Ok(())
    }
}
