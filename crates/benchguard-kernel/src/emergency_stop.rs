//! [`EmergencyStopManager`] – process-wide emergency stop.
//!
//! Two states, `Inactive` and `Active`.  The `active` flag is a single
//! [`AtomicBool`] so validators read it without blocking.  Transitions are
//! serialized by an async mutex and run in a fixed order:
//!
//! 1. `active` is set, so every validation that starts after this point sees
//!    the stop.
//! 2. Each equipment's mutex is taken in turn, waiting at most the disable
//!    timeout.  A command already running on that equipment normally finishes
//!    first, and nothing new can reach its driver while the output is checked
//!    and disabled.  If the mutex is still held when the wait runs out (a
//!    driver call is stuck), the output is disabled without it.  The command
//!    path re-checks the stop after its driver call returns, so it cannot
//!    switch the output back on behind the sweep.
//! 3. Driver calls are time-bounded.  Failures and timeouts are collected into
//!    the [`EmergencyStopReport`] instead of aborting the sweep.
//!
//! Deactivation clears the flag only.  Outputs stay off until an operator
//! re-enables them through ordinary commands.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use benchguard_types::EquipmentId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::equipment::{EquipmentSlot, EquipmentTable};

/// A device whose output could not be confirmed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableFailure {
    pub equipment: EquipmentId,
    pub details: String,
}

/// Result of [`EmergencyStopManager::activate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    /// `true` when the stop was already engaged and nothing was done.
    pub already_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    /// Equipment that had an enabled output at activation, including those
    /// whose disable failed.
    pub stopped: BTreeSet<EquipmentId>,
    pub failures: Vec<DisableFailure>,
}

/// Read-only view for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyStopStatus {
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub stopped: BTreeSet<EquipmentId>,
    pub failures: Vec<DisableFailure>,
}

#[derive(Debug, Default)]
struct StopRecord {
    activated_at: Option<DateTime<Utc>>,
    stopped: BTreeSet<EquipmentId>,
    failures: Vec<DisableFailure>,
}

pub struct EmergencyStopManager {
    active: AtomicBool,
    transition: Mutex<()>,
    record: RwLock<StopRecord>,
    disable_timeout: Duration,
}

impl EmergencyStopManager {
    pub fn new(disable_timeout: Duration) -> Self {
        Self {
            active: AtomicBool::new(false),
            transition: Mutex::new(()),
            record: RwLock::new(StopRecord::default()),
            disable_timeout,
        }
    }

    /// Single atomic read; never blocks.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Equipment captured by the most recent activation.  Kept after
    /// deactivation so operators can see what still has to be re-enabled.
    pub fn stopped_equipment(&self) -> BTreeSet<EquipmentId> {
        self.record.read().stopped.clone()
    }

    pub fn status(&self) -> EmergencyStopStatus {
        let record = self.record.read();
        EmergencyStopStatus {
            active: self.is_active(),
            activated_at: record.activated_at,
            stopped: record.stopped.clone(),
            failures: record.failures.clone(),
        }
    }

    /// Engage the stop and disable every enabled output in `table`.
    ///
    /// Idempotent: a second call while active returns the first activation's
    /// stopped set with `already_active = true`.
    pub async fn activate(&self, table: &EquipmentTable) -> EmergencyStopReport {
        let _transition = self.transition.lock().await;

        if self.is_active() {
            return self.report(true);
        }

        *self.record.write() = StopRecord {
            activated_at: Some(Utc::now()),
            ..StopRecord::default()
        };
        self.active.store(true, Ordering::SeqCst);
        warn!("EMERGENCY STOP activated");

        for slot in table.slots() {
            let _safety = match timeout(self.disable_timeout, slot.lock()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    warn!(equipment = %slot.id(), "equipment busy in a driver call; disabling without its lock");
                    None
                }
            };
            match self.stop_one(slot.as_ref()).await {
                None => {}
                Some(Ok(())) => self.note_stopped(slot.id(), None),
                Some(Err(details)) => self.note_stopped(slot.id(), Some(details)),
            }
        }

        let report = self.report(false);
        info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "emergency stop sweep complete"
        );
        report
    }

    /// Record an output switched off after the sweep had already passed its
    /// equipment, e.g. a command whose driver call was still in flight.
    /// `failure` carries the driver's complaint when the disable did not
    /// succeed.
    pub fn note_stopped(&self, equipment: &EquipmentId, failure: Option<String>) {
        let mut record = self.record.write();
        record.stopped.insert(equipment.clone());
        match failure {
            Some(details) => {
                error!(equipment = %equipment, %details, "failed to disable output");
                record.failures.push(DisableFailure {
                    equipment: equipment.clone(),
                    details,
                });
            }
            None => info!(equipment = %equipment, "output disabled"),
        }
    }

    /// Disable one output.  `None` when it was already off.
    async fn stop_one(&self, slot: &EquipmentSlot) -> Option<Result<(), String>> {
        let driver = slot.driver();

        // An output we cannot read back is treated as on.
        let enabled = match timeout(self.disable_timeout, driver.output_enabled()).await {
            Ok(Ok(enabled)) => enabled,
            Ok(Err(e)) => {
                warn!(equipment = %slot.id(), error = %e, "output state unreadable; disabling anyway");
                true
            }
            Err(_) => {
                warn!(equipment = %slot.id(), "output state query timed out; disabling anyway");
                true
            }
        };
        if !enabled {
            return None;
        }

        Some(match timeout(self.disable_timeout, driver.disable_output()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("disable_output timed out after {:?}", self.disable_timeout)),
        })
    }

    fn report(&self, already_active: bool) -> EmergencyStopReport {
        let record = self.record.read();
        EmergencyStopReport {
            already_active,
            activated_at: record.activated_at,
            stopped: record.stopped.clone(),
            failures: record.failures.clone(),
        }
    }

    /// Lift the global block.  Returns `false` when the stop was not active.
    pub async fn deactivate(&self) -> bool {
        let _transition = self.transition.lock().await;
        if !self.is_active() {
            return false;
        }
        self.record.write().activated_at = None;
        self.active.store(false, Ordering::SeqCst);
        info!("emergency stop deactivated; outputs remain disabled");
        true
    }
}
