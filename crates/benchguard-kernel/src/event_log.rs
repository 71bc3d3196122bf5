//! [`SafetyEventLog`] – append-only record of every validation decision.
//!
//! Entries are grouped per equipment and never mutated or removed by the
//! core.  Retention and persistence belong to whoever consumes the log.
//! Appended events are also broadcast on a [`tokio::sync::broadcast`] channel
//! so an alarm layer can react without polling.

use std::collections::HashMap;

use benchguard_types::{EquipmentId, Parameter, SafetyAction, SafetyEvent, ViolationKind};
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default number of events buffered for slow subscribers.
const DEFAULT_CAPACITY: usize = 256;

pub struct SafetyEventLog {
    events: RwLock<HashMap<EquipmentId, Vec<SafetyEvent>>>,
    notifier: broadcast::Sender<SafetyEvent>,
}

impl Default for SafetyEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SafetyEventLog {
    /// `capacity` bounds the broadcast buffer only; the log itself is unbounded.
    pub fn new(capacity: usize) -> Self {
        let (notifier, _) = broadcast::channel(capacity.max(1));
        Self {
            events: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    /// Build, append, and return a new event.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        equipment: &EquipmentId,
        kind: Option<ViolationKind>,
        parameter: Parameter,
        message: impl Into<String>,
        attempted: f64,
        limit: Option<f64>,
        action: SafetyAction,
    ) -> SafetyEvent {
        let event = SafetyEvent {
            id: Uuid::new_v4(),
            equipment: equipment.clone(),
            timestamp: Utc::now(),
            kind,
            parameter,
            message: message.into(),
            attempted,
            limit,
            action,
        };
        self.record(event.clone());
        event
    }

    /// Append an already-built event.
    pub fn record(&self, event: SafetyEvent) {
        self.events
            .write()
            .entry(event.equipment.clone())
            .or_default()
            .push(event.clone());
        // No subscribers is the normal case.
        let _ = self.notifier.send(event);
    }

    /// Events for `equipment` in the order they were appended.
    pub fn events_for(&self, equipment: &EquipmentId) -> Vec<SafetyEvent> {
        self.events
            .read()
            .get(equipment)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count_for(&self, equipment: &EquipmentId) -> usize {
        self.events.read().get(equipment).map_or(0, Vec::len)
    }

    /// Every event across all equipment, oldest first.
    pub fn all(&self) -> Vec<SafetyEvent> {
        let mut all: Vec<SafetyEvent> = self.events.read().values().flatten().cloned().collect();
        all.sort_by_key(|e| e.timestamp);
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.notifier.subscribe()
    }
}
