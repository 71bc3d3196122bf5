//! In-process simulated instruments for CI and the operator console demo.
//!
//! [`SimInstrument`] keeps its setpoints in memory, records every driver call
//! in a journal, and exposes knobs to inject the failure modes the safety core
//! has to survive: an output that refuses to switch off, a driver that hangs
//! on `disable_output` or `apply`, and an open interlock loop.
//!
//! # Example
//!
//! ```rust
//! use benchguard_hal::sim::SimBench;
//!
//! let bench = SimBench::builder()
//!     .with_power_supply("psu-1")
//!     .with_load("load-1")
//!     .build();
//! assert_eq!(bench.len(), 2);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use benchguard_types::{BenchError, EquipmentCategory, EquipmentId, Parameter};
use parking_lot::Mutex;
use tracing::debug;

use crate::instrument::Instrument;

/// One entry in a [`SimInstrument`]'s call journal.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Apply(Parameter, f64),
    DisableOutput,
}

#[derive(Debug)]
struct SimState {
    values: BTreeMap<Parameter, f64>,
    output: bool,
    interlock: bool,
    fail_disable: bool,
    disable_delay: Option<Duration>,
    apply_delay: Option<Duration>,
    calls: Vec<SimCall>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SimInstrument
// ─────────────────────────────────────────────────────────────────────────────

/// A simulated instrument.  Commands always succeed unless a fault has been
/// injected.
#[derive(Debug)]
pub struct SimInstrument {
    id: EquipmentId,
    category: EquipmentCategory,
    state: Mutex<SimState>,
}

impl SimInstrument {
    pub fn new(id: impl Into<String>, category: EquipmentCategory) -> Self {
        Self {
            id: EquipmentId::new(id),
            category,
            state: Mutex::new(SimState {
                values: BTreeMap::new(),
                output: false,
                interlock: true,
                fail_disable: false,
                disable_delay: None,
                apply_delay: None,
                calls: Vec::new(),
            }),
        }
    }

    /// Preset a reading without recording a journal entry.
    pub fn with_value(self, parameter: Parameter, value: f64) -> Self {
        self.state.lock().values.insert(parameter, value);
        self
    }

    /// Preset the output switch without recording a journal entry.
    pub fn with_output(self, enabled: bool) -> Self {
        self.state.lock().output = enabled;
        self
    }

    pub fn set_interlock(&self, satisfied: bool) {
        self.state.lock().interlock = satisfied;
    }

    /// Make every subsequent `disable_output` fail and leave the output on.
    pub fn fail_disable(&self, fail: bool) {
        self.state.lock().fail_disable = fail;
    }

    /// Make every subsequent `disable_output` stall for `delay` before acting.
    pub fn set_disable_delay(&self, delay: Option<Duration>) {
        self.state.lock().disable_delay = delay;
    }

    /// Make every subsequent `apply` stall for `delay` before it reaches the
    /// instrument.  A cancelled call leaves no trace in the journal.
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        self.state.lock().apply_delay = delay;
    }

    pub fn value(&self, parameter: Parameter) -> f64 {
        self.state.lock().values.get(&parameter).copied().unwrap_or(0.0)
    }

    pub fn is_output_on(&self) -> bool {
        self.state.lock().output
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    pub fn disable_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::DisableOutput))
            .count()
    }
}

#[async_trait]
impl Instrument for SimInstrument {
    fn id(&self) -> &EquipmentId {
        &self.id
    }

    fn category(&self) -> EquipmentCategory {
        self.category.clone()
    }

    async fn apply(&self, parameter: Parameter, value: f64) -> Result<(), BenchError> {
        let delay = self.state.lock().apply_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.calls.push(SimCall::Apply(parameter, value));
        if parameter == Parameter::Output {
            state.output = value != 0.0;
        } else {
            state.values.insert(parameter, value);
        }
        debug!(equipment = %self.id, %parameter, value, "sim apply");
        Ok(())
    }

    async fn current_value(&self, parameter: Parameter) -> Result<f64, BenchError> {
        let state = self.state.lock();
        if parameter == Parameter::Output {
            return Ok(if state.output { 1.0 } else { 0.0 });
        }
        Ok(state.values.get(&parameter).copied().unwrap_or(0.0))
    }

    async fn output_enabled(&self) -> Result<bool, BenchError> {
        Ok(self.state.lock().output)
    }

    async fn disable_output(&self) -> Result<(), BenchError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(SimCall::DisableOutput);
            state.disable_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.fail_disable {
            return Err(BenchError::Driver {
                equipment: self.id.clone(),
                details: "output relay did not open".to_string(),
            });
        }
        state.output = false;
        Ok(())
    }

    async fn is_interlock_satisfied(&self) -> Result<bool, BenchError> {
        Ok(self.state.lock().interlock)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SimBench builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder that produces a set of shared [`SimInstrument`]s.
#[derive(Default)]
pub struct SimBench {
    instruments: Vec<(String, EquipmentCategory)>,
}

impl SimBench {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn with_power_supply(self, id: impl Into<String>) -> Self {
        self.with_instrument(id, EquipmentCategory::PowerSupply)
    }

    pub fn with_load(self, id: impl Into<String>) -> Self {
        self.with_instrument(id, EquipmentCategory::ElectronicLoad)
    }

    pub fn with_instrument(mut self, id: impl Into<String>, category: EquipmentCategory) -> Self {
        self.instruments.push((id.into(), category));
        self
    }

    pub fn build(self) -> Vec<Arc<SimInstrument>> {
        self.instruments
            .into_iter()
            .map(|(id, category)| Arc::new(SimInstrument::new(id, category)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_records_journal_and_value() {
        let psu = SimInstrument::new("psu-1", EquipmentCategory::PowerSupply);
        psu.apply(Parameter::Voltage, 12.0).await.unwrap();
        psu.apply(Parameter::Output, 1.0).await.unwrap();

        assert_eq!(psu.value(Parameter::Voltage), 12.0);
        assert!(psu.is_output_on());
        assert_eq!(
            psu.calls(),
            vec![
                SimCall::Apply(Parameter::Voltage, 12.0),
                SimCall::Apply(Parameter::Output, 1.0)
            ]
        );
        assert_eq!(psu.current_value(Parameter::Output).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn injected_disable_failure_leaves_output_on() {
        let psu = SimInstrument::new("psu-1", EquipmentCategory::PowerSupply).with_output(true);
        psu.fail_disable(true);

        let result = psu.disable_output().await;
        assert!(matches!(result, Err(BenchError::Driver { .. })));
        assert!(psu.is_output_on());
        assert_eq!(psu.disable_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_slow_apply_never_reaches_the_instrument() {
        let psu = SimInstrument::new("psu-1", EquipmentCategory::PowerSupply);
        psu.set_apply_delay(Some(Duration::from_secs(3600)));

        let attempt = tokio::time::timeout(Duration::from_millis(10), psu.apply(Parameter::Output, 1.0)).await;
        assert!(attempt.is_err());
        assert!(!psu.is_output_on());
        assert!(psu.calls().is_empty());
    }

    #[tokio::test]
    async fn interlock_knob_is_reported() {
        let psu = SimInstrument::new("psu-1", EquipmentCategory::PowerSupply);
        assert!(psu.is_interlock_satisfied().await.unwrap());
        psu.set_interlock(false);
        assert!(!psu.is_interlock_satisfied().await.unwrap());
    }

    #[tokio::test]
    async fn preset_values_are_not_journaled() {
        let load = SimInstrument::new("load-1", EquipmentCategory::ElectronicLoad)
            .with_value(Parameter::Current, 2.5);
        assert_eq!(load.current_value(Parameter::Current).await.unwrap(), 2.5);
        assert!(load.calls().is_empty());
    }

    #[test]
    fn bench_builder_assigns_categories() {
        let bench = SimBench::builder()
            .with_power_supply("psu-1")
            .with_load("load-1")
            .build();
        assert_eq!(bench[0].id().as_str(), "psu-1");
        assert_eq!(bench[0].category(), EquipmentCategory::PowerSupply);
        assert_eq!(bench[1].category(), EquipmentCategory::ElectronicLoad);
    }
}
