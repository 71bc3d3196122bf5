//! Generic `Instrument` trait for power supplies, electronic loads, and any
//! bench equipment with a switchable output.
//!
//! Drivers implement this trait and are registered with the kernel's
//! equipment table.  The safety core only ever talks to the trait, so a real
//! SCPI/Modbus driver and the [`SimInstrument`][crate::sim::SimInstrument]
//! stub are interchangeable.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use benchguard_types::{BenchError, EquipmentCategory, EquipmentId, Parameter};

/// Driver collaborator for a single piece of equipment.
///
/// Methods take `&self`; drivers are shared behind an `Arc` and must handle
/// their own interior mutability.  Every method may talk to hardware and is
/// therefore async and fallible.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Stable identifier, e.g. `"psu-1"`.
    fn id(&self) -> &EquipmentId;

    fn category(&self) -> EquipmentCategory;

    /// Parameters this instrument accepts.  Defaults to the category's set.
    fn capabilities(&self) -> BTreeSet<Parameter> {
        self.category().default_capabilities()
    }

    /// Write an already-approved value to the instrument.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Driver`] if the instrument rejects or fails to
    /// acknowledge the command.
    async fn apply(&self, parameter: Parameter, value: f64) -> Result<(), BenchError>;

    /// Last value the instrument reports for `parameter`.  Used to seed slew
    /// state on first use and to evaluate derived limits.
    async fn current_value(&self, parameter: Parameter) -> Result<f64, BenchError>;

    async fn output_enabled(&self) -> Result<bool, BenchError>;

    /// Force the output off.  Must be safe to call when it is already off.
    async fn disable_output(&self) -> Result<(), BenchError>;

    /// State of the external interlock loop (door switch, key, fixture sense).
    async fn is_interlock_satisfied(&self) -> Result<bool, BenchError>;
}

/// Run one driver call with a deadline.  A call that does not finish within
/// `limit` is dropped and reported as [`BenchError::Driver`].
pub async fn bounded<T>(
    equipment: &EquipmentId,
    call: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, BenchError>>,
) -> Result<T, BenchError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BenchError::Driver {
            equipment: equipment.clone(),
            details: format!("{call} timed out after {limit:?}"),
        }),
    }
}
