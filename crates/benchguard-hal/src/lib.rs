//! `benchguard-hal` – Driver boundary
//!
//! The safety core never speaks SCPI, Modbus, or USBTMC.  It talks to the
//! [`Instrument`] trait, and whatever sits behind that trait owns the wire.
//!
//! # Modules
//!
//! - [`instrument`] – [`Instrument`][instrument::Instrument]: the async driver
//!   collaborator (`apply`, `current_value`, `output_enabled`,
//!   `disable_output`, `is_interlock_satisfied`), plus
//!   [`bounded`][instrument::bounded] to put a deadline on any one call.
//! - [`sim`] – [`SimInstrument`][sim::SimInstrument] and the
//!   [`SimBench`][sim::SimBench] builder: in-process stubs with a call journal
//!   and fault injection, for tests and the operator console demo.

pub mod instrument;
pub mod sim;

pub use instrument::{Instrument, bounded};
pub use sim::{SimBench, SimCall, SimInstrument};
