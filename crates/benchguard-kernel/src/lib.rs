//! `benchguard-kernel` – Safety validation & resource arbitration
//!
//! Every state-mutating command on a bench instrument passes through this
//! crate before it reaches a driver.  It does not talk to hardware; it decides
//! what may be said to it.
//!
//! # Modules
//!
//! - [`slew`] – [`SlewRateLimiter`][slew::SlewRateLimiter]: bounded,
//!   overshoot-free approach toward a requested setpoint.
//! - [`validator`] – [`SafetyValidator`][validator::SafetyValidator]: emergency
//!   stop, absolute limits, derived power, interlock, then slew, in that order.
//! - [`emergency_stop`] – [`EmergencyStopManager`][emergency_stop::EmergencyStopManager]:
//!   the process-wide stop that disables every enabled output and blocks
//!   re-enabling until lifted.
//! - [`event_log`] – [`SafetyEventLog`][event_log::SafetyEventLog]: append-only
//!   record of every validation decision, with a broadcast feed.
//! - [`lock_manager`] – [`EquipmentLockManager`][lock_manager::EquipmentLockManager]:
//!   exclusive and observer leases with expiry and forced release.
//! - [`session`] – [`SessionRegistry`][session::SessionRegistry]: client
//!   sessions and idle detection.
//! - [`equipment`] – [`EquipmentTable`][equipment::EquipmentTable]: per-equipment
//!   safety state keyed by id, one mutex per equipment.
//! - [`config`] – [`BenchConfig`][config::BenchConfig]: feature flags, timing
//!   and per-category default limits from `~/.benchguard/config.toml`.
//! - [`gate`] – [`BenchGate`][gate::BenchGate]: the command layer and
//!   administrative surface tying the above together.

pub mod config;
pub mod emergency_stop;
pub mod equipment;
pub mod event_log;
pub mod gate;
pub mod lock_manager;
pub mod session;
pub mod slew;
pub mod validator;

pub use config::{BenchConfig, ConfigError};
pub use emergency_stop::{DisableFailure, EmergencyStopManager, EmergencyStopReport, EmergencyStopStatus};
pub use equipment::{EquipmentSafety, EquipmentSlot, EquipmentTable};
pub use event_log::SafetyEventLog;
pub use gate::{BenchGate, CommandOutcome, SweepReport};
pub use lock_manager::EquipmentLockManager;
pub use session::SessionRegistry;
pub use slew::{SlewRateLimiter, SlewState};
pub use validator::{Approval, SafetyValidator};
