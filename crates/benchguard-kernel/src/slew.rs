//! [`SlewRateLimiter`] – gradual approach toward operator setpoints.
//!
//! A setpoint change is never handed to the driver in one jump when the
//! parameter has a slew rate.  Each call moves the last-applied value at most
//! `rate × dt` toward the target, where `dt` is the time since the previous
//! application.  The approach is monotonic and never overshoots; a new target
//! issued mid-ramp restarts from the current value.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use benchguard_kernel::slew::SlewRateLimiter;
//! use benchguard_types::Parameter;
//!
//! let t0 = Instant::now();
//! let mut slew = SlewRateLimiter::new();
//! slew.seed(Parameter::Voltage, 0.0, t0);
//!
//! let v1 = slew.next_value(Parameter::Voltage, 50.0, 10.0, t0 + Duration::from_secs(1), 0.0);
//! assert_eq!(v1, 10.0);
//! ```

use std::collections::HashMap;
use std::time::Instant;

use benchguard_types::Parameter;

/// Last value handed to the driver for one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlewState {
    pub value: f64,
    pub updated_at: Instant,
    /// `true` once the most recent target was reached.
    pub converged: bool,
}

/// Per-equipment slew state, one entry per parameter.
///
/// Instances live inside the equipment table, so the equipment id is implied
/// by ownership.
#[derive(Debug, Default)]
pub struct SlewRateLimiter {
    states: HashMap<Parameter, SlewState>,
}

/// One bounded step from `current` toward `target`.
///
/// `dt_secs` below zero is treated as zero.  The result always lies between
/// `current` and `target` inclusive.
pub fn step_toward(current: f64, target: f64, rate: f64, dt_secs: f64) -> f64 {
    let max_delta = (rate * dt_secs.max(0.0)).max(0.0);
    let delta = target - current;
    if delta.abs() <= max_delta {
        return target;
    }
    let next = current + delta.signum() * max_delta;
    // Rounding must not carry the step past the target.
    if delta > 0.0 {
        next.min(target)
    } else {
        next.max(target)
    }
}

impl SlewRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the starting point for `parameter`, e.g. from a driver reading at
    /// connect time.
    pub fn seed(&mut self, parameter: Parameter, value: f64, at: Instant) {
        self.states.insert(
            parameter,
            SlewState {
                value,
                updated_at: at,
                converged: true,
            },
        );
    }

    /// Record a value that was applied without ramping.
    pub fn record(&mut self, parameter: Parameter, value: f64, at: Instant) {
        self.seed(parameter, value, at);
    }

    pub fn state(&self, parameter: Parameter) -> Option<&SlewState> {
        self.states.get(&parameter)
    }

    pub fn last_value(&self, parameter: Parameter) -> Option<f64> {
        self.states.get(&parameter).map(|s| s.value)
    }

    /// Pull a stored value back inside `[min, max]` after the limits were
    /// tightened.  The timestamp is left untouched.
    pub fn clamp_into(&mut self, parameter: Parameter, min: f64, max: f64) {
        if let Some(state) = self.states.get_mut(&parameter) {
            state.value = state.value.max(min).min(max);
        }
    }

    /// Compute and persist the next value to apply for `parameter`.
    ///
    /// `seed` is used as the starting value only when no state exists yet; in
    /// that case the first call has `dt = 0` and returns `seed` unless it
    /// already equals `target`.
    pub fn next_value(
        &mut self,
        parameter: Parameter,
        target: f64,
        rate: f64,
        now: Instant,
        seed: f64,
    ) -> f64 {
        debug_assert!(rate > 0.0, "slew rate must be positive");
        let state = self.states.entry(parameter).or_insert(SlewState {
            value: seed,
            updated_at: now,
            converged: false,
        });
        let dt = now.saturating_duration_since(state.updated_at).as_secs_f64();
        let value = step_toward(state.value, target, rate, dt);
        *state = SlewState {
            value,
            // A stale `now` never rewinds the clock.
            updated_at: now.max(state.updated_at),
            converged: value == target,
        };
        value
    }

    /// Put back a state captured with [`state`](Self::state), undoing a
    /// transition whose value never reached the driver.
    pub fn restore(&mut self, parameter: Parameter, previous: Option<SlewState>) {
        match previous {
            Some(state) => {
                self.states.insert(parameter, state);
            }
            None => {
                self.states.remove(&parameter);
            }
        }
    }

    /// Drop all state, e.g. when the equipment is disconnected.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}
