//! [`SafetyValidator`] – the limit checks every setpoint passes through.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. emergency stop (output-enabling requests only)
//! 2. absolute min/max of the requested value
//! 3. derived power against `max_power`, using the known companion value
//! 4. interlock, when the equipment requires one
//! 5. slew limiting toward the requested value
//!
//! Steps 2–4 are skipped when limit enforcement is disabled.  The emergency
//! stop is never skippable.  Slew state changes only when the command is
//! approved.  Every driver call made here is bounded by the driver timeout.
//!
//! Each command ends with exactly one
//! [`SafetyEvent`][benchguard_types::SafetyEvent].  A rejection is logged by
//! [`SafetyValidator::validate`] itself.  An approval is not: the caller logs
//! it with [`SafetyValidator::record_applied`] once the driver has accepted
//! the value, or with [`SafetyValidator::record_refused`] if it did not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use benchguard_hal::{Instrument, bounded};
use benchguard_types::{BenchError, EquipmentId, Parameter, SafetyAction, SafetyEvent, ViolationKind};
use tracing::{debug, warn};

use crate::emergency_stop::EmergencyStopManager;
use crate::equipment::EquipmentSafety;
use crate::event_log::SafetyEventLog;

/// The value cleared for the driver and what the validator did to get it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Approval {
    pub approved: f64,
    pub action: SafetyAction,
    /// Slew rate the value was limited against, if one applies.
    pub slew_rate: Option<f64>,
}

pub struct SafetyValidator {
    estop: Arc<EmergencyStopManager>,
    log: Arc<SafetyEventLog>,
    enforce_limits: bool,
    enforce_slew: bool,
    driver_timeout: Duration,
}

/// A failed check: the error to return and the limit that was checked.
struct Rejection {
    error: BenchError,
    message: String,
    attempted: f64,
    limit: Option<f64>,
}

impl SafetyValidator {
    pub fn new(
        estop: Arc<EmergencyStopManager>,
        log: Arc<SafetyEventLog>,
        enforce_limits: bool,
        enforce_slew: bool,
        driver_timeout: Duration,
    ) -> Self {
        Self {
            estop,
            log,
            enforce_limits,
            enforce_slew,
            driver_timeout,
        }
    }

    /// Validate `requested` for `parameter` and compute the value to apply.
    ///
    /// The caller must hold the equipment's mutex (that is where `safety`
    /// comes from), which serializes slew transitions per equipment.
    pub async fn validate(
        &self,
        driver: &dyn Instrument,
        safety: &mut EquipmentSafety,
        parameter: Parameter,
        requested: f64,
        now: Instant,
    ) -> Result<Approval, BenchError> {
        match self.check(driver, safety, parameter, requested).await {
            Ok(None) => {}
            Ok(Some(rejection)) => {
                warn!(
                    equipment = %driver.id(),
                    %parameter,
                    attempted = rejection.attempted,
                    limit = ?rejection.limit,
                    "command blocked: {}",
                    rejection.message
                );
                self.log.append(
                    driver.id(),
                    rejection.error.violation_kind(),
                    parameter,
                    rejection.message,
                    rejection.attempted,
                    rejection.limit,
                    SafetyAction::Blocked,
                );
                return Err(rejection.error);
            }
            Err(e) => {
                warn!(equipment = %driver.id(), %parameter, error = %e, "driver fault during validation");
                self.log.append(
                    driver.id(),
                    None,
                    parameter,
                    format!("validation aborted: {e}"),
                    requested,
                    None,
                    SafetyAction::Blocked,
                );
                return Err(e);
            }
        }

        let limit = safety.limits.limit(parameter).copied();
        let slew_rate = limit.and_then(|l| l.slew_rate);
        let approved = match limit.and_then(|l| l.slew_rate.map(|rate| (l, rate))) {
            Some((limit, rate)) if self.enforce_slew && parameter != Parameter::Output && rate > 0.0 => {
                safety.slew.clamp_into(parameter, limit.min, limit.max);
                let seed = match safety.slew.last_value(parameter) {
                    Some(v) => v,
                    None => self
                        .seed_from_driver(driver, parameter)
                        .await
                        .max(limit.min)
                        .min(limit.max),
                };
                safety.slew.next_value(parameter, requested, rate, now, seed)
            }
            _ => {
                safety.slew.record(parameter, requested, now);
                requested
            }
        };

        let action = if approved == requested {
            SafetyAction::Allowed
        } else {
            SafetyAction::Limited
        };
        debug!(equipment = %driver.id(), %parameter, requested, approved, ?action, "command approved");
        Ok(Approval {
            approved,
            action,
            slew_rate,
        })
    }

    /// Log an approved command the driver has accepted.
    pub fn record_applied(
        &self,
        equipment: &EquipmentId,
        parameter: Parameter,
        requested: f64,
        approval: &Approval,
    ) -> SafetyEvent {
        let approved = approval.approved;
        let (kind, message) = match approval.action {
            SafetyAction::Limited => (
                Some(ViolationKind::SlewRate),
                format!("{parameter} slew-limited to {approved} toward {requested}"),
            ),
            _ => (None, format!("{parameter} set to {approved}")),
        };
        self.log.append(
            equipment,
            kind,
            parameter,
            message,
            requested,
            approval.slew_rate,
            approval.action,
        )
    }

    /// Log an approved command that never took effect: the driver refused or
    /// timed out, or an emergency stop overtook it.
    pub fn record_refused(
        &self,
        equipment: &EquipmentId,
        parameter: Parameter,
        requested: f64,
        error: &BenchError,
    ) -> SafetyEvent {
        warn!(equipment = %equipment, %parameter, requested, error = %error, "approved command not applied");
        self.log.append(
            equipment,
            error.violation_kind(),
            parameter,
            format!("not applied: {error}"),
            requested,
            None,
            SafetyAction::Blocked,
        )
    }

    /// Starting point for a parameter with no slew history.  An unreadable
    /// driver falls back to zero.
    async fn seed_from_driver(&self, driver: &dyn Instrument, parameter: Parameter) -> f64 {
        match bounded(driver.id(), "current_value", self.driver_timeout, driver.current_value(parameter)).await {
            Ok(v) if v.is_finite() => v,
            Ok(_) | Err(_) => {
                warn!(equipment = %driver.id(), %parameter, "no readable starting value; ramping from 0");
                0.0
            }
        }
    }

    /// Steps 1–4.  `Ok(None)` means every check passed.
    async fn check(
        &self,
        driver: &dyn Instrument,
        safety: &EquipmentSafety,
        parameter: Parameter,
        requested: f64,
    ) -> Result<Option<Rejection>, BenchError> {
        let equipment = driver.id();

        if self.estop.is_active() && parameter.is_output_enabling(requested) {
            return Ok(Some(Rejection {
                error: BenchError::EmergencyStopActive {
                    equipment: equipment.clone(),
                    parameter,
                    attempted: requested,
                },
                message: "emergency stop active; output may not be enabled".to_string(),
                attempted: requested,
                limit: None,
            }));
        }

        if !self.enforce_limits {
            return Ok(None);
        }
        let limits = &safety.limits;

        // Absolute range.
        if let (Some(limit), Some(kind)) = (limits.limit(parameter), parameter.limit_violation())
            && !limit.contains(requested)
        {
            let bound = if requested > limit.max { limit.max } else { limit.min };
            let message = format!("{parameter} {requested} outside [{}, {}]", limit.min, limit.max);
            return Ok(Some(violation(equipment, kind, parameter, requested, bound, message)));
        }

        // Derived power.
        if let Some(max_power) = limits.max_power {
            let power = match parameter {
                Parameter::Voltage | Parameter::Current => {
                    let companion = if parameter == Parameter::Voltage {
                        Parameter::Current
                    } else {
                        Parameter::Voltage
                    };
                    let other = match safety.slew.last_value(companion) {
                        Some(v) => v,
                        None => {
                            bounded(equipment, "current_value", self.driver_timeout, driver.current_value(companion))
                                .await?
                        }
                    };
                    Some(requested * other)
                }
                Parameter::Power => Some(requested),
                _ => None,
            };
            if let Some(power) = power
                && power.abs() > max_power
            {
                return Ok(Some(violation(
                    equipment,
                    ViolationKind::PowerLimit,
                    parameter,
                    power,
                    max_power,
                    format!("derived power {power} W exceeds {max_power} W"),
                )));
            }
        }

        // Interlock.  Switching the output off is always allowed.
        if limits.interlock_required
            && !(parameter == Parameter::Output && requested == 0.0)
            && !bounded(equipment, "is_interlock_satisfied", self.driver_timeout, driver.is_interlock_satisfied())
                .await?
        {
            return Ok(Some(Rejection {
                error: BenchError::Violation {
                    equipment: equipment.clone(),
                    kind: ViolationKind::InterlockRequired,
                    parameter,
                    attempted: requested,
                    limit: None,
                },
                message: "interlock open".to_string(),
                attempted: requested,
                limit: None,
            }));
        }

        Ok(None)
    }
}

fn violation(
    equipment: &EquipmentId,
    kind: ViolationKind,
    parameter: Parameter,
    attempted: f64,
    limit: f64,
    message: String,
) -> Rejection {
    Rejection {
        error: BenchError::Violation {
            equipment: equipment.clone(),
            kind,
            parameter,
            attempted,
            limit: Some(limit),
        },
        message,
        attempted,
        limit: Some(limit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slew::SlewRateLimiter;
    use benchguard_hal::SimInstrument;
    use benchguard_types::{EquipmentCategory, ParameterLimit, SafetyLimits};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn validator(enforce_limits: bool, enforce_slew: bool) -> (SafetyValidator, Arc<EmergencyStopManager>, Arc<SafetyEventLog>) {
        let estop = Arc::new(EmergencyStopManager::new(Duration::from_millis(100)));
        let log = Arc::new(SafetyEventLog::default());
        (
            SafetyValidator::new(
                Arc::clone(&estop),
                Arc::clone(&log),
                enforce_limits,
                enforce_slew,
                Duration::from_millis(100),
            ),
            estop,
            log,
        )
    }

    fn safety(limits: SafetyLimits) -> EquipmentSafety {
        EquipmentSafety {
            limits,
            capabilities: BTreeSet::new(),
            slew: SlewRateLimiter::new(),
            connected: true,
        }
    }

    fn psu() -> SimInstrument {
        SimInstrument::new("psu-1", EquipmentCategory::PowerSupply)
    }

    fn volts(max: f64) -> SafetyLimits {
        SafetyLimits::new().with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, max))
    }

    #[tokio::test]
    async fn over_limit_is_blocked_and_slew_untouched() {
        let (v, _, log) = validator(true, true);
        let driver = psu();
        let mut s = safety(volts(30.0));

        let err = v
            .validate(&driver, &mut s, Parameter::Voltage, 35.0, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BenchError::Violation {
                equipment: "psu-1".into(),
                kind: ViolationKind::VoltageLimit,
                parameter: Parameter::Voltage,
                attempted: 35.0,
                limit: Some(30.0),
            }
        );
        assert!(s.slew.state(Parameter::Voltage).is_none());

        let events = log.events_for(&"psu-1".into());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, SafetyAction::Blocked);
        assert_eq!(events[0].limit, Some(30.0));
    }

    #[tokio::test]
    async fn under_minimum_reports_min_bound() {
        let (v, _, _) = validator(true, true);
        let mut s = safety(volts(30.0));
        let err = v
            .validate(&psu(), &mut s, Parameter::Voltage, -1.0, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Violation { limit: Some(0.0), .. }));
    }

    #[tokio::test]
    async fn target_beyond_ceiling_is_rejected_not_approached() {
        let (v, _, _) = validator(true, true);
        let limits = SafetyLimits::new()
            .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 30.0).with_slew_rate(1.0));
        let mut s = safety(limits);
        let result = v
            .validate(&psu(), &mut s, Parameter::Voltage, 31.0, Instant::now())
            .await;
        assert!(result.is_err());
        assert!(s.slew.state(Parameter::Voltage).is_none());
    }

    #[tokio::test]
    async fn emergency_stop_blocks_output_enable_only() {
        let (v, estop, log) = validator(true, true);
        let table = crate::equipment::EquipmentTable::new();
        estop.activate(&table).await;
        let driver = psu();
        let mut s = safety(volts(30.0));

        let err = v
            .validate(&driver, &mut s, Parameter::Output, 1.0, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(err.violation_kind(), Some(ViolationKind::EmergencyStopActive));

        // Turning the output off and adjusting setpoints stay possible.
        assert!(v.validate(&driver, &mut s, Parameter::Output, 0.0, Instant::now()).await.is_ok());
        assert!(v.validate(&driver, &mut s, Parameter::Voltage, 5.0, Instant::now()).await.is_ok());
        // Approvals are logged by the caller once applied.
        assert_eq!(log.count_for(&"psu-1".into()), 1);
    }

    #[tokio::test]
    async fn emergency_stop_applies_even_without_limit_enforcement() {
        let (v, estop, _) = validator(false, false);
        estop.activate(&crate::equipment::EquipmentTable::new()).await;
        let mut s = safety(SafetyLimits::new());
        assert!(v
            .validate(&psu(), &mut s, Parameter::Output, 1.0, Instant::now())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn derived_power_uses_known_companion() {
        let (v, _, _) = validator(true, false);
        let driver = psu().with_value(Parameter::Current, 4.0);
        let mut s = safety(volts(30.0).with_max_power(100.0));

        // 20 V × 4 A (read from the driver) = 80 W.
        assert!(v.validate(&driver, &mut s, Parameter::Voltage, 20.0, Instant::now()).await.is_ok());

        // Current 6 A against the now-known 20 V = 120 W.
        let err = v
            .validate(&driver, &mut s, Parameter::Current, 6.0, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::Violation {
                kind: ViolationKind::PowerLimit,
                attempted,
                limit: Some(100.0),
                ..
            } if attempted == 120.0
        ));
    }

    #[tokio::test]
    async fn open_interlock_blocks_but_output_off_passes() {
        let (v, _, _) = validator(true, true);
        let driver = psu();
        driver.set_interlock(false);
        let mut s = safety(volts(30.0).with_interlock(true));

        let err = v
            .validate(&driver, &mut s, Parameter::Voltage, 5.0, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(err.violation_kind(), Some(ViolationKind::InterlockRequired));
        assert!(v.validate(&driver, &mut s, Parameter::Output, 0.0, Instant::now()).await.is_ok());
    }

    #[tokio::test]
    async fn slew_limits_and_logs_limited() {
        let (v, _, log) = validator(true, true);
        let limits = SafetyLimits::new()
            .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 120.0).with_slew_rate(10.0));
        let mut s = safety(limits);
        let t0 = Instant::now();
        s.slew.seed(Parameter::Voltage, 0.0, t0);

        let a = v
            .validate(&psu(), &mut s, Parameter::Voltage, 50.0, t0 + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            a,
            Approval {
                approved: 10.0,
                action: SafetyAction::Limited,
                slew_rate: Some(10.0)
            }
        );
        assert!(log.events_for(&"psu-1".into()).is_empty());

        let event = v.record_applied(&"psu-1".into(), Parameter::Voltage, 50.0, &a);
        assert_eq!(event.kind, Some(ViolationKind::SlewRate));
        assert_eq!(event.action, SafetyAction::Limited);
        assert_eq!(event.attempted, 50.0);
        assert_eq!(event.limit, Some(10.0));
        assert_eq!(log.events_for(&"psu-1".into()), vec![event]);
    }

    #[tokio::test]
    async fn refused_command_is_logged_as_blocked() {
        let (v, _, log) = validator(true, true);
        let error = BenchError::Driver {
            equipment: "psu-1".into(),
            details: "bus error".into(),
        };
        let event = v.record_refused(&"psu-1".into(), Parameter::Output, 1.0, &error);

        assert_eq!(event.action, SafetyAction::Blocked);
        assert_eq!(event.kind, None);
        assert!(event.message.contains("bus error"));
        assert_eq!(log.count_for(&"psu-1".into()), 1);
    }

    #[tokio::test]
    async fn slew_disabled_approves_directly() {
        let (v, _, _) = validator(true, false);
        let limits = SafetyLimits::new()
            .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 120.0).with_slew_rate(10.0));
        let mut s = safety(limits);
        let a = v
            .validate(&psu(), &mut s, Parameter::Voltage, 50.0, Instant::now())
            .await
            .unwrap();
        assert_eq!(a.action, SafetyAction::Allowed);
        assert_eq!(s.slew.last_value(Parameter::Voltage), Some(50.0));
    }

    #[tokio::test]
    async fn disabled_enforcement_skips_range_check() {
        let (v, _, _) = validator(false, true);
        let mut s = safety(volts(30.0));
        let a = v
            .validate(&psu(), &mut s, Parameter::Voltage, 35.0, Instant::now())
            .await
            .unwrap();
        assert_eq!(a.approved, 35.0);
    }
}
