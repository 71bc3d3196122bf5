use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

/// Opaque identifier of a piece of bench equipment (e.g. `"psu-1"`).
///
/// The core never holds a handle to the hardware object itself; every piece of
/// per-equipment state is keyed by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EquipmentId(String);

impl EquipmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EquipmentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a client session competing for equipment access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh random session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Parameters & categories
// ────────────────────────────────────────────────────────────────────────────

/// A controllable quantity exposed by an instrument.
///
/// `Output` is the output-enable switch: `0.0` turns the output off, any other
/// value turns it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Voltage,
    Current,
    Power,
    Resistance,
    Output,
}

impl Parameter {
    /// The violation reported when this parameter leaves its absolute range.
    /// `Output` is a switch and has no range.
    pub fn limit_violation(self) -> Option<ViolationKind> {
        match self {
            Parameter::Voltage => Some(ViolationKind::VoltageLimit),
            Parameter::Current => Some(ViolationKind::CurrentLimit),
            Parameter::Power => Some(ViolationKind::PowerLimit),
            Parameter::Resistance => Some(ViolationKind::ResistanceLimit),
            Parameter::Output => None,
        }
    }

    /// `true` when a command writing `value` to this parameter would energise
    /// the output.
    pub fn is_output_enabling(self, value: f64) -> bool {
        self == Parameter::Output && value != 0.0
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parameter::Voltage => "voltage",
            Parameter::Current => "current",
            Parameter::Power => "power",
            Parameter::Resistance => "resistance",
            Parameter::Output => "output",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Parameter {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voltage" | "v" => Ok(Parameter::Voltage),
            "current" | "i" => Ok(Parameter::Current),
            "power" | "p" => Ok(Parameter::Power),
            "resistance" | "r" => Ok(Parameter::Resistance),
            "output" | "out" => Ok(Parameter::Output),
            other => Err(BenchError::UnsupportedParameter(other.to_string())),
        }
    }
}

/// Broad family an instrument belongs to.  Determines the default capability
/// set and the default [`SafetyLimits`] applied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentCategory {
    PowerSupply,
    ElectronicLoad,
    Other(String),
}

impl EquipmentCategory {
    /// Parameters an instrument of this category exposes unless its driver
    /// reports otherwise.
    pub fn default_capabilities(&self) -> BTreeSet<Parameter> {
        match self {
            EquipmentCategory::PowerSupply => {
                [Parameter::Voltage, Parameter::Current, Parameter::Output].into()
            }
            EquipmentCategory::ElectronicLoad => [
                Parameter::Voltage,
                Parameter::Current,
                Parameter::Power,
                Parameter::Resistance,
                Parameter::Output,
            ]
            .into(),
            EquipmentCategory::Other(_) => [Parameter::Output].into(),
        }
    }

    /// Key used for this category in configuration tables.
    pub fn config_key(&self) -> String {
        match self {
            EquipmentCategory::PowerSupply => "power_supply".to_string(),
            EquipmentCategory::ElectronicLoad => "electronic_load".to_string(),
            EquipmentCategory::Other(name) => name.clone(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety limits
// ────────────────────────────────────────────────────────────────────────────

/// Absolute range and optional slew rate for a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterLimit {
    pub min: f64,
    pub max: f64,
    /// Maximum rate of change in units per second.  `None` disables slewing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slew_rate: Option<f64>,
}

impl ParameterLimit {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            slew_rate: None,
        }
    }

    pub fn with_slew_rate(mut self, rate: f64) -> Self {
        self.slew_rate = Some(rate);
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-equipment safety envelope.
///
/// A parameter without an entry in `parameters` is not range-checked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    #[serde(default)]
    pub parameters: BTreeMap<Parameter, ParameterLimit>,
    /// Ceiling on the derived power `voltage × current`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_power: Option<f64>,
    #[serde(default)]
    pub interlock_required: bool,
}

impl SafetyLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, parameter: Parameter, limit: ParameterLimit) -> Self {
        self.parameters.insert(parameter, limit);
        self
    }

    pub fn with_max_power(mut self, watts: f64) -> Self {
        self.max_power = Some(watts);
        self
    }

    pub fn with_interlock(mut self, required: bool) -> Self {
        self.interlock_required = required;
        self
    }

    pub fn limit(&self, parameter: Parameter) -> Option<&ParameterLimit> {
        self.parameters.get(&parameter)
    }

    /// Conservative defaults for a bench power supply.
    pub fn power_supply_default() -> Self {
        Self::new()
            .with_parameter(
                Parameter::Voltage,
                ParameterLimit::new(0.0, 30.0).with_slew_rate(10.0),
            )
            .with_parameter(
                Parameter::Current,
                ParameterLimit::new(0.0, 5.0).with_slew_rate(2.0),
            )
            .with_max_power(150.0)
    }

    /// Conservative defaults for an electronic load.
    pub fn electronic_load_default() -> Self {
        Self::new()
            .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 120.0))
            .with_parameter(
                Parameter::Current,
                ParameterLimit::new(0.0, 30.0).with_slew_rate(5.0),
            )
            .with_parameter(Parameter::Power, ParameterLimit::new(0.0, 300.0))
            .with_parameter(Parameter::Resistance, ParameterLimit::new(0.05, 10_000.0))
            .with_max_power(300.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety events
// ────────────────────────────────────────────────────────────────────────────

/// Why a command was blocked or limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    EmergencyStopActive,
    VoltageLimit,
    CurrentLimit,
    PowerLimit,
    ResistanceLimit,
    InterlockRequired,
    /// Not a rejection: the approved value was slew-limited short of the target.
    SlewRate,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::EmergencyStopActive => "emergency_stop_active",
            ViolationKind::VoltageLimit => "voltage_limit",
            ViolationKind::CurrentLimit => "current_limit",
            ViolationKind::PowerLimit => "power_limit",
            ViolationKind::ResistanceLimit => "resistance_limit",
            ViolationKind::InterlockRequired => "interlock_required",
            ViolationKind::SlewRate => "slew_rate",
        };
        f.write_str(s)
    }
}

/// What the validator did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyAction {
    Blocked,
    Limited,
    Allowed,
}

/// Immutable record of one validation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEvent {
    pub id: Uuid,
    pub equipment: EquipmentId,
    pub timestamp: DateTime<Utc>,
    /// `None` for commands that passed unmodified.
    pub kind: Option<ViolationKind>,
    pub parameter: Parameter,
    pub message: String,
    pub attempted: f64,
    pub limit: Option<f64>,
    pub action: SafetyAction,
}

// ────────────────────────────────────────────────────────────────────────────
// Locks & sessions (admin snapshots)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Unlocked,
    Exclusive,
    Observer,
}

/// A single session's grant on an equipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub equipment: EquipmentId,
    pub session: SessionId,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Point-in-time view of an equipment's lock record.  Expired leases are never
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub equipment: EquipmentId,
    pub mode: LockMode,
    pub exclusive: Option<LeaseInfo>,
    pub observers: Vec<LeaseInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    Acquired,
    Released,
    Renewed,
    /// A lease ran out and was reclaimed by a sweep or a later acquisition.
    Expired,
    /// An administrator tore the lock down.
    ForceReleased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub equipment: EquipmentId,
    pub session: Option<SessionId>,
    pub mode: LockMode,
    pub kind: LockEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Caller identity as presented by the request layer; not authenticated here.
    pub identity: String,
    pub created_at: DateTime<Utc>,
    pub last_renewed: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Every condition the core surfaces to a caller.  None of them are retried.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BenchError {
    #[error("emergency stop active: {parameter}={attempted} rejected on {equipment}")]
    EmergencyStopActive {
        equipment: EquipmentId,
        parameter: Parameter,
        attempted: f64,
    },

    #[error("{kind} on {equipment}: {parameter}={attempted} (limit {limit:?})")]
    Violation {
        equipment: EquipmentId,
        kind: ViolationKind,
        parameter: Parameter,
        attempted: f64,
        limit: Option<f64>,
    },

    #[error("{equipment} is exclusively locked by {holder}")]
    LockConflict {
        equipment: EquipmentId,
        holder: SessionId,
    },

    #[error("lease on {equipment} held by {session} has expired")]
    LockExpired {
        equipment: EquipmentId,
        session: SessionId,
    },

    #[error("{session} does not hold the exclusive lock on {equipment}")]
    NotHolder {
        equipment: EquipmentId,
        session: SessionId,
    },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("unknown equipment: {0}")]
    UnknownEquipment(EquipmentId),

    #[error("unsupported parameter: {0}")]
    UnsupportedParameter(String),

    #[error("invalid value for {parameter}: {value}")]
    InvalidValue { parameter: Parameter, value: f64 },

    #[error("{0} is not connected")]
    NotConnected(EquipmentId),

    #[error("driver fault on {equipment}: {details}")]
    Driver {
        equipment: EquipmentId,
        details: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BenchError {
    /// The violation kind for safety rejections, `None` for access/driver errors.
    pub fn violation_kind(&self) -> Option<ViolationKind> {
        match self {
            BenchError::EmergencyStopActive { .. } => Some(ViolationKind::EmergencyStopActive),
            BenchError::Violation { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_parses_aliases() {
        assert_eq!("V".parse::<Parameter>().unwrap(), Parameter::Voltage);
        assert_eq!("current".parse::<Parameter>().unwrap(), Parameter::Current);
        assert!(matches!(
            "frequency".parse::<Parameter>(),
            Err(BenchError::UnsupportedParameter(_))
        ));
    }

    #[test]
    fn only_output_on_is_output_enabling() {
        assert!(Parameter::Output.is_output_enabling(1.0));
        assert!(!Parameter::Output.is_output_enabling(0.0));
        assert!(!Parameter::Voltage.is_output_enabling(12.0));
    }

    #[test]
    fn limit_violation_names_match_parameters() {
        assert_eq!(
            Parameter::Voltage.limit_violation().map(|k| k.to_string()).as_deref(),
            Some("voltage_limit")
        );
        assert_eq!(Parameter::Current.limit_violation(), Some(ViolationKind::CurrentLimit));
        assert_eq!(Parameter::Power.limit_violation(), Some(ViolationKind::PowerLimit));
        assert_eq!(Parameter::Output.limit_violation(), None);
    }

    #[test]
    fn power_supply_capabilities_exclude_load_parameters() {
        let caps = EquipmentCategory::PowerSupply.default_capabilities();
        assert!(caps.contains(&Parameter::Voltage));
        assert!(!caps.contains(&Parameter::Resistance));
    }

    #[test]
    fn parameter_limit_bounds_are_inclusive() {
        let lim = ParameterLimit::new(0.0, 30.0);
        assert!(lim.contains(0.0));
        assert!(lim.contains(30.0));
        assert!(!lim.contains(30.0001));
        assert!(!lim.contains(-0.1));
    }

    #[test]
    fn safety_limits_parse_from_toml() {
        let raw = r#"
            max_power = 60.0
            interlock_required = true

            [parameters.voltage]
            min = 0.0
            max = 30.0
            slew_rate = 10.0
        "#;
        let limits: SafetyLimits = toml::from_str(raw).unwrap();
        assert_eq!(limits.max_power, Some(60.0));
        assert!(limits.interlock_required);
        let v = limits.limit(Parameter::Voltage).unwrap();
        assert_eq!(v.max, 30.0);
        assert_eq!(v.slew_rate, Some(10.0));
        assert!(limits.limit(Parameter::Current).is_none());
    }

    #[test]
    fn safety_event_json_uses_snake_case_tags() {
        let event = SafetyEvent {
            id: Uuid::new_v4(),
            equipment: "psu-1".into(),
            timestamp: Utc::now(),
            kind: Some(ViolationKind::VoltageLimit),
            parameter: Parameter::Voltage,
            message: "over range".into(),
            attempted: 35.0,
            limit: Some(30.0),
            action: SafetyAction::Blocked,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"voltage_limit\""));
        assert!(json.contains("\"blocked\""));
        let back: SafetyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn bench_error_display_carries_values() {
        let err = BenchError::Violation {
            equipment: "psu-1".into(),
            kind: ViolationKind::VoltageLimit,
            parameter: Parameter::Voltage,
            attempted: 35.0,
            limit: Some(30.0),
        };
        let msg = err.to_string();
        assert!(msg.contains("voltage_limit"));
        assert!(msg.contains("35"));
        assert!(msg.contains("30"));
        assert_eq!(err.violation_kind(), Some(ViolationKind::VoltageLimit));
    }
}
