//! Bench configuration – reads/writes `~/.benchguard/config.toml`.
//!
//! Every field has a serde default, so a partial file (or none at all) yields
//! a usable configuration.  `BENCHGUARD_*` environment variables are applied
//! on top after loading.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use benchguard_types::{EquipmentCategory, SafetyLimits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Feature flags, timing, and per-category default limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Check absolute limits, derived power, and the interlock.  The
    /// emergency stop is enforced regardless.
    #[serde(default = "default_true")]
    pub enforce_limits: bool,

    /// Ramp setpoints at each parameter's slew rate.
    #[serde(default = "default_true")]
    pub enforce_slew: bool,

    /// Switch the output off before tearing down a disconnected equipment.
    #[serde(default = "default_true")]
    pub safe_state_on_disconnect: bool,

    #[serde(default = "default_lock_ttl_ms")]
    pub default_lock_ttl_ms: u64,

    #[serde(default = "default_observer_ttl_ms")]
    pub observer_ttl_ms: u64,

    /// Upper bound on a single driver call during emergency stop or disconnect.
    #[serde(default = "default_disable_timeout_ms")]
    pub disable_timeout_ms: u64,

    /// Upper bound on a driver call made while an equipment is locked for a
    /// command or connect (`apply`, readings, interlock).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_session_idle_timeout_ms")]
    pub session_idle_timeout_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Lock audit events kept per equipment.
    #[serde(default = "default_lock_history_len")]
    pub lock_history_len: usize,

    /// Default limits keyed by [`EquipmentCategory::config_key`].
    #[serde(default)]
    pub category_limits: BTreeMap<String, SafetyLimits>,
}

fn default_true() -> bool {
    true
}
fn default_lock_ttl_ms() -> u64 {
    30_000
}
fn default_observer_ttl_ms() -> u64 {
    300_000
}
fn default_disable_timeout_ms() -> u64 {
    500
}
fn default_command_timeout_ms() -> u64 {
    2_000
}
fn default_session_idle_timeout_ms() -> u64 {
    600_000
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_lock_history_len() -> usize {
    crate::lock_manager::DEFAULT_HISTORY_LIMIT
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            enforce_limits: true,
            enforce_slew: true,
            safe_state_on_disconnect: true,
            default_lock_ttl_ms: default_lock_ttl_ms(),
            observer_ttl_ms: default_observer_ttl_ms(),
            disable_timeout_ms: default_disable_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            lock_history_len: default_lock_history_len(),
            category_limits: BTreeMap::new(),
        }
    }
}

impl BenchConfig {
    /// Default limits for `category`.  Falls back to the built-in envelopes
    /// for power supplies and electronic loads; other categories get an
    /// empty envelope.
    pub fn limits_for(&self, category: &EquipmentCategory) -> SafetyLimits {
        if let Some(limits) = self.category_limits.get(&category.config_key()) {
            return limits.clone();
        }
        match category {
            EquipmentCategory::PowerSupply => SafetyLimits::power_supply_default(),
            EquipmentCategory::ElectronicLoad => SafetyLimits::electronic_load_default(),
            EquipmentCategory::Other(_) => SafetyLimits::new(),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.default_lock_ttl_ms)
    }

    pub fn observer_ttl(&self) -> Duration {
        Duration::from_millis(self.observer_ttl_ms)
    }

    pub fn disable_timeout(&self) -> Duration {
        Duration::from_millis(self.disable_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Load from `path`.  Returns `None` if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: BenchConfig = toml::from_str(&raw)?;
        cfg.apply_env_overrides();
        Ok(Some(cfg))
    }

    /// Load from [`config_path`].
    pub fn load() -> Result<Option<Self>, ConfigError> {
        Self::load_from(&config_path())
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).map_err(io_err)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&config_path())
    }

    /// Apply `BENCHGUARD_*` environment overrides.  Unparseable values are
    /// ignored.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `BENCHGUARD_ENFORCE_LIMITS` | `enforce_limits` |
    /// | `BENCHGUARD_ENFORCE_SLEW` | `enforce_slew` |
    /// | `BENCHGUARD_SAFE_DISCONNECT` | `safe_state_on_disconnect` |
    /// | `BENCHGUARD_LOCK_TTL_MS` | `default_lock_ttl_ms` |
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("BENCHGUARD_ENFORCE_LIMITS") {
            self.enforce_limits = v;
        }
        if let Some(v) = env_bool("BENCHGUARD_ENFORCE_SLEW") {
            self.enforce_slew = v;
        }
        if let Some(v) = env_bool("BENCHGUARD_SAFE_DISCONNECT") {
            self.safe_state_on_disconnect = v;
        }
        if let Ok(v) = std::env::var("BENCHGUARD_LOCK_TTL_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.default_lock_ttl_ms = ms;
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `~/.benchguard/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".benchguard").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchguard_types::{Parameter, ParameterLimit};

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BenchConfig::default();
        assert!(cfg.enforce_limits && cfg.enforce_slew && cfg.safe_state_on_disconnect);
        assert_eq!(cfg.lock_ttl(), Duration::from_secs(30));
        assert_eq!(cfg.disable_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.command_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.lock_history_len, 256);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let cfg: BenchConfig = toml::from_str("enforce_slew = false\n").unwrap();
        assert!(!cfg.enforce_slew);
        assert!(cfg.enforce_limits);
        assert_eq!(cfg.default_lock_ttl_ms, 30_000);
    }

    #[test]
    fn roundtrip_with_category_limits() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = BenchConfig::default();
        cfg.category_limits.insert(
            "power_supply".to_string(),
            SafetyLimits::new()
                .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 12.0).with_slew_rate(1.0))
                .with_max_power(24.0),
        );
        cfg.save_to(&path).expect("save");

        let loaded = BenchConfig::load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.category_limits, cfg.category_limits);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(BenchConfig::load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "enforce_limits = \"maybe\"").unwrap();
        assert!(matches!(BenchConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn config_path_points_to_benchguard_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".benchguard"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn limits_for_prefers_configured_category() {
        let mut cfg = BenchConfig::default();
        assert_eq!(
            cfg.limits_for(&EquipmentCategory::PowerSupply),
            SafetyLimits::power_supply_default()
        );
        let custom = SafetyLimits::new().with_interlock(true);
        cfg.category_limits.insert("power_supply".to_string(), custom.clone());
        assert_eq!(cfg.limits_for(&EquipmentCategory::PowerSupply), custom);
        assert_eq!(
            cfg.limits_for(&EquipmentCategory::Other("scope".into())),
            SafetyLimits::new()
        );
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("sometimes"), None);
    }

    #[test]
    fn apply_env_overrides_changes_enforce_slew() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("BENCHGUARD_ENFORCE_SLEW", "false") };
        let mut cfg = BenchConfig::default();
        cfg.apply_env_overrides();
        assert!(!cfg.enforce_slew);
        unsafe { std::env::remove_var("BENCHGUARD_ENFORCE_SLEW") };
    }

    #[test]
    fn apply_env_overrides_changes_lock_ttl() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("BENCHGUARD_LOCK_TTL_MS", "1500") };
        let mut cfg = BenchConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.default_lock_ttl_ms, 1500);
        unsafe { std::env::remove_var("BENCHGUARD_LOCK_TTL_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_flag() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("BENCHGUARD_SAFE_DISCONNECT", "perhaps") };
        let mut cfg = BenchConfig::default();
        cfg.apply_env_overrides();
        assert!(cfg.safe_state_on_disconnect);
        unsafe { std::env::remove_var("BENCHGUARD_SAFE_DISCONNECT") };
    }
}
