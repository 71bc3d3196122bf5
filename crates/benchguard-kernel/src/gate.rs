//! [`BenchGate`] – single interception point between client sessions and the
//! instrument drivers.
//!
//! A state-mutating command reaches a driver only through
//! [`BenchGate::submit_command`], which enforces, in order:
//!
//! 1. **Session**: the session must be open; the call renews it.
//! 2. **Lock** ([`EquipmentLockManager`]): the session must hold a live
//!    exclusive lease on the equipment.
//! 3. **Equipment state**: the equipment must be connected and expose the
//!    parameter.
//! 4. **Safety** ([`SafetyValidator`]): emergency stop, limits, interlock and
//!    slew, under the equipment's mutex.
//!
//! The gate also carries the administrative surface: emergency stop, forced
//! lock release, and read-only views of events, locks, and sessions.
//!
//! # Example
//!
//! ```
//! # tokio_test_block_on(async {
//! use std::sync::Arc;
//! use benchguard_hal::{Instrument, SimInstrument};
//! use benchguard_kernel::{BenchConfig, BenchGate};
//! use benchguard_types::{EquipmentCategory, Parameter};
//!
//! let gate = BenchGate::new(BenchConfig::default());
//! let psu: Arc<dyn Instrument> = Arc::new(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply));
//! gate.register_instrument(psu);
//!
//! let session = gate.open_session("operator");
//! let psu_id = "psu-1".into();
//! gate.connect(&psu_id).await.unwrap();
//! gate.acquire_exclusive(&psu_id, &session.id, None).unwrap();
//!
//! // 35 V is above the power supply's 30 V ceiling.
//! assert!(gate.submit_command(&psu_id, &session.id, Parameter::Voltage, 35.0).await.is_err());
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use benchguard_hal::{Instrument, bounded};
use benchguard_types::{
    BenchError, EquipmentId, LeaseInfo, LockEvent, LockSnapshot, Parameter, SafetyAction, SafetyEvent,
    SafetyLimits, SessionId, SessionInfo,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::emergency_stop::{EmergencyStopManager, EmergencyStopReport, EmergencyStopStatus};
use crate::equipment::EquipmentTable;
use crate::event_log::SafetyEventLog;
use crate::lock_manager::EquipmentLockManager;
use crate::session::SessionRegistry;
use crate::validator::SafetyValidator;

/// What happened to a submitted command that reached the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub equipment: EquipmentId,
    pub parameter: Parameter,
    pub requested: f64,
    /// The value actually handed to the driver.
    pub approved: f64,
    pub action: SafetyAction,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub reaped_sessions: Vec<SessionId>,
}

pub struct BenchGate {
    config: BenchConfig,
    table: EquipmentTable,
    sessions: SessionRegistry,
    locks: EquipmentLockManager,
    estop: Arc<EmergencyStopManager>,
    events: Arc<SafetyEventLog>,
    validator: SafetyValidator,
}

impl BenchGate {
    pub fn new(config: BenchConfig) -> Self {
        let estop = Arc::new(EmergencyStopManager::new(config.disable_timeout()));
        let events = Arc::new(SafetyEventLog::default());
        let validator = SafetyValidator::new(
            Arc::clone(&estop),
            Arc::clone(&events),
            config.enforce_limits,
            config.enforce_slew,
            config.command_timeout(),
        );
        info!(
            enforce_limits = config.enforce_limits,
            enforce_slew = config.enforce_slew,
            safe_disconnect = config.safe_state_on_disconnect,
            "bench gate ready"
        );
        let locks = EquipmentLockManager::with_history_limit(config.lock_history_len);
        Self {
            config,
            table: EquipmentTable::new(),
            sessions: SessionRegistry::new(),
            locks,
            estop,
            events,
            validator,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    // ── Equipment ───────────────────────────────────────────────────────────

    /// Register `driver` with its category's default limits.
    pub fn register_instrument(&self, driver: Arc<dyn Instrument>) {
        let limits = self.config.limits_for(&driver.category());
        self.table.register(driver, limits);
    }

    /// Register `driver` with limits that override the category default.
    pub fn register_instrument_with_limits(&self, driver: Arc<dyn Instrument>, limits: SafetyLimits) {
        self.table.register(driver, limits);
    }

    /// Administrator reconfiguration of an equipment's limits.
    pub async fn set_limits(&self, equipment: &EquipmentId, limits: SafetyLimits) -> Result<(), BenchError> {
        self.table.set_limits(equipment, limits).await
    }

    pub fn equipment(&self) -> Vec<EquipmentId> {
        self.table.ids()
    }

    pub async fn is_connected(&self, equipment: &EquipmentId) -> Result<bool, BenchError> {
        Ok(self.table.get(equipment)?.lock().await.connected)
    }

    pub async fn connect(&self, equipment: &EquipmentId) -> Result<(), BenchError> {
        self.connect_at(equipment, Instant::now()).await
    }

    /// Mark `equipment` connected and seed slew state for each capability
    /// from the driver's current readings.  Connecting twice is a no-op.
    ///
    /// # Errors
    ///
    /// A failed reading aborts the connect with nothing changed.
    pub async fn connect_at(&self, equipment: &EquipmentId, now: Instant) -> Result<(), BenchError> {
        let slot = self.table.get(equipment)?;
        let mut safety = slot.lock().await;
        if safety.connected {
            debug!(equipment = %equipment, "already connected");
            return Ok(());
        }

        let mut seeds = Vec::new();
        for parameter in safety.capabilities.iter().copied().filter(|p| *p != Parameter::Output) {
            let mut value = bounded(
                equipment,
                "current_value",
                self.config.command_timeout(),
                slot.driver().current_value(parameter),
            )
            .await?;
            if let Some(limit) = safety.limits.limit(parameter) {
                value = value.max(limit.min).min(limit.max);
            }
            seeds.push((parameter, value));
        }
        safety.slew.clear();
        for (parameter, value) in seeds {
            safety.slew.seed(parameter, value, now);
        }
        safety.connected = true;
        info!(equipment = %equipment, "equipment connected");
        Ok(())
    }

    /// Disconnect `equipment` on behalf of `session`.
    ///
    /// With safe-disconnect enabled, an enabled output is switched off with
    /// exactly one driver call before any lock or slew state is removed.
    ///
    /// # Errors
    ///
    /// [`BenchError::LockConflict`] when another session holds the exclusive
    /// lease.  A failed or timed-out disable aborts the disconnect with
    /// nothing torn down.
    pub async fn disconnect(&self, equipment: &EquipmentId, session: &SessionId) -> Result<(), BenchError> {
        self.sessions.touch(session)?;
        let slot = self.table.get(equipment)?;
        let mut safety = slot.lock().await;

        if let Some(holder) = self.locks.exclusive_holder(equipment)
            && &holder != session
        {
            return Err(BenchError::LockConflict {
                equipment: equipment.clone(),
                holder,
            });
        }

        if self.config.safe_state_on_disconnect {
            let driver = slot.driver();
            let limit = self.config.disable_timeout();
            // An output we cannot read back is treated as on.
            let enabled = !matches!(
                bounded(equipment, "output_enabled", limit, driver.output_enabled()).await,
                Ok(false)
            );
            if enabled {
                if let Err(e) = bounded(equipment, "disable_output", limit, driver.disable_output()).await {
                    warn!(equipment = %equipment, error = %e, "safe disconnect failed; equipment left connected");
                    return Err(e);
                }
                info!(equipment = %equipment, "output disabled for disconnect");
            }
        }

        self.locks.clear(equipment);
        safety.slew.clear();
        safety.connected = false;
        info!(equipment = %equipment, session = %session, "equipment disconnected");
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────────────

    pub fn open_session(&self, identity: impl Into<String>) -> SessionInfo {
        self.sessions.open(identity)
    }

    /// Close `session` and release every lease it holds.  Returns the
    /// equipment that was released.
    pub fn close_session(&self, session: &SessionId) -> Result<Vec<EquipmentId>, BenchError> {
        if !self.sessions.is_open(session) {
            return Err(BenchError::UnknownSession(session.clone()));
        }
        let released = self.locks.release_all(session);
        self.sessions.close(session);
        Ok(released)
    }

    /// Close sessions idle beyond `session_idle_timeout_ms`.
    pub fn reap_idle_sessions(&self) -> Vec<SessionId> {
        self.reap_idle_sessions_at(Instant::now())
    }

    pub fn reap_idle_sessions_at(&self, now: Instant) -> Vec<SessionId> {
        let idle = self.sessions.idle_sessions_at(self.config.session_idle_timeout(), now);
        for session in &idle {
            warn!(session = %session, "closing idle session");
            self.locks.release_all(session);
            self.sessions.close(session);
        }
        idle
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    // ── Locks ───────────────────────────────────────────────────────────────

    /// `ttl` defaults to `default_lock_ttl_ms`.
    pub fn acquire_exclusive(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Option<Duration>,
    ) -> Result<LeaseInfo, BenchError> {
        self.acquire_exclusive_at(equipment, session, ttl, Instant::now())
    }

    pub fn acquire_exclusive_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<LeaseInfo, BenchError> {
        self.sessions.touch_at(session, now)?;
        self.table.get(equipment)?;
        self.locks
            .acquire_exclusive_at(equipment, session, ttl.unwrap_or(self.config.lock_ttl()), now)
    }

    pub fn acquire_observer(&self, equipment: &EquipmentId, session: &SessionId) -> Result<LeaseInfo, BenchError> {
        self.sessions.touch(session)?;
        self.table.get(equipment)?;
        Ok(self
            .locks
            .acquire_observer(equipment, session, self.config.observer_ttl()))
    }

    pub fn release(&self, equipment: &EquipmentId, session: &SessionId) -> Result<bool, BenchError> {
        self.sessions.touch(session)?;
        Ok(self.locks.release(equipment, session))
    }

    pub fn renew(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Option<Duration>,
    ) -> Result<LeaseInfo, BenchError> {
        self.renew_at(equipment, session, ttl, Instant::now())
    }

    pub fn renew_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<LeaseInfo, BenchError> {
        self.sessions.touch_at(session, now)?;
        self.locks
            .renew_at(equipment, session, ttl.unwrap_or(self.config.lock_ttl()), now)
    }

    // ── Commands ────────────────────────────────────────────────────────────

    pub async fn submit_command(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        parameter: Parameter,
        value: f64,
    ) -> Result<CommandOutcome, BenchError> {
        self.submit(equipment, session, parameter, value, None).await
    }

    /// Validate and apply one setpoint at an explicit `now`.
    ///
    /// # Errors
    ///
    /// Session, lock, and equipment errors are returned before validation
    /// and leave no safety event.  Safety violations are logged by the
    /// validator.  A driver failure or timeout on `apply` rolls the slew
    /// state back and is logged as blocked.  An output switched on while an
    /// emergency stop was engaging is switched off again and reported as
    /// [`BenchError::EmergencyStopActive`].
    pub async fn submit_command_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        parameter: Parameter,
        value: f64,
        now: Instant,
    ) -> Result<CommandOutcome, BenchError> {
        self.submit(equipment, session, parameter, value, Some(now)).await
    }

    /// `at = None` reads the clock once the equipment mutex is held, so slew
    /// steps are timed in the order they reach the driver.
    async fn submit(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        parameter: Parameter,
        value: f64,
        at: Option<Instant>,
    ) -> Result<CommandOutcome, BenchError> {
        self.sessions.touch_at(session, at.unwrap_or_else(Instant::now))?;
        let slot = self.table.get(equipment)?;
        if !value.is_finite() {
            return Err(BenchError::InvalidValue { parameter, value });
        }

        let mut safety = slot.lock().await;
        let now = at.unwrap_or_else(Instant::now);
        self.locks.check_exclusive_at(equipment, session, now)?;
        if !safety.connected {
            return Err(BenchError::NotConnected(equipment.clone()));
        }
        if !safety.capabilities.contains(&parameter) {
            return Err(BenchError::UnsupportedParameter(format!("{parameter} on {equipment}")));
        }

        let previous = safety.slew.state(parameter).copied();
        let approval = self
            .validator
            .validate(slot.driver().as_ref(), &mut safety, parameter, value, now)
            .await?;

        let driver = slot.driver();
        let applied = bounded(
            equipment,
            "apply",
            self.config.command_timeout(),
            driver.apply(parameter, approval.approved),
        )
        .await;
        if let Err(e) = applied {
            safety.slew.restore(parameter, previous);
            self.validator.record_refused(equipment, parameter, value, &e);
            return Err(e);
        }

        // An emergency stop engaged while `apply` was in flight wins.
        if self.estop.is_active() && parameter.is_output_enabling(approval.approved) {
            let disabled = bounded(
                equipment,
                "disable_output",
                self.config.disable_timeout(),
                driver.disable_output(),
            )
            .await;
            self.estop.note_stopped(equipment, disabled.err().map(|e| e.to_string()));
            safety.slew.restore(parameter, previous);
            let error = BenchError::EmergencyStopActive {
                equipment: equipment.clone(),
                parameter,
                attempted: value,
            };
            self.validator.record_refused(equipment, parameter, value, &error);
            return Err(error);
        }

        self.validator.record_applied(equipment, parameter, value, &approval);
        Ok(CommandOutcome {
            equipment: equipment.clone(),
            parameter,
            requested: value,
            approved: approval.approved,
            action: approval.action,
        })
    }

    // ── Emergency stop ──────────────────────────────────────────────────────

    pub async fn activate_emergency_stop(&self) -> EmergencyStopReport {
        self.estop.activate(&self.table).await
    }

    pub async fn deactivate_emergency_stop(&self) -> bool {
        self.estop.deactivate().await
    }

    pub fn emergency_stop_status(&self) -> EmergencyStopStatus {
        self.estop.status()
    }

    pub fn is_emergency_stop_active(&self) -> bool {
        self.estop.is_active()
    }

    // ── Administration ──────────────────────────────────────────────────────

    /// Tear down every lease on `equipment`.  Returns how many were dropped.
    pub fn force_release(&self, equipment: &EquipmentId) -> Result<usize, BenchError> {
        self.table.get(equipment)?;
        Ok(self.locks.force_release(equipment))
    }

    pub fn safety_events(&self, equipment: &EquipmentId) -> Vec<SafetyEvent> {
        self.events.events_for(equipment)
    }

    pub fn all_safety_events(&self) -> Vec<SafetyEvent> {
        self.events.all()
    }

    pub fn subscribe_safety_events(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    pub fn lock_state(&self, equipment: &EquipmentId) -> LockSnapshot {
        self.locks.snapshot(equipment)
    }

    pub fn lock_states(&self) -> Vec<LockSnapshot> {
        self.table.ids().iter().map(|id| self.locks.snapshot(id)).collect()
    }

    pub fn lock_events(&self, equipment: &EquipmentId) -> Vec<LockEvent> {
        self.locks.lock_events(equipment)
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Reclaim expired leases and close idle sessions.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        SweepReport {
            expired_leases: self.locks.sweep_expired_at(now),
            reaped_sessions: self.reap_idle_sessions_at(now),
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_ms` on the current
    /// tokio runtime.  The task ends once the gate is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(gate) = gate.upgrade() else {
                    debug!("bench gate dropped; sweeper exiting");
                    break;
                };
                let report = gate.sweep();
                if report.expired_leases > 0 || !report.reaped_sessions.is_empty() {
                    debug!(
                        expired = report.expired_leases,
                        reaped = report.reaped_sessions.len(),
                        "sweep"
                    );
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use benchguard_hal::{SimCall, SimInstrument};
    use benchguard_types::{EquipmentCategory, LockMode, ParameterLimit, ViolationKind};

    fn gate_with_psu() -> (BenchGate, Arc<SimInstrument>, EquipmentId) {
        let gate = BenchGate::new(BenchConfig::default());
        let psu = Arc::new(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply));
        gate.register_instrument(psu.clone());
        (gate, psu, EquipmentId::new("psu-1"))
    }

    #[tokio::test]
    async fn command_requires_open_session() {
        let (gate, _, psu) = gate_with_psu();
        let err = gate
            .submit_command(&psu, &"ghost".into(), Parameter::Voltage, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn command_requires_exclusive_lock() {
        let (gate, _, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_observer(&psu, &s).unwrap();
        let err = gate.submit_command(&psu, &s, Parameter::Voltage, 1.0).await.unwrap_err();
        assert!(matches!(err, BenchError::NotHolder { .. }));
        assert!(gate.safety_events(&psu).is_empty());
    }

    #[tokio::test]
    async fn command_requires_connection_and_capability() {
        let (gate, _, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        assert!(matches!(
            gate.submit_command(&psu, &s, Parameter::Voltage, 1.0).await,
            Err(BenchError::NotConnected(_))
        ));

        gate.connect(&psu).await.unwrap();
        assert!(matches!(
            gate.submit_command(&psu, &s, Parameter::Resistance, 10.0).await,
            Err(BenchError::UnsupportedParameter(_))
        ));
    }

    #[tokio::test]
    async fn non_finite_values_are_rejected() {
        let (gate, _, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        assert!(matches!(
            gate.submit_command(&psu, &s, Parameter::Voltage, f64::NAN).await,
            Err(BenchError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn approved_value_reaches_driver() {
        let (gate, sim, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();

        let t = Instant::now() + Duration::from_secs(1);
        let outcome = gate
            .submit_command_at(&psu, &s, Parameter::Voltage, 25.0, t)
            .await
            .unwrap();
        // Power supply default slews at 10 V/s from the 0 V reading taken at connect.
        assert_eq!(outcome.action, SafetyAction::Limited);
        assert_eq!(sim.calls().last(), Some(&SimCall::Apply(Parameter::Voltage, outcome.approved)));

        let events = gate.safety_events(&psu);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, SafetyAction::Limited);
        assert_eq!(events[0].attempted, 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_apply_times_out_and_releases_the_equipment() {
        let (gate, sim, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        sim.set_apply_delay(Some(Duration::from_secs(3600)));

        let err = gate.submit_command(&psu, &s, Parameter::Output, 1.0).await.unwrap_err();
        assert!(matches!(err, BenchError::Driver { ref details, .. } if details.contains("apply timed out")));
        assert!(!sim.is_output_on());

        let events = gate.safety_events(&psu);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, SafetyAction::Blocked);

        sim.set_apply_delay(None);
        assert!(gate.submit_command(&psu, &s, Parameter::Output, 1.0).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn output_enabled_behind_an_emergency_stop_is_switched_back_off() {
        let config = BenchConfig {
            command_timeout_ms: 60_000,
            ..BenchConfig::default()
        };
        let gate = Arc::new(BenchGate::new(config));
        let sim = Arc::new(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply));
        gate.register_instrument(sim.clone());
        let psu = EquipmentId::new("psu-1");
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        sim.set_apply_delay(Some(Duration::from_secs(10)));

        let command = {
            let (gate, psu, s) = (Arc::clone(&gate), psu.clone(), s.clone());
            tokio::spawn(async move { gate.submit_command(&psu, &s, Parameter::Output, 1.0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The sweep gives up waiting on the busy equipment and finds its output off.
        let report = gate.activate_emergency_stop().await;
        assert!(report.stopped.is_empty());

        let err = command.await.unwrap().unwrap_err();
        assert_eq!(err.violation_kind(), Some(ViolationKind::EmergencyStopActive));
        assert!(!sim.is_output_on());
        assert_eq!(gate.emergency_stop_status().stopped, BTreeSet::from([psu.clone()]));

        let last = gate.safety_events(&psu).pop().unwrap();
        assert_eq!(last.action, SafetyAction::Blocked);
        assert_eq!(last.kind, Some(ViolationKind::EmergencyStopActive));
    }

    #[tokio::test]
    async fn connect_seeds_from_driver_reading() {
        let gate = BenchGate::new(BenchConfig::default());
        let sim = Arc::new(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply).with_value(Parameter::Voltage, 12.0));
        let limits = SafetyLimits::new()
            .with_parameter(Parameter::Voltage, ParameterLimit::new(0.0, 30.0).with_slew_rate(1.0));
        gate.register_instrument_with_limits(sim.clone(), limits);
        let psu = EquipmentId::new("psu-1");
        let s = gate.open_session("alice").id;

        let t0 = Instant::now();
        gate.connect_at(&psu, t0).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        let outcome = gate
            .submit_command_at(&psu, &s, Parameter::Voltage, 20.0, t0 + Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome.approved, 14.0);
    }

    #[tokio::test]
    async fn close_session_releases_its_locks() {
        let (gate, _, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.acquire_exclusive(&psu, &s, None).unwrap();

        assert_eq!(gate.close_session(&s).unwrap(), vec![psu.clone()]);
        assert_eq!(gate.lock_state(&psu).mode, LockMode::Unlocked);
        assert!(matches!(gate.close_session(&s), Err(BenchError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped_with_their_locks() {
        let (gate, _, psu) = gate_with_psu();
        let t0 = Instant::now();
        let s = gate.open_session("alice").id;
        gate.acquire_exclusive_at(&psu, &s, Some(Duration::from_secs(3600)), t0).unwrap();

        let later = t0 + gate.config().session_idle_timeout() + Duration::from_secs(1);
        let report = gate.sweep_at(later);
        assert_eq!(report.reaped_sessions, vec![s]);
        assert!(gate.sessions().is_empty());
        assert_eq!(gate.lock_state(&psu).mode, LockMode::Unlocked);
    }

    #[tokio::test]
    async fn disconnect_by_non_holder_is_refused() {
        let (gate, sim, psu) = gate_with_psu();
        let a = gate.open_session("alice").id;
        let b = gate.open_session("bob").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &a, None).unwrap();

        assert!(matches!(
            gate.disconnect(&psu, &b).await,
            Err(BenchError::LockConflict { .. })
        ));
        assert!(gate.is_connected(&psu).await.unwrap());
        assert_eq!(sim.disable_calls(), 0);
    }

    #[tokio::test]
    async fn failed_safe_disconnect_changes_nothing() {
        let (gate, sim, psu) = gate_with_psu();
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        gate.submit_command(&psu, &s, Parameter::Output, 1.0).await.unwrap();
        sim.fail_disable(true);

        assert!(matches!(gate.disconnect(&psu, &s).await, Err(BenchError::Driver { .. })));
        assert!(gate.is_connected(&psu).await.unwrap());
        assert_eq!(gate.lock_state(&psu).exclusive.unwrap().session, s);
    }

    #[tokio::test]
    async fn unsafe_disconnect_skips_disable() {
        let config = BenchConfig {
            safe_state_on_disconnect: false,
            ..BenchConfig::default()
        };
        let gate = BenchGate::new(config);
        let sim = Arc::new(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply).with_output(true));
        gate.register_instrument(sim.clone());
        let s = gate.open_session("alice").id;

        gate.disconnect(&"psu-1".into(), &s).await.unwrap();
        assert_eq!(sim.disable_calls(), 0);
        assert!(sim.is_output_on());
    }

    #[tokio::test]
    async fn driver_failure_on_apply_rolls_back_slew() {
        struct Refuses(SimInstrument);

        #[async_trait::async_trait]
        impl Instrument for Refuses {
            fn id(&self) -> &EquipmentId {
                self.0.id()
            }
            fn category(&self) -> EquipmentCategory {
                self.0.category()
            }
            async fn apply(&self, _: Parameter, _: f64) -> Result<(), BenchError> {
                Err(BenchError::Driver {
                    equipment: self.0.id().clone(),
                    details: "bus error".into(),
                })
            }
            async fn current_value(&self, p: Parameter) -> Result<f64, BenchError> {
                self.0.current_value(p).await
            }
            async fn output_enabled(&self) -> Result<bool, BenchError> {
                self.0.output_enabled().await
            }
            async fn disable_output(&self) -> Result<(), BenchError> {
                self.0.disable_output().await
            }
            async fn is_interlock_satisfied(&self) -> Result<bool, BenchError> {
                self.0.is_interlock_satisfied().await
            }
        }

        let gate = BenchGate::new(BenchConfig::default());
        gate.register_instrument(Arc::new(Refuses(SimInstrument::new("psu-1", EquipmentCategory::PowerSupply))));
        let psu = EquipmentId::new("psu-1");
        let s = gate.open_session("alice").id;
        let t0 = Instant::now();
        gate.connect_at(&psu, t0).await.unwrap();
        gate.acquire_exclusive_at(&psu, &s, None, t0).unwrap();

        let t1 = t0 + Duration::from_secs(1);
        assert!(gate.submit_command_at(&psu, &s, Parameter::Voltage, 5.0, t1).await.is_err());

        // The log shows the refusal, not an approval that never happened.
        let events = gate.safety_events(&psu);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, SafetyAction::Blocked);
        assert!(events[0].message.contains("bus error"));

        // Had the failed step been kept, this would start from 5 V, not 0 V.
        let slot = gate.table.get(&psu).unwrap();
        assert_eq!(slot.lock().await.slew.last_value(Parameter::Voltage), Some(0.0));
    }

    #[tokio::test]
    async fn subscribers_see_validation_events() {
        let (gate, _, psu) = gate_with_psu();
        let mut rx = gate.subscribe_safety_events();
        let s = gate.open_session("alice").id;
        gate.connect(&psu).await.unwrap();
        gate.acquire_exclusive(&psu, &s, None).unwrap();
        let _ = gate.submit_command(&psu, &s, Parameter::Voltage, 99.0).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, SafetyAction::Blocked);
        assert_eq!(event.equipment, psu);
    }

    #[tokio::test]
    async fn force_release_requires_known_equipment() {
        let (gate, _, psu) = gate_with_psu();
        assert!(matches!(
            gate.force_release(&"ghost".into()),
            Err(BenchError::UnknownEquipment(_))
        ));
        assert_eq!(gate.force_release(&psu).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_gate_is_dropped() {
        let gate = Arc::new(BenchGate::new(BenchConfig::default()));
        let handle = gate.spawn_sweeper();
        drop(gate);
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper exits")
            .unwrap();
    }
}
