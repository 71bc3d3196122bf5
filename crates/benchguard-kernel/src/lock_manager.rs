//! [`EquipmentLockManager`] – lease-based arbitration of equipment access.
//!
//! Each equipment has one lock record holding at most one exclusive lease and
//! any number of observer leases.  Only the exclusive holder may issue
//! write-class commands.
//!
//! **Observer policy:** observers never block exclusive acquisition, and an
//! exclusive holder never blocks observers.  Exclusivity applies to writers
//! only; monitoring sessions and one controlling session coexist.
//!
//! Leases expire on their own.  Every operation on a record first reclaims
//! expired leases while holding the record's mutex, so an expired lease is
//! never reported as held.  [`EquipmentLockManager::sweep_expired`] does the
//! same eagerly for all records.
//!
//! Records are sharded per equipment: contention on one equipment never
//! delays another.
//!
//! Wall-clock lease times in [`LeaseInfo`] are derived from the `Instant`
//! the operation ran at, so the `_at` variants report the same deadline
//! they enforce.  The per-equipment audit trail keeps the most recent
//! [`DEFAULT_HISTORY_LIMIT`] events unless configured otherwise.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use benchguard_types::{
    BenchError, EquipmentId, LeaseInfo, LockEvent, LockEventKind, LockMode, LockSnapshot, SessionId,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

/// Shortest lease ever granted, so `expires_at > acquired_at` always holds.
const MIN_TTL: Duration = Duration::from_millis(1);
/// Longest lease ever granted.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
/// Audit events retained per equipment.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Lease & record
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Lease {
    session: SessionId,
    acquired_at: Instant,
    expires_at: Instant,
    acquired_wall: DateTime<Utc>,
    expires_wall: DateTime<Utc>,
}

impl Lease {
    fn new(session: SessionId, ttl: Duration, now: Instant) -> Self {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        let wall = wall_clock(now);
        Self {
            session,
            acquired_at: now,
            expires_at: now + ttl,
            acquired_wall: wall,
            expires_wall: wall_deadline(wall, ttl),
        }
    }

    fn extend(&mut self, ttl: Duration, now: Instant) {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        self.expires_at = now.max(self.acquired_at) + ttl;
        self.expires_wall = wall_deadline(self.acquired_wall, self.expires_at - self.acquired_at);
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn info(&self, equipment: &EquipmentId, mode: LockMode) -> LeaseInfo {
        LeaseInfo {
            equipment: equipment.clone(),
            session: self.session.clone(),
            mode,
            acquired_at: self.acquired_wall,
            expires_at: self.expires_wall,
        }
    }
}

/// Wall-clock reading for `at`, anchored on the current time.
fn wall_clock(at: Instant) -> DateTime<Utc> {
    let (mono, wall) = (Instant::now(), Utc::now());
    let shifted = if at >= mono {
        chrono::Duration::from_std(at - mono)
            .ok()
            .and_then(|d| wall.checked_add_signed(d))
    } else {
        chrono::Duration::from_std(mono - at)
            .ok()
            .and_then(|d| wall.checked_sub_signed(d))
    };
    shifted.unwrap_or(wall)
}

fn wall_deadline(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug)]
struct LockRecord {
    exclusive: Option<Lease>,
    observers: BTreeMap<SessionId, Lease>,
    history: VecDeque<LockEvent>,
    history_limit: usize,
    /// Session whose exclusive lease most recently ran out, so it can be told
    /// `LockExpired` rather than `NotHolder`.
    expired_holder: Option<SessionId>,
}

impl Default for LockRecord {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl LockRecord {
    fn with_history_limit(history_limit: usize) -> Self {
        Self {
            exclusive: None,
            observers: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            expired_holder: None,
        }
    }

    fn log(&mut self, equipment: &EquipmentId, session: Option<SessionId>, mode: LockMode, kind: LockEventKind) {
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(LockEvent {
            equipment: equipment.clone(),
            session,
            mode,
            kind,
            at: Utc::now(),
        });
    }

    /// Drop every lease that has run out by `now`.  Returns how many.
    fn reap(&mut self, equipment: &EquipmentId, now: Instant) -> usize {
        let mut reaped = 0;
        if let Some(lease) = self.exclusive.take_if(|l| !l.is_live(now)) {
            warn!(equipment = %equipment, session = %lease.session, "exclusive lease expired");
            self.log(equipment, Some(lease.session.clone()), LockMode::Exclusive, LockEventKind::Expired);
            self.expired_holder = Some(lease.session);
            reaped += 1;
        }
        let expired: Vec<SessionId> = self
            .observers
            .iter()
            .filter(|(_, l)| !l.is_live(now))
            .map(|(s, _)| s.clone())
            .collect();
        for session in expired {
            self.observers.remove(&session);
            info!(equipment = %equipment, session = %session, "observer lease expired");
            self.log(equipment, Some(session), LockMode::Observer, LockEventKind::Expired);
            reaped += 1;
        }
        reaped
    }

    fn mode(&self) -> LockMode {
        if self.exclusive.is_some() {
            LockMode::Exclusive
        } else if !self.observers.is_empty() {
            LockMode::Observer
        } else {
            LockMode::Unlocked
        }
    }

    fn snapshot(&self, equipment: &EquipmentId) -> LockSnapshot {
        LockSnapshot {
            equipment: equipment.clone(),
            mode: self.mode(),
            exclusive: self.exclusive.as_ref().map(|l| l.info(equipment, LockMode::Exclusive)),
            observers: self
                .observers
                .values()
                .map(|l| l.info(equipment, LockMode::Observer))
                .collect(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// EquipmentLockManager
// ────────────────────────────────────────────────────────────────────────────

/// # Example
///
/// ```
/// use std::time::Duration;
/// use benchguard_kernel::lock_manager::EquipmentLockManager;
/// use benchguard_types::{BenchError, EquipmentId, SessionId};
///
/// let locks = EquipmentLockManager::new();
/// let psu = EquipmentId::new("psu-1");
/// let (a, b) = (SessionId::new("a"), SessionId::new("b"));
///
/// locks.acquire_exclusive(&psu, &a, Duration::from_secs(30)).unwrap();
/// assert!(matches!(
///     locks.acquire_exclusive(&psu, &b, Duration::from_secs(30)),
///     Err(BenchError::LockConflict { .. })
/// ));
/// ```
pub struct EquipmentLockManager {
    records: RwLock<HashMap<EquipmentId, Arc<Mutex<LockRecord>>>>,
    history_limit: usize,
}

impl Default for EquipmentLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EquipmentLockManager {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` audit events per equipment (at least one).
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            history_limit: limit.max(1),
        }
    }

    fn record(&self, equipment: &EquipmentId) -> Arc<Mutex<LockRecord>> {
        if let Some(record) = self.records.read().get(equipment) {
            return Arc::clone(record);
        }
        let limit = self.history_limit;
        Arc::clone(
            self.records
                .write()
                .entry(equipment.clone())
                .or_insert_with(|| Arc::new(Mutex::new(LockRecord::with_history_limit(limit)))),
        )
    }

    fn existing(&self, equipment: &EquipmentId) -> Option<Arc<Mutex<LockRecord>>> {
        self.records.read().get(equipment).cloned()
    }

    fn all_records(&self) -> Vec<(EquipmentId, Arc<Mutex<LockRecord>>)> {
        let mut all: Vec<_> = self
            .records
            .read()
            .iter()
            .map(|(id, r)| (id.clone(), Arc::clone(r)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    // ── Acquisition ─────────────────────────────────────────────────────────

    pub fn acquire_exclusive(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Duration,
    ) -> Result<LeaseInfo, BenchError> {
        self.acquire_exclusive_at(equipment, session, ttl, Instant::now())
    }

    /// Grant `session` the exclusive lease on `equipment`.
    ///
    /// An expired holder is reclaimed first.  Re-acquiring a lease the
    /// session already holds refreshes it.
    ///
    /// # Errors
    ///
    /// [`BenchError::LockConflict`] if another session holds a live lease.
    /// The loser of a race never waits.
    pub fn acquire_exclusive_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Duration,
        now: Instant,
    ) -> Result<LeaseInfo, BenchError> {
        let record = self.record(equipment);
        let mut record = record.lock();
        record.reap(equipment, now);

        if let Some(lease) = record.exclusive.as_mut() {
            if &lease.session != session {
                return Err(BenchError::LockConflict {
                    equipment: equipment.clone(),
                    holder: lease.session.clone(),
                });
            }
            lease.extend(ttl, now);
            let info = lease.info(equipment, LockMode::Exclusive);
            record.log(equipment, Some(session.clone()), LockMode::Exclusive, LockEventKind::Renewed);
            return Ok(info);
        }

        let lease = Lease::new(session.clone(), ttl, now);
        let info = lease.info(equipment, LockMode::Exclusive);
        record.exclusive = Some(lease);
        if record.expired_holder.as_ref() == Some(session) {
            record.expired_holder = None;
        }
        record.log(equipment, Some(session.clone()), LockMode::Exclusive, LockEventKind::Acquired);
        info!(equipment = %equipment, session = %session, ?ttl, "exclusive lock granted");
        Ok(info)
    }

    pub fn acquire_observer(&self, equipment: &EquipmentId, session: &SessionId, ttl: Duration) -> LeaseInfo {
        self.acquire_observer_at(equipment, session, ttl, Instant::now())
    }

    /// Add `session` to the observer set.  Always succeeds; an existing
    /// observer lease is refreshed.
    pub fn acquire_observer_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Duration,
        now: Instant,
    ) -> LeaseInfo {
        let record = self.record(equipment);
        let mut record = record.lock();
        record.reap(equipment, now);

        let (info, kind) = match record.observers.get_mut(session) {
            Some(lease) => {
                lease.extend(ttl, now);
                (lease.info(equipment, LockMode::Observer), LockEventKind::Renewed)
            }
            None => {
                let lease = Lease::new(session.clone(), ttl, now);
                let info = lease.info(equipment, LockMode::Observer);
                record.observers.insert(session.clone(), lease);
                info!(equipment = %equipment, session = %session, "observer lock granted");
                (info, LockEventKind::Acquired)
            }
        };
        record.log(equipment, Some(session.clone()), LockMode::Observer, kind);
        info
    }

    // ── Release & renewal ───────────────────────────────────────────────────

    /// Drop whatever `session` holds on `equipment`.  Returns `false` when it
    /// held nothing.
    pub fn release(&self, equipment: &EquipmentId, session: &SessionId) -> bool {
        let Some(record) = self.existing(equipment) else {
            return false;
        };
        let mut record = record.lock();
        let mut released = false;
        if record.exclusive.take_if(|l| &l.session == session).is_some() {
            record.log(equipment, Some(session.clone()), LockMode::Exclusive, LockEventKind::Released);
            released = true;
        }
        if record.observers.remove(session).is_some() {
            record.log(equipment, Some(session.clone()), LockMode::Observer, LockEventKind::Released);
            released = true;
        }
        if released {
            info!(equipment = %equipment, session = %session, "lock released");
        }
        released
    }

    /// Administrative override: drop every lease on `equipment`.  Returns the
    /// number of leases removed.  The forced action is logged even when
    /// nothing was held.
    pub fn force_release(&self, equipment: &EquipmentId) -> usize {
        let record = self.record(equipment);
        let mut record = record.lock();
        let mut dropped = Vec::new();
        if let Some(lease) = record.exclusive.take() {
            dropped.push((lease.session, LockMode::Exclusive));
        }
        let observers = std::mem::take(&mut record.observers);
        dropped.extend(observers.into_keys().map(|s| (s, LockMode::Observer)));
        record.expired_holder = None;

        if dropped.is_empty() {
            record.log(equipment, None, LockMode::Unlocked, LockEventKind::ForceReleased);
        }
        for (session, mode) in &dropped {
            record.log(equipment, Some(session.clone()), *mode, LockEventKind::ForceReleased);
        }
        warn!(equipment = %equipment, leases = dropped.len(), "lock force-released");
        dropped.len()
    }

    pub fn renew(&self, equipment: &EquipmentId, session: &SessionId, ttl: Duration) -> Result<LeaseInfo, BenchError> {
        self.renew_at(equipment, session, ttl, Instant::now())
    }

    /// Extend `session`'s own exclusive lease to `now + ttl`.
    ///
    /// # Errors
    ///
    /// [`BenchError::LockExpired`] if the session's lease already ran out,
    /// [`BenchError::NotHolder`] if it never held the lease.
    pub fn renew_at(
        &self,
        equipment: &EquipmentId,
        session: &SessionId,
        ttl: Duration,
        now: Instant,
    ) -> Result<LeaseInfo, BenchError> {
        let record = self.record(equipment);
        let mut record = record.lock();
        record.reap(equipment, now);

        match record.exclusive.as_mut() {
            Some(lease) if &lease.session == session => {
                lease.extend(ttl, now);
                let info = lease.info(equipment, LockMode::Exclusive);
                record.log(equipment, Some(session.clone()), LockMode::Exclusive, LockEventKind::Renewed);
                Ok(info)
            }
            _ => Err(record.missing_lease_error(equipment, session)),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn check_exclusive(&self, equipment: &EquipmentId, session: &SessionId) -> Result<(), BenchError> {
        self.check_exclusive_at(equipment, session, Instant::now())
    }

    /// Verify `session` holds a live exclusive lease on `equipment`.
    ///
    /// # Errors
    ///
    /// [`BenchError::LockConflict`] when another session holds it,
    /// [`BenchError::LockExpired`] when the caller's own lease ran out, and
    /// [`BenchError::NotHolder`] otherwise.
    pub fn check_exclusive_at(&self, equipment: &EquipmentId, session: &SessionId, now: Instant) -> Result<(), BenchError> {
        let record = self.record(equipment);
        let mut record = record.lock();
        record.reap(equipment, now);
        match &record.exclusive {
            Some(lease) if &lease.session == session => Ok(()),
            Some(lease) => Err(BenchError::LockConflict {
                equipment: equipment.clone(),
                holder: lease.session.clone(),
            }),
            None => Err(record.missing_lease_error(equipment, session)),
        }
    }

    /// Live exclusive holder of `equipment`, if any.
    pub fn exclusive_holder(&self, equipment: &EquipmentId) -> Option<SessionId> {
        self.exclusive_holder_at(equipment, Instant::now())
    }

    pub fn exclusive_holder_at(&self, equipment: &EquipmentId, now: Instant) -> Option<SessionId> {
        let record = self.existing(equipment)?;
        let mut record = record.lock();
        record.reap(equipment, now);
        record.exclusive.as_ref().map(|l| l.session.clone())
    }

    pub fn snapshot(&self, equipment: &EquipmentId) -> LockSnapshot {
        self.snapshot_at(equipment, Instant::now())
    }

    pub fn snapshot_at(&self, equipment: &EquipmentId, now: Instant) -> LockSnapshot {
        match self.existing(equipment) {
            Some(record) => {
                let mut record = record.lock();
                record.reap(equipment, now);
                record.snapshot(equipment)
            }
            None => LockRecord::default().snapshot(equipment),
        }
    }

    /// Snapshots of every equipment that has ever been locked, sorted by id.
    pub fn snapshots(&self) -> Vec<LockSnapshot> {
        let now = Instant::now();
        self.all_records()
            .into_iter()
            .map(|(id, record)| {
                let mut record = record.lock();
                record.reap(&id, now);
                record.snapshot(&id)
            })
            .collect()
    }

    /// Audit trail for `equipment`, oldest first.  Only the most recent
    /// events up to the history limit are kept.
    pub fn lock_events(&self, equipment: &EquipmentId) -> Vec<LockEvent> {
        self.existing(equipment)
            .map(|r| r.lock().history.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    /// Reclaim every expired lease.  Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        self.all_records()
            .into_iter()
            .map(|(id, record)| record.lock().reap(&id, now))
            .sum()
    }

    /// Release every lease `session` holds.  Returns the affected equipment.
    pub fn release_all(&self, session: &SessionId) -> Vec<EquipmentId> {
        self.all_records()
            .into_iter()
            .filter(|(id, _)| self.release(id, session))
            .map(|(id, _)| id)
            .collect()
    }

    /// Tear down all lock state for `equipment`, e.g. on disconnect.  The
    /// record itself is kept so its audit trail survives.
    pub fn clear(&self, equipment: &EquipmentId) {
        let Some(record) = self.existing(equipment) else {
            return;
        };
        let mut record = record.lock();
        if let Some(lease) = record.exclusive.take() {
            record.log(equipment, Some(lease.session), LockMode::Exclusive, LockEventKind::Released);
        }
        for session in std::mem::take(&mut record.observers).into_keys() {
            record.log(equipment, Some(session), LockMode::Observer, LockEventKind::Released);
        }
        record.expired_holder = None;
    }
}

impl LockRecord {
    fn missing_lease_error(&self, equipment: &EquipmentId, session: &SessionId) -> BenchError {
        if self.expired_holder.as_ref() == Some(session) {
            BenchError::LockExpired {
                equipment: equipment.clone(),
                session: session.clone(),
            }
        } else {
            BenchError::NotHolder {
                equipment: equipment.clone(),
                session: session.clone(),
            }
        }
    }
}
