//! Pool state machine and least-loaded credential selection
//!
//! Each credential lives in its own `Slot`: the record, its runtime state and
//! an admission gate, guarded by a per-slot mutex that is never held across
//! an await. The map of slots is a `DashMap`, so work on one credential never
//! blocks another.
//!
//! State transitions:
//! - Valid → Refreshing (tokens lapsed or a forced refresh)
//! - Expired → Refreshing (acquire, background cycle or `refresh_now`)
//! - Refreshing → Valid / Expired (refresh outcome)
//! - Valid → Expired (auth failure reported, or tokens lapsed)
//! - any → Disabled (operator, or consecutive auth failures)
//! - Disabled → Valid / Expired / Refreshing (explicit `enable` only)
//!
//! A refresh runs in a detached task that owns a `watch` sender. Every caller
//! that needs the credential waits on a clone of the receiver, so a single
//! refresh serves all of them and cancelling a caller only cancels its wait.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::Secret;
use common::time::now_millis;
use dashmap::DashMap;
use flow_auth::{Credential, CredentialRecordStore, SessionGrant, TokenPair};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionGate, AdmissionPermit};
use crate::error::{Error, Result};
use crate::metrics;
use crate::outcome::Outcome;
use crate::refresher::{ReauthRefresher, RefreshError, RefreshKind, SessionRefresher};
use crate::validator::{Classification, classify, classify_with_margin};

type RefreshResult = std::result::Result<(), RefreshError>;
type RefreshSignal = watch::Receiver<Option<RefreshResult>>;

/// Runtime state of a pool credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Valid,
    Refreshing,
    Expired,
    Disabled,
}

impl CredentialState {
    /// State label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Valid => "valid",
            CredentialState::Refreshing => "refreshing",
            CredentialState::Expired => "expired",
            CredentialState::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Admission limit for credentials without their own `max_concurrency`
    pub max_concurrency: u32,
    /// Consecutive auth failures that disable a credential
    pub auth_failure_threshold: u32,
    /// How long a caller waits on another caller's refresh. Keep it above
    /// the re-authentication bound or callers give up on browser repairs.
    pub wait_timeout: Duration,
    /// Bound on one silent session exchange
    pub refresh_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            auth_failure_threshold: 3,
            wait_timeout: Duration::from_secs(150),
            refresh_timeout: Duration::from_secs(30),
        }
    }
}

/// Caller preferences for one acquisition.
#[derive(Debug, Clone, Default)]
pub struct SelectionHint {
    /// Try this credential first when it is admissible
    pub prefer: Option<String>,
    /// Never select these
    pub exclude: HashSet<String>,
}

impl SelectionHint {
    pub fn prefer(id: impl Into<String>) -> Self {
        Self {
            prefer: Some(id.into()),
            exclude: HashSet::new(),
        }
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude.insert(id.into());
        self
    }
}

/// An admitted credential. Holds one admission slot until released or
/// dropped.
#[derive(Debug)]
pub struct CredentialHandle {
    id: String,
    access_token: Secret<String>,
    session_token: Secret<String>,
    project_id: Option<String>,
    generation: u64,
    _permit: AdmissionPermit,
}

impl CredentialHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_token(&self) -> &Secret<String> {
        &self.access_token
    }

    pub fn session_token(&self) -> &Secret<String> {
        &self.session_token
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Token generation the handle was issued with
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Observability view of one credential. Never carries token values.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub state: CredentialState,
    pub classification: Classification,
    pub in_flight: u32,
    pub max_concurrency: u32,
    pub consecutive_failures: u32,
    pub access_invalidated: bool,
    pub session_expires_at: u64,
    pub access_expires_at: Option<u64>,
    pub last_refreshed_at: Option<u64>,
    pub last_used_at: Option<u64>,
    pub last_attempted_at: Option<u64>,
    pub last_error: Option<String>,
}

struct SlotState {
    record: Credential,
    status: CredentialState,
    /// In-flight refresh, tracked apart from `status` so a credential
    /// disabled mid-refresh still has exactly one refresh
    pending: Option<RefreshSignal>,
    last_used_at: Option<u64>,
    last_attempted_at: Option<u64>,
    last_error: Option<String>,
    /// Bumped on every token replacement
    generation: u64,
    /// Set when the slot leaves the pool so a late refresh does not write the
    /// record back
    removed: bool,
}

impl SlotState {
    /// Derive `status` from the record and the pending refresh.
    fn settle(&mut self, now: u64) {
        self.status = if self.record.disabled {
            CredentialState::Disabled
        } else if self.pending.is_some() {
            CredentialState::Refreshing
        } else if classify(&self.record, now) == Classification::Valid {
            CredentialState::Valid
        } else {
            CredentialState::Expired
        };
    }
}

struct Slot {
    id: String,
    gate: Arc<AdmissionGate>,
    state: Mutex<SlotState>,
    /// Held across snapshot and save so store writes land in order
    persist: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new(record: Credential, limit: u32, now: u64) -> Arc<Self> {
        let mut state = SlotState {
            record,
            status: CredentialState::Expired,
            pending: None,
            last_used_at: None,
            last_attempted_at: None,
            last_error: None,
            generation: 0,
            removed: false,
        };
        state.settle(now);
        Arc::new(Self {
            id: state.record.id.clone(),
            gate: AdmissionGate::new(limit),
            state: Mutex::new(state),
            persist: tokio::sync::Mutex::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the current record to the store.
    ///
    /// The record is cloned after taking `persist`, so the last write for a
    /// credential always carries its latest record. Removed slots are skipped.
    async fn persist(&self, store: &dyn CredentialRecordStore) -> flow_auth::Result<()> {
        let _write = self.persist.lock().await;
        let record = {
            let st = self.lock();
            if st.removed {
                return Ok(());
            }
            st.record.clone()
        };
        store.save(&record).await
    }
}

enum Candidate {
    /// Valid and below its limit
    Ready(Arc<Slot>),
    /// Needs a refresh, or has one in flight
    Repair(Arc<Slot>),
}

enum TokenUpdate {
    Session(SessionGrant),
    Pair(TokenPair),
}

/// Everything a detached refresh task needs.
struct RefreshJob {
    slot: Arc<Slot>,
    kind: RefreshKind,
    snapshot: Credential,
    store: Arc<dyn CredentialRecordStore>,
    session: Arc<dyn SessionRefresher>,
    reauth: Arc<dyn ReauthRefresher>,
    refresh_timeout: Duration,
}

/// Credential pool.
///
/// Owned by the application and shared via `Arc`. The store is the source
/// of truth: every token change is written back before waiters are woken.
pub struct Pool {
    slots: DashMap<String, Arc<Slot>>,
    store: Arc<dyn CredentialRecordStore>,
    session_refresher: Arc<dyn SessionRefresher>,
    reauth_refresher: Arc<dyn ReauthRefresher>,
    config: PoolConfig,
}

impl Pool {
    /// Create an empty pool. Call [`load`](Self::load) to populate it from
    /// the store.
    pub fn new(
        store: Arc<dyn CredentialRecordStore>,
        session_refresher: Arc<dyn SessionRefresher>,
        reauth_refresher: Arc<dyn ReauthRefresher>,
        config: PoolConfig,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            store,
            session_refresher,
            reauth_refresher,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Rebuild the pool from the store.
    ///
    /// Credentials missing from the store are dropped; existing slots keep
    /// their admission counters and any refresh in flight.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.load().await?;
        let now = now_millis();
        let ids: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        self.slots.retain(|id, slot| {
            let keep = ids.contains(id);
            if !keep {
                slot.lock().removed = true;
            }
            keep
        });
        let count = records.len();
        for record in records {
            self.upsert(record, now);
        }
        info!(credentials = count, "pool loaded from store");
        Ok(count)
    }

    /// Add or replace a credential, persisting it first.
    pub async fn register(&self, credential: Credential) -> Result<()> {
        if credential.id.is_empty() {
            return Err(Error::Store("credential id must not be empty".into()));
        }
        let existing = self.slots.get(&credential.id).map(|entry| entry.value().clone());
        let _write = match &existing {
            Some(slot) => Some(slot.persist.lock().await),
            None => None,
        };
        self.store.save(&credential).await?;
        let id = credential.id.clone();
        self.upsert(credential, now_millis());
        info!(credential_id = %id, "credential registered");
        Ok(())
    }

    /// Remove a credential from the pool and the store.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let (_, slot) = self
            .slots
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        slot.lock().removed = true;
        let _write = slot.persist.lock().await;
        self.store.remove(id).await?;
        info!(credential_id = id, "credential deregistered");
        Ok(())
    }

    fn upsert(&self, record: Credential, now: u64) {
        let limit = record.max_concurrency.unwrap_or(self.config.max_concurrency);
        let existing = self.slots.get(&record.id).map(|entry| entry.value().clone());
        match existing {
            Some(slot) => {
                slot.gate.set_limit(limit);
                let mut st = slot.lock();
                if st.record.access_token != record.access_token
                    || st.record.session_token != record.session_token
                {
                    st.generation += 1;
                }
                st.record = record;
                st.removed = false;
                st.settle(now);
            }
            None => {
                let slot = Slot::new(record, limit, now);
                self.slots.insert(slot.id.clone(), slot);
            }
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Slot>> {
        self.slots
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn sorted_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots: Vec<Arc<Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots
    }

    /// Admit a credential for one request.
    ///
    /// Picks the Valid credential with the fewest requests in flight (ties:
    /// least recently used). When none is admissible, repairs expired
    /// credentials one at a time, cheapest first (ST-only before AT), least
    /// recently attempted first, joining any refresh already running.
    ///
    /// Returns `DisplayUnavailable` when a repair needed a browser and none
    /// exists, otherwise `PoolExhausted` with pool counts.
    pub async fn acquire(&self, hint: &SelectionHint) -> Result<CredentialHandle> {
        let mut attempted = hint.exclude.clone();
        let mut display_unavailable: Option<String> = None;
        let mut last_error: Option<String> = None;

        while let Some(candidate) = self.pick(&attempted, hint.prefer.as_deref(), now_millis()) {
            match candidate {
                Candidate::Ready(slot) => {
                    attempted.insert(slot.id.clone());
                    if let Some(handle) = self.try_admit(&slot) {
                        metrics::record_acquire("admitted");
                        return Ok(handle);
                    }
                }
                Candidate::Repair(slot) => {
                    attempted.insert(slot.id.clone());
                    let Some(signal) = self.begin_refresh(&slot, 0, false) else {
                        if let Some(handle) = self.try_admit(&slot) {
                            metrics::record_acquire("admitted");
                            return Ok(handle);
                        }
                        continue;
                    };
                    match self.wait_refresh(&slot.id, signal).await {
                        Ok(()) => {
                            if let Some(handle) = self.try_admit(&slot) {
                                metrics::record_acquire("admitted_after_refresh");
                                return Ok(handle);
                            }
                        }
                        Err(RefreshError::DisplayUnavailable(msg)) => {
                            display_unavailable = Some(msg);
                        }
                        Err(e) => {
                            debug!(credential_id = %slot.id, error = %e, "repair failed, trying next credential");
                            last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        if let Some(msg) = display_unavailable {
            metrics::record_acquire("display_unavailable");
            warn!(error = %msg, "no credential available and re-authentication needs a display");
            return Err(Error::DisplayUnavailable(msg));
        }
        metrics::record_acquire("pool_exhausted");
        Err(Error::PoolExhausted(self.exhausted_message(last_error)))
    }

    fn pick(&self, attempted: &HashSet<String>, prefer: Option<&str>, now: u64) -> Option<Candidate> {
        let mut ready: Option<((u32, u64, String), Arc<Slot>)> = None;
        let mut repair: Option<((u8, u64, String), Arc<Slot>)> = None;

        for slot in self.slots.iter().map(|e| e.value().clone()) {
            if attempted.contains(&slot.id) {
                continue;
            }
            let st = slot.lock();
            let classification = classify(&st.record, now);
            match st.status {
                CredentialState::Disabled => continue,
                CredentialState::Valid if classification == Classification::Valid => {
                    if !slot.gate.has_capacity() {
                        continue;
                    }
                    if prefer == Some(slot.id.as_str()) {
                        drop(st);
                        return Some(Candidate::Ready(slot));
                    }
                    let key = (
                        slot.gate.in_flight(),
                        st.last_used_at.unwrap_or(0),
                        slot.id.clone(),
                    );
                    drop(st);
                    if ready.as_ref().is_none_or(|(best, _)| key < *best) {
                        ready = Some((key, slot));
                    }
                }
                _ => {
                    let key = (
                        classification.repair_rank(),
                        st.last_attempted_at.unwrap_or(0),
                        slot.id.clone(),
                    );
                    drop(st);
                    if repair.as_ref().is_none_or(|(best, _)| key < *best) {
                        repair = Some((key, slot));
                    }
                }
            }
        }

        ready
            .map(|(_, slot)| Candidate::Ready(slot))
            .or_else(|| repair.map(|(_, slot)| Candidate::Repair(slot)))
    }

    fn try_admit(&self, slot: &Arc<Slot>) -> Option<CredentialHandle> {
        let now = now_millis();
        let mut st = slot.lock();
        if st.status != CredentialState::Valid {
            return None;
        }
        if classify(&st.record, now) != Classification::Valid {
            st.status = CredentialState::Expired;
            return None;
        }
        let permit = slot.gate.try_admit()?;
        st.last_used_at = Some(now);
        Some(CredentialHandle {
            id: slot.id.clone(),
            access_token: Secret::new(st.record.access_token.clone()),
            session_token: Secret::new(st.record.session_token.clone()),
            project_id: st.record.project_id.clone(),
            generation: st.generation,
            _permit: permit,
        })
    }

    /// Join the credential's refresh or start one.
    ///
    /// Returns `None` when there is nothing to do: the credential is
    /// disabled, or valid beyond `margin_ms` and not `force`d.
    fn begin_refresh(&self, slot: &Arc<Slot>, margin_ms: u64, force: bool) -> Option<RefreshSignal> {
        let now = now_millis();
        let mut st = slot.lock();
        if let Some(signal) = &st.pending {
            return Some(signal.clone());
        }
        if st.status == CredentialState::Disabled || st.removed {
            return None;
        }
        let kind = match classify_with_margin(&st.record, now, margin_ms) {
            Classification::Valid if force => RefreshKind::Session,
            Classification::Valid => return None,
            Classification::SessionExpired => RefreshKind::Session,
            Classification::AccessExpired | Classification::Unknown => RefreshKind::Reauth,
        };

        let (done, signal) = watch::channel(None);
        st.status = CredentialState::Refreshing;
        st.pending = Some(signal.clone());
        st.last_attempted_at = Some(now);
        let job = RefreshJob {
            slot: slot.clone(),
            kind,
            snapshot: st.record.clone(),
            store: self.store.clone(),
            session: self.session_refresher.clone(),
            reauth: self.reauth_refresher.clone(),
            refresh_timeout: self.config.refresh_timeout,
        };
        drop(st);

        info!(credential_id = %slot.id, kind = kind.label(), "refresh started");
        tokio::spawn(run_refresh(job, done));
        Some(signal)
    }

    async fn wait_refresh(&self, id: &str, mut signal: RefreshSignal) -> RefreshResult {
        let wait = self.config.wait_timeout;
        match tokio::time::timeout(wait, signal.wait_for(|v| v.is_some())).await {
            Ok(Ok(value)) => (*value).clone().unwrap_or_else(|| {
                Err(RefreshError::TokenExchange("refresh finished without a result".into()))
            }),
            Ok(Err(_)) => Err(RefreshError::TokenExchange(
                "refresh task ended without a result".into(),
            )),
            Err(_) => {
                debug!(credential_id = id, timeout_ms = wait.as_millis() as u64, "gave up waiting for refresh");
                Err(RefreshError::Timeout(wait))
            }
        }
    }

    /// Report how a request with `handle` went, releasing its admission slot.
    pub async fn release(&self, handle: CredentialHandle, outcome: Outcome) {
        metrics::record_release(outcome);
        let CredentialHandle {
            id,
            generation,
            _permit: permit,
            ..
        } = handle;
        drop(permit);

        let Ok(slot) = self.slot(&id) else {
            debug!(credential_id = %id, "released credential is no longer in the pool");
            return;
        };

        let dirty = {
            let now = now_millis();
            let mut st = slot.lock();
            match outcome {
                Outcome::OtherFailure => false,
                Outcome::Success => {
                    let reset = st.record.consecutive_failures != 0;
                    st.record.consecutive_failures = 0;
                    reset
                }
                Outcome::AuthFailure => {
                    st.record.consecutive_failures += 1;
                    let failures = st.record.consecutive_failures;
                    let threshold = self.config.auth_failure_threshold.max(1);
                    if failures >= threshold {
                        if !st.record.disabled {
                            warn!(credential_id = %id, failures, "credential disabled after consecutive auth failures");
                        }
                        st.record.disabled = true;
                    } else if generation == st.generation {
                        if classify(&st.record, now) != Classification::SessionExpired {
                            st.record.access_invalidated = true;
                        }
                        info!(credential_id = %id, failures, "auth failure, credential expired");
                    } else {
                        debug!(
                            credential_id = %id,
                            handle_generation = generation,
                            current_generation = st.generation,
                            "auth failure against replaced tokens"
                        );
                    }
                    st.settle(now);
                    true
                }
            }
        };

        if dirty {
            if let Err(e) = slot.persist(self.store.as_ref()).await {
                warn!(credential_id = %id, error = %e, "failed to persist credential after release");
            }
        }
    }

    /// Take a credential out of rotation until [`enable`](Self::enable).
    pub async fn disable(&self, id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        {
            let mut st = slot.lock();
            st.record.disabled = true;
            st.status = CredentialState::Disabled;
        }
        slot.persist(self.store.as_ref()).await?;
        warn!(credential_id = id, "credential disabled");
        Ok(())
    }

    /// Return a credential to rotation, resetting its failure count.
    pub async fn enable(&self, id: &str) -> Result<CredentialState> {
        let slot = self.slot(id)?;
        let state = {
            let mut st = slot.lock();
            st.record.disabled = false;
            st.record.consecutive_failures = 0;
            st.settle(now_millis());
            st.status
        };
        slot.persist(self.store.as_ref()).await?;
        info!(credential_id = id, state = state.label(), "credential enabled");
        Ok(state)
    }

    /// Refresh a credential now through the single-flight path, even when its
    /// tokens are still valid. Returns the resulting state.
    pub async fn refresh_now(&self, id: &str) -> Result<CredentialState> {
        let slot = self.slot(id)?;
        let Some(signal) = self.begin_refresh(&slot, 0, true) else {
            return Ok(slot.lock().status);
        };
        self.wait_refresh(id, signal).await?;
        Ok(slot.lock().status)
    }

    /// Refresh every credential whose tokens expire within `margin`.
    ///
    /// Returns how many refreshes succeeded.
    pub async fn refresh_expiring(&self, margin: Duration) -> usize {
        let margin_ms = margin.as_millis() as u64;
        let signals: Vec<(String, RefreshSignal)> = self
            .sorted_slots()
            .into_iter()
            .filter_map(|slot| {
                self.begin_refresh(&slot, margin_ms, false)
                    .map(|signal| (slot.id.clone(), signal))
            })
            .collect();

        let mut refreshed = 0;
        for (id, signal) in signals {
            match self.wait_refresh(&id, signal).await {
                Ok(()) => refreshed += 1,
                Err(e) => warn!(credential_id = %id, error = %e, "background refresh failed, will retry next cycle"),
            }
        }
        refreshed
    }

    /// Per-credential view, ordered by id.
    pub fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let now = now_millis();
        self.sorted_slots()
            .into_iter()
            .map(|slot| {
                let st = slot.lock();
                CredentialSnapshot {
                    id: slot.id.clone(),
                    state: st.status,
                    classification: classify(&st.record, now),
                    in_flight: slot.gate.in_flight(),
                    max_concurrency: slot.gate.limit(),
                    consecutive_failures: st.record.consecutive_failures,
                    access_invalidated: st.record.access_invalidated,
                    session_expires_at: st.record.session_expires_at,
                    access_expires_at: st.record.access_expires_at,
                    last_refreshed_at: st.record.last_refreshed_at,
                    last_used_at: st.last_used_at,
                    last_attempted_at: st.last_attempted_at,
                    last_error: st.last_error.clone(),
                }
            })
            .collect()
    }

    /// Pool health summary.
    ///
    /// Status mapping: all valid → healthy, some valid → degraded, none
    /// valid → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let snapshot = self.snapshot();
        let counts = StateCounts::of(&snapshot);
        let total = snapshot.len();
        let pool_status = if counts.valid == total && total > 0 {
            "healthy"
        } else if counts.valid > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let credentials: Vec<serde_json::Value> = snapshot
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "state": c.state.label(),
                    "in_flight": c.in_flight,
                    "max_concurrency": c.max_concurrency,
                    "consecutive_failures": c.consecutive_failures,
                    "last_error": c.last_error,
                })
            })
            .collect();

        serde_json::json!({
            "status": pool_status,
            "credentials_total": total,
            "credentials_valid": counts.valid,
            "credentials_refreshing": counts.refreshing,
            "credentials_expired": counts.expired,
            "credentials_disabled": counts.disabled,
            "credentials": credentials
        })
    }

    fn exhausted_message(&self, last_error: Option<String>) -> String {
        let snapshot = self.snapshot();
        let counts = StateCounts::of(&snapshot);
        let saturated = snapshot
            .iter()
            .filter(|c| c.state == CredentialState::Valid && c.in_flight >= c.max_concurrency)
            .count();
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "No credential available",
                "last_error": last_error,
                "pool": {
                    "credentials_total": snapshot.len(),
                    "credentials_valid": counts.valid,
                    "credentials_saturated": saturated,
                    "credentials_refreshing": counts.refreshing,
                    "credentials_expired": counts.expired,
                    "credentials_disabled": counts.disabled
                }
            }
        })
        .to_string()
    }
}

#[derive(Default)]
struct StateCounts {
    valid: usize,
    refreshing: usize,
    expired: usize,
    disabled: usize,
}

impl StateCounts {
    fn of(snapshot: &[CredentialSnapshot]) -> Self {
        let mut counts = Self::default();
        for c in snapshot {
            match c.state {
                CredentialState::Valid => counts.valid += 1,
                CredentialState::Refreshing => counts.refreshing += 1,
                CredentialState::Expired => counts.expired += 1,
                CredentialState::Disabled => counts.disabled += 1,
            }
        }
        counts
    }
}

/// Run the refresher in its own task so a panic inside it surfaces as a
/// failed refresh instead of taking the bookkeeping down with it.
async fn call_refresher(job: &RefreshJob) -> std::result::Result<TokenUpdate, RefreshError> {
    let kind = job.kind;
    let session = job.session.clone();
    let reauth = job.reauth.clone();
    let snapshot = job.snapshot.clone();
    let task = tokio::spawn(async move {
        match kind {
            RefreshKind::Session => session.exchange(&snapshot).await.map(TokenUpdate::Session),
            RefreshKind::Reauth => reauth.reauthenticate(&snapshot).await.map(TokenUpdate::Pair),
        }
    });
    let abort = task.abort_handle();

    let joined = match kind {
        RefreshKind::Session => match tokio::time::timeout(job.refresh_timeout, task).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(RefreshError::Timeout(job.refresh_timeout));
            }
        },
        // Bounded by the captcha refresher's own timeout
        RefreshKind::Reauth => task.await,
    };
    joined.unwrap_or_else(|e| {
        Err(RefreshError::TokenExchange(format!(
            "{} refresher failed: {e}",
            kind.label()
        )))
    })
}

/// Body of the detached refresh task.
///
/// Order matters: tokens are installed, the record is persisted, the state
/// is settled, and only then are waiters woken.
async fn run_refresh(job: RefreshJob, done: watch::Sender<Option<RefreshResult>>) {
    let started = Instant::now();
    let id = job.slot.id.clone();

    let outcome = call_refresher(&job).await;
    let elapsed = started.elapsed();
    metrics::record_refresh(job.kind, outcome.is_ok(), elapsed.as_secs_f64());

    let now = now_millis();
    let (dirty, result) = {
        let mut st = job.slot.lock();
        match outcome {
            Ok(update) => {
                match &update {
                    TokenUpdate::Session(grant) => st.record.install_session(grant, now),
                    TokenUpdate::Pair(pair) => st.record.install_pair(pair, now),
                }
                st.generation += 1;
                st.last_error = None;
                (true, Ok(()))
            }
            Err(e) => {
                st.last_error = Some(e.to_string());
                // A failed exchange means the AT itself is suspect; the next
                // attempt goes through re-authentication.
                let escalate = job.kind == RefreshKind::Session && !st.record.access_invalidated;
                if escalate {
                    st.record.access_invalidated = true;
                }
                (escalate, Err(e))
            }
        }
    };

    if dirty {
        if let Err(e) = job.slot.persist(job.store.as_ref()).await {
            warn!(credential_id = %id, error = %e, "failed to persist refreshed credential");
        }
    }

    let state = {
        let mut st = job.slot.lock();
        st.pending = None;
        st.settle(now_millis());
        st.status
    };

    match &result {
        Ok(()) => info!(
            credential_id = %id,
            kind = job.kind.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            state = state.label(),
            "refresh succeeded"
        ),
        Err(e) => warn!(
            credential_id = %id,
            kind = job.kind.label(),
            error = %e,
            state = state.label(),
            "refresh failed"
        ),
    }
    done.send_replace(Some(result));
}
