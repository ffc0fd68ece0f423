//! Change Sync Engine: per-client mirrors of server-held collections.
//!
//! Each observer owns a [`MirrorHandle`]: a keyed local copy of patients
//! or lab results, seeded by one full fetch and kept current by a pump
//! task draining the store's change feed. There is no shared mutable
//! collection anywhere; a mirror lives and dies with its handle.
//!
//! Reconciliation (a full re-fetch swapped in atomically) is triggered by
//! detected inconsistency only: a lagged feed, a closed subscription, or
//! an expired heartbeat watchdog. There is no timer-driven polling.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::CoreError;
use crate::models::{ChangeBody, ChangeEvent, LabResult, LabResultId, Patient, PatientId};
use crate::store::{EntityStore, ScopeFilter, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorHealth {
    /// Feed healthy, mirror current.
    Live,
    /// Inconsistency detected, reconciliation underway.
    Stale,
    /// Retry budget exhausted; data may be out of date.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub reconcile_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Watchdog for feeds that are expected to carry heartbeats. Stays
    /// unset for the in-process feed, which has none; turning it on there
    /// would reintroduce polling through the back door.
    pub idle_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconcile_retries: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

impl From<&SyncSettings> for SyncConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            reconcile_retries: settings.reconcile_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            idle_timeout: settings.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// An entity type the sync engine can mirror.
#[async_trait]
pub trait Mirrored: Clone + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Send + Sync + fmt::Debug;

    fn entity_id(&self) -> Self::Id;

    /// Translate a feed event into a mirror operation, honoring the
    /// observer's scope. Deletions carry no snapshot, so they pass the
    /// filter unconditionally; removing an entity we never held is a no-op.
    fn from_change(event: &ChangeEvent, filter: &ScopeFilter) -> Option<MirrorOp<Self>>;

    async fn fetch_all(
        store: &dyn EntityStore,
        filter: &ScopeFilter,
    ) -> Result<Vec<Self>, StoreError>;
}

pub enum MirrorOp<T: Mirrored> {
    Upsert(T),
    Remove(T::Id),
}

#[async_trait]
impl Mirrored for Patient {
    type Id = PatientId;

    fn entity_id(&self) -> PatientId {
        self.id.clone()
    }

    fn from_change(event: &ChangeEvent, filter: &ScopeFilter) -> Option<MirrorOp<Self>> {
        match &event.body {
            ChangeBody::PatientInserted(p) | ChangeBody::PatientUpdated(p) => filter
                .admits(&p.practice_code)
                .then(|| MirrorOp::Upsert(p.clone())),
            ChangeBody::PatientDeleted(id) => Some(MirrorOp::Remove(id.clone())),
            _ => None,
        }
    }

    async fn fetch_all(
        store: &dyn EntityStore,
        filter: &ScopeFilter,
    ) -> Result<Vec<Self>, StoreError> {
        store.fetch_patients(filter).await
    }
}

#[async_trait]
impl Mirrored for LabResult {
    type Id = LabResultId;

    fn entity_id(&self) -> LabResultId {
        self.id.clone()
    }

    fn from_change(event: &ChangeEvent, filter: &ScopeFilter) -> Option<MirrorOp<Self>> {
        match &event.body {
            ChangeBody::LabResultInserted(r) | ChangeBody::LabResultUpdated(r) => filter
                .admits(&r.practice_code)
                .then(|| MirrorOp::Upsert(r.clone())),
            ChangeBody::LabResultDeleted(id) => Some(MirrorOp::Remove(id.clone())),
            _ => None,
        }
    }

    async fn fetch_all(
        store: &dyn EntityStore,
        filter: &ScopeFilter,
    ) -> Result<Vec<Self>, StoreError> {
        store.fetch_lab_results(filter).await
    }
}

#[derive(Debug)]
struct MirrorState<T: Mirrored> {
    entries: HashMap<T::Id, T>,
    /// Optimistic writes awaiting their server-confirmed event.
    pending: HashSet<T::Id>,
    /// Last confirmed snapshot for each pending id, for rollback.
    prior: HashMap<T::Id, Option<T>>,
    health: MirrorHealth,
    /// Events older than this were superseded by a full fetch.
    reconciled_at: DateTime<Utc>,
}

impl<T: Mirrored> MirrorState<T> {
    fn seeded(initial: Vec<T>, watermark: DateTime<Utc>) -> Self {
        Self {
            entries: initial
                .into_iter()
                .map(|entity| (entity.entity_id(), entity))
                .collect(),
            pending: HashSet::new(),
            prior: HashMap::new(),
            health: MirrorHealth::Live,
            reconciled_at: watermark,
        }
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn EntityStore>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        self.store.clone()
    }

    pub async fn observe_patients(
        &self,
        filter: ScopeFilter,
    ) -> Result<MirrorHandle<Patient>, CoreError> {
        self.observe(filter).await
    }

    pub async fn observe_lab_results(
        &self,
        filter: ScopeFilter,
    ) -> Result<MirrorHandle<LabResult>, CoreError> {
        self.observe(filter).await
    }

    async fn observe<T: Mirrored>(
        &self,
        filter: ScopeFilter,
    ) -> Result<MirrorHandle<T>, CoreError> {
        // Subscribe before the snapshot fetch: events raced by the fetch
        // are buffered and re-applied, which upserts are safe under.
        let rx = self.store.subscribe();
        let watermark = Utc::now();
        let initial = T::fetch_all(&*self.store, &filter).await?;
        info!(count = initial.len(), "mirror seeded");

        let state = Arc::new(RwLock::new(MirrorState::seeded(initial, watermark)));
        let pump = tokio::spawn(pump_loop::<T>(
            self.store.clone(),
            filter.clone(),
            state.clone(),
            rx,
            self.config.clone(),
        ));

        Ok(MirrorHandle {
            state,
            filter,
            pump,
        })
    }
}

/// Live view over one observer's mirror. Dropping the handle tears the
/// subscription down with no server-side effects.
#[derive(Debug)]
pub struct MirrorHandle<T: Mirrored> {
    state: Arc<RwLock<MirrorState<T>>>,
    filter: ScopeFilter,
    pump: JoinHandle<()>,
}

impl<T: Mirrored> MirrorHandle<T> {
    pub fn filter(&self) -> &ScopeFilter {
        &self.filter
    }

    pub async fn snapshot(&self) -> Vec<T> {
        self.state.read().await.entries.values().cloned().collect()
    }

    pub async fn get(&self, id: &T::Id) -> Option<T> {
        self.state.read().await.entries.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn health(&self) -> MirrorHealth {
        self.state.read().await.health
    }

    pub async fn is_pending(&self, id: &T::Id) -> bool {
        self.state.read().await.pending.contains(id)
    }

    /// Stage an optimistic local write ahead of the server round trip.
    /// The matching confirmed event (or [`apply_confirmed`]) clears the
    /// pending mark; [`rollback`] restores the last confirmed snapshot.
    ///
    /// [`apply_confirmed`]: MirrorHandle::apply_confirmed
    /// [`rollback`]: MirrorHandle::rollback
    pub async fn stage(&self, entity: T) {
        let id = entity.entity_id();
        let mut state = self.state.write().await;
        if !state.pending.contains(&id) {
            let confirmed = state.entries.get(&id).cloned();
            state.prior.insert(id.clone(), confirmed);
        }
        state.pending.insert(id.clone());
        state.entries.insert(id, entity);
    }

    /// Undo a staged write after the server rejected it.
    pub async fn rollback(&self, id: &T::Id) {
        let mut state = self.state.write().await;
        if let Some(confirmed) = state.prior.remove(id) {
            match confirmed {
                Some(entity) => {
                    state.entries.insert(id.clone(), entity);
                }
                None => {
                    state.entries.remove(id);
                }
            }
        }
        state.pending.remove(id);
    }

    /// Record a server-confirmed snapshot without waiting for its feed
    /// echo; the echo then lands on identical state.
    pub async fn apply_confirmed(&self, entity: T) {
        let id = entity.entity_id();
        let mut state = self.state.write().await;
        state.pending.remove(&id);
        state.prior.remove(&id);
        state.entries.insert(id, entity);
    }

    /// Explicit teardown; equivalent to dropping the handle. Abandoned
    /// optimistic writes are discarded with the mirror.
    pub fn unsubscribe(self) {}
}

impl<T: Mirrored> Drop for MirrorHandle<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_loop<T: Mirrored>(
    store: Arc<dyn EntityStore>,
    filter: ScopeFilter,
    state: Arc<RwLock<MirrorState<T>>>,
    mut rx: broadcast::Receiver<ChangeEvent>,
    config: SyncConfig,
) {
    loop {
        let received = match config.idle_timeout {
            Some(limit) => match timeout(limit, rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(?limit, "change feed went quiet, resubscribing");
                    mark_stale(&state).await;
                    rx = recover::<T>(&store, &filter, &state, &config).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match received {
            Ok(event) => apply::<T>(&state, &filter, &event).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "change feed lagged, reconciling");
                mark_stale(&state).await;
                // The receiver skips to the oldest retained event; a full
                // re-fetch covers the gap.
                reconcile::<T>(&store, &filter, &state, &config).await;
            }
            Err(RecvError::Closed) => {
                warn!("change feed closed, resubscribing");
                mark_stale(&state).await;
                rx = recover::<T>(&store, &filter, &state, &config).await;
            }
        }
    }
}

async fn apply<T: Mirrored>(
    state: &Arc<RwLock<MirrorState<T>>>,
    filter: &ScopeFilter,
    event: &ChangeEvent,
) {
    let Some(op) = T::from_change(event, filter) else {
        return;
    };
    let mut state = state.write().await;
    match op {
        MirrorOp::Upsert(entity) => {
            if event.occurred_at < state.reconciled_at {
                debug!(seq = event.seq, "discarding event superseded by reconciliation");
                return;
            }
            let id = entity.entity_id();
            // An id already present as a pending optimistic write is
            // confirmed in place, never duplicated.
            state.pending.remove(&id);
            state.prior.remove(&id);
            state.entries.insert(id, entity);
        }
        MirrorOp::Remove(id) => {
            state.entries.remove(&id);
            state.pending.remove(&id);
            state.prior.remove(&id);
        }
    }
}

async fn mark_stale<T: Mirrored>(state: &Arc<RwLock<MirrorState<T>>>) {
    let mut state = state.write().await;
    if state.health == MirrorHealth::Live {
        state.health = MirrorHealth::Stale;
    }
}

/// Full re-fetch, atomically swapped in under the write lock. Staged
/// optimistic entries the server has not confirmed yet survive the swap.
/// Returns false once the retry budget is spent, leaving the mirror
/// `Degraded`.
async fn reconcile<T: Mirrored>(
    store: &Arc<dyn EntityStore>,
    filter: &ScopeFilter,
    state: &Arc<RwLock<MirrorState<T>>>,
    config: &SyncConfig,
) -> bool {
    for attempt in 0..config.reconcile_retries {
        let watermark = Utc::now();
        match T::fetch_all(&**store, filter).await {
            Ok(fresh) => {
                let mut state = state.write().await;
                let mut entries: HashMap<T::Id, T> = fresh
                    .into_iter()
                    .map(|entity| (entity.entity_id(), entity))
                    .collect();
                for id in &state.pending {
                    if !entries.contains_key(id) {
                        if let Some(staged) = state.entries.get(id) {
                            entries.insert(id.clone(), staged.clone());
                        }
                    }
                }
                state.entries = entries;
                state.reconciled_at = watermark;
                state.health = MirrorHealth::Live;
                info!(count = state.entries.len(), "mirror reconciled");
                return true;
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconciliation fetch failed");
                sleep(backoff_delay(config, attempt)).await;
            }
        }
    }
    state.write().await.health = MirrorHealth::Degraded;
    warn!("reconciliation budget exhausted, mirror degraded");
    false
}

/// Resubscribe until a fresh feed plus reconciliation succeeds. Once the
/// budget is spent the mirror reads `Degraded`, but recovery keeps trying
/// at the capped interval so the mirror heals when the store returns.
async fn recover<T: Mirrored>(
    store: &Arc<dyn EntityStore>,
    filter: &ScopeFilter,
    state: &Arc<RwLock<MirrorState<T>>>,
    config: &SyncConfig,
) -> broadcast::Receiver<ChangeEvent> {
    let mut attempt: u32 = 0;
    loop {
        let rx = store.subscribe();
        if reconcile::<T>(store, filter, state, config).await {
            return rx;
        }
        attempt = attempt.saturating_add(1);
        sleep(backoff_delay(config, attempt)).await;
    }
}

fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let exponential = config
        .backoff_base
        .saturating_mul(1u32 << attempt.min(10))
        .min(config.backoff_max);
    let jitter_ceiling = (exponential.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    exponential + Duration::from_millis(jitter)
}
