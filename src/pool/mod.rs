mod state;

pub use state::{
    derive_identifier, BackoffPolicy, KeyPhase, KeyState, KeyStatus, LeaseOutcome,
    ReturnClassification,
};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::config::GatewayConfig;
use crate::store::{now_epoch, KeyRecord, Store, StoreError};
use crate::task::AbortOnDrop;

#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub backoff: BackoffPolicy,
    pub acquire_timeout: Duration,
    pub stuck_timeout_seconds: u64,
    pub sweep_interval: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            backoff: BackoffPolicy {
                base_cooldown_seconds: config.base_cooldown_seconds,
                max_cooldown_seconds: config.max_cooldown_seconds,
                failure_threshold: config.failure_threshold,
            },
            acquire_timeout: config.acquire_timeout(),
            stuck_timeout_seconds: config.stuck_timeout_seconds,
            sweep_interval: config.sweep_interval(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("key is currently leased: {0}")]
    KeyBusy(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no upstream key available")]
    NoKeyAvailable,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Serialize)]
pub struct PoolStatusReport {
    pub keys: Vec<KeyStatus>,
    pub total: usize,
    pub active: usize,
    pub cooling_down: usize,
    pub in_use: usize,
}

struct LeaseGrant {
    identifier: String,
    secret: String,
    brief: String,
    leased_at: f64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<LeaseGrant>,
}

struct PoolInner {
    keys: Vec<KeyState>,
    cursor: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// In-process authority over the upstream credential pool. All state
/// transitions run under one lock and are mirrored to the store before
/// the caller is acknowledged.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<Mutex<PoolInner>>,
    store: Store,
    settings: Arc<PoolSettings>,
}

impl KeyPool {
    /// Rehydrates the pool from the store. Leased rows belong to a dead
    /// process and are reclaimed; expired cooldowns map to active.
    pub async fn load(store: Store, settings: PoolSettings) -> Result<Self, StoreError> {
        let now = now_epoch();
        let records = store.load_all_keys().await?;
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let state = KeyState::from_record(record.clone(), now);
            let coerced = state.to_record();
            if coerced != record {
                store.upsert_key(coerced).await?;
            }
            keys.push(state);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner {
                keys,
                cursor: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
            store,
            settings: Arc::new(settings),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires an active key, waiting up to the configured timeout with
    /// FIFO ordering among waiters.
    pub async fn acquire(&self) -> Result<KeyLease, AcquireError> {
        let now = now_epoch();
        enum Got {
            Grant(LeaseGrant, KeyRecord),
            Wait(oneshot::Receiver<LeaseGrant>, u64),
        }

        let got = {
            let mut inner = self.lock();
            // Earlier waiters keep their place in line even when a key has
            // just become available.
            let selected = if inner.waiters.is_empty() {
                try_select(&mut inner, None, now)
            } else {
                None
            };
            match selected {
                Some((grant, record)) => Got::Grant(grant, record),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let id = inner.next_waiter_id;
                    inner.next_waiter_id += 1;
                    inner.waiters.push_back(Waiter { id, tx });
                    Got::Wait(rx, id)
                }
            }
        };

        match got {
            Got::Grant(grant, record) => {
                if let Err(err) = self.store.upsert_key(record).await {
                    self.unlease(&grant.identifier);
                    return Err(err.into());
                }
                Ok(self.lease_from(grant))
            }
            Got::Wait(mut rx, id) => {
                match tokio::time::timeout(self.settings.acquire_timeout, &mut rx).await {
                    Ok(Ok(grant)) => Ok(self.lease_from(grant)),
                    Ok(Err(_)) => Err(AcquireError::NoKeyAvailable),
                    Err(_elapsed) => {
                        {
                            let mut inner = self.lock();
                            inner.waiters.retain(|waiter| waiter.id != id);
                        }
                        // A grant may have raced the timeout; do not leak it.
                        match rx.try_recv() {
                            Ok(grant) => Ok(self.lease_from(grant)),
                            Err(_) => Err(AcquireError::NoKeyAvailable),
                        }
                    }
                }
            }
        }
    }

    /// Immediate acquisition of a key other than `exclude`; used by the
    /// single pre-byte retry. Does not wait.
    pub async fn try_acquire_excluding(&self, exclude: &str) -> Result<KeyLease, AcquireError> {
        let now = now_epoch();
        let selected = {
            let mut inner = self.lock();
            try_select(&mut inner, Some(exclude), now)
        };
        let Some((grant, record)) = selected else {
            return Err(AcquireError::NoKeyAvailable);
        };
        if let Err(err) = self.store.upsert_key(record).await {
            self.unlease(&grant.identifier);
            return Err(err.into());
        }
        Ok(self.lease_from(grant))
    }

    fn lease_from(&self, grant: LeaseGrant) -> KeyLease {
        KeyLease {
            pool: self.clone(),
            identifier: grant.identifier,
            secret: grant.secret,
            brief: grant.brief,
            leased_at: grant.leased_at,
            armed: true,
        }
    }

    /// Reverts an in-memory lease after a persistence failure, without
    /// touching the failure counters.
    fn unlease(&self, identifier: &str) {
        let mut inner = self.lock();
        if let Some(key) = inner
            .keys
            .iter_mut()
            .find(|key| key.identifier == identifier)
        {
            key.phase = KeyPhase::Active;
            key.in_use_since = None;
        }
    }

    async fn return_lease(&self, identifier: &str, leased_at: f64, outcome: LeaseOutcome) {
        let now = now_epoch();
        let backoff = self.settings.backoff;
        let record = {
            let mut inner = self.lock();
            let Some(key) = inner
                .keys
                .iter_mut()
                .find(|key| key.identifier == identifier)
            else {
                warn!(identifier, "returned lease for a key no longer in the pool");
                return;
            };
            if key.phase != KeyPhase::Leased || key.in_use_since != Some(leased_at) {
                // The sweeper already reclaimed this lease.
                warn!(identifier, "stale lease return ignored");
                return;
            }
            match &outcome {
                LeaseOutcome::Success => key.note_success(),
                LeaseOutcome::Failure(classification) => {
                    key.note_failure(classification, &backoff, now);
                }
            }
            key.to_record()
        };

        if let Err(err) = self.store.upsert_key(record).await {
            // The in-memory lease is released regardless; park the key in
            // cooldown so a possibly-broken credential is not hammered
            // while the store is unhealthy.
            error!(identifier, %err, "failed to persist key return");
            let fallback = {
                let mut inner = self.lock();
                inner
                    .keys
                    .iter_mut()
                    .find(|key| key.identifier == identifier)
                    .map(|key| {
                        key.phase = KeyPhase::Cooling;
                        let seconds = key
                            .current_cooldown_seconds
                            .max(backoff.base_cooldown_seconds);
                        key.current_cooldown_seconds = seconds;
                        key.cooldown_until = Some(now + seconds as f64);
                        key.to_record()
                    })
            };
            if let Some(record) = fallback {
                if let Err(err) = self.store.upsert_key(record).await {
                    error!(identifier, %err, "failed to persist safety cooldown");
                }
            }
        }

        self.service_waiters().await;
    }

    /// Hands newly available keys to parked acquirers, oldest first.
    async fn service_waiters(&self) {
        loop {
            let now = now_epoch();
            let next = {
                let mut inner = self.lock();
                if inner.waiters.is_empty() {
                    return;
                }
                let Some((grant, record)) = try_select(&mut inner, None, now) else {
                    return;
                };
                let waiter = match inner.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        // No waiter after all; undo the tentative lease.
                        drop(inner);
                        self.unlease(&grant.identifier);
                        return;
                    }
                };
                (waiter, grant, record)
            };
            let (waiter, grant, record) = next;
            let identifier = grant.identifier.clone();

            if let Err(err) = self.store.upsert_key(record).await {
                error!(identifier, %err, "failed to persist waiter lease");
                self.unlease(&identifier);
                let mut inner = self.lock();
                inner.waiters.push_front(waiter);
                return;
            }
            if waiter.tx.send(grant).is_err() {
                // The waiter timed out in the meantime; put the key back.
                self.unlease(&identifier);
                let record = {
                    let inner = self.lock();
                    inner
                        .keys
                        .iter()
                        .find(|key| key.identifier == identifier)
                        .map(KeyState::to_record)
                };
                if let Some(record) = record {
                    if let Err(err) = self.store.upsert_key(record).await {
                        error!(identifier, %err, "failed to persist waiter revert");
                    }
                }
            }
        }
    }

    /// Registers a new upstream key. Re-adding an existing secret is a
    /// no-op that reports the existing identifier.
    pub async fn add_key(&self, secret: &str) -> Result<KeyStatus, PoolError> {
        let now = now_epoch();
        let state = KeyState::new(secret.to_string());
        {
            let mut inner = self.lock();
            if let Some(existing) = inner
                .keys
                .iter_mut()
                .find(|key| key.identifier == state.identifier)
            {
                existing.refresh(now);
                return Ok(existing.status(now));
            }
        }
        self.store.upsert_key(state.to_record()).await?;
        let status = {
            let mut inner = self.lock();
            if !inner
                .keys
                .iter()
                .any(|key| key.identifier == state.identifier)
            {
                inner.keys.push(state.clone());
            }
            state.status(now)
        };
        self.service_waiters().await;
        Ok(status)
    }

    /// Removes a key. Rejected while the key is leased.
    pub async fn delete_key(&self, identifier: &str) -> Result<(), PoolError> {
        let removed = {
            let mut inner = self.lock();
            let Some(idx) = inner
                .keys
                .iter()
                .position(|key| key.identifier == identifier)
            else {
                return Err(PoolError::UnknownKey(identifier.to_string()));
            };
            if inner.keys[idx].phase == KeyPhase::Leased {
                return Err(PoolError::KeyBusy(identifier.to_string()));
            }
            let removed = inner.keys.remove(idx);
            if idx < inner.cursor {
                inner.cursor -= 1;
            }
            if !inner.keys.is_empty() {
                inner.cursor %= inner.keys.len();
            } else {
                inner.cursor = 0;
            }
            removed
        };

        if let Err(err) = self.store.delete_key(identifier).await {
            // Keep memory and mirror consistent on failure.
            let mut inner = self.lock();
            inner.keys.push(removed);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn reset_key(&self, identifier: &str) -> Result<KeyStatus, PoolError> {
        let now = now_epoch();
        let (status, record) = {
            let mut inner = self.lock();
            let Some(key) = inner
                .keys
                .iter_mut()
                .find(|key| key.identifier == identifier)
            else {
                return Err(PoolError::UnknownKey(identifier.to_string()));
            };
            key.reset();
            (key.status(now), key.to_record())
        };
        self.store.upsert_key(record).await?;
        self.service_waiters().await;
        Ok(status)
    }

    pub async fn reset_all(&self) -> Result<usize, PoolError> {
        let records: Vec<KeyRecord> = {
            let mut inner = self.lock();
            inner
                .keys
                .iter_mut()
                .map(|key| {
                    key.reset();
                    key.to_record()
                })
                .collect()
        };
        let count = records.len();
        for record in records {
            self.store.upsert_key(record).await?;
        }
        self.service_waiters().await;
        Ok(count)
    }

    /// Consistent snapshot of every key plus aggregate totals. Cooldowns
    /// that expired are refreshed as part of the observation.
    pub fn status(&self) -> PoolStatusReport {
        let now = now_epoch();
        let mut inner = self.lock();
        let mut keys = Vec::with_capacity(inner.keys.len());
        let (mut active, mut cooling_down, mut in_use) = (0usize, 0usize, 0usize);
        for key in inner.keys.iter_mut() {
            key.refresh(now);
            match key.phase {
                KeyPhase::Active => active += 1,
                KeyPhase::Cooling => cooling_down += 1,
                KeyPhase::Leased => in_use += 1,
            }
            keys.push(key.status(now));
        }
        PoolStatusReport {
            total: keys.len(),
            active,
            cooling_down,
            in_use,
            keys,
        }
    }

    /// Reclaims leases whose holder never returned them. Runs from the
    /// background sweeper and from tests.
    pub async fn sweep_stuck_leases(&self) -> usize {
        let now = now_epoch();
        let stuck_after = self.settings.stuck_timeout_seconds as f64;
        let reclaimed: Vec<KeyRecord> = {
            let mut inner = self.lock();
            inner
                .keys
                .iter_mut()
                .filter(|key| {
                    key.phase == KeyPhase::Leased
                        && key
                            .in_use_since
                            .map_or(true, |since| since + stuck_after <= now)
                })
                .map(|key| {
                    warn!(
                        identifier = %key.identifier,
                        "reclaiming stuck lease"
                    );
                    key.phase = KeyPhase::Active;
                    key.failure_count = key.failure_count.saturating_add(1);
                    key.in_use_since = None;
                    key.to_record()
                })
                .collect()
        };
        let count = reclaimed.len();
        for record in reclaimed {
            if let Err(err) = self.store.upsert_key(record).await {
                error!(%err, "failed to persist stuck-lease reclaim");
            }
        }
        if count > 0 {
            self.service_waiters().await;
        }
        count
    }

    pub fn spawn_sweeper(&self) -> AbortOnDrop {
        let pool = self.clone();
        let interval = self.settings.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh boot
            // does not sweep before anything can be leased.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.sweep_stuck_leases().await;
                // Cooldowns expire lazily; wake parked acquirers that would
                // otherwise only be served by a lease return.
                pool.service_waiters().await;
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }
}

/// Round-robin selection starting at the ring cursor. Keys that leave
/// cooldown during this scan are only used when no other active key is
/// available, so a credential still accumulating a track record goes last.
fn try_select(
    inner: &mut PoolInner,
    exclude: Option<&str>,
    now: f64,
) -> Option<(LeaseGrant, KeyRecord)> {
    let len = inner.keys.len();
    if len == 0 {
        return None;
    }
    let start = inner.cursor;
    let mut fresh_candidate: Option<usize> = None;
    let mut picked: Option<usize> = None;

    for step in 0..len {
        let idx = (start + step) % len;
        if exclude.is_some_and(|excluded| inner.keys[idx].identifier == excluded) {
            continue;
        }
        let left_cooldown = inner.keys[idx].refresh(now);
        if inner.keys[idx].phase != KeyPhase::Active {
            continue;
        }
        if left_cooldown {
            fresh_candidate.get_or_insert(idx);
        } else {
            picked = Some(idx);
            break;
        }
    }

    let idx = picked.or(fresh_candidate)?;
    let key = &mut inner.keys[idx];
    key.lease(now);
    inner.cursor = (idx + 1) % len;
    Some((
        LeaseGrant {
            identifier: key.identifier.clone(),
            secret: key.secret.clone(),
            brief: key.brief.clone(),
            leased_at: now,
        },
        key.to_record(),
    ))
}

/// Scoped acquisition of an upstream key. Release it explicitly with the
/// request outcome; a lease dropped on an unexpected exit path returns
/// itself as a transient failure so the key is never lost.
pub struct KeyLease {
    pool: KeyPool,
    identifier: String,
    secret: String,
    brief: String,
    leased_at: f64,
    armed: bool,
}

impl KeyLease {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn brief(&self) -> &str {
        &self.brief
    }

    pub async fn release(mut self, outcome: LeaseOutcome) {
        self.armed = false;
        let pool = self.pool.clone();
        pool.return_lease(&self.identifier, self.leased_at, outcome)
            .await;
    }
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("identifier", &self.identifier)
            .field("brief", &self.brief)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(identifier = %self.identifier, "lease dropped without explicit return");
        let pool = self.pool.clone();
        let identifier = std::mem::take(&mut self.identifier);
        let leased_at = self.leased_at;
        let fallback = async move {
            pool.return_lease(
                &identifier,
                leased_at,
                LeaseOutcome::Failure(ReturnClassification::TransientClientOrNetwork),
            )
            .await;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(fallback);
            }
            Err(_) => {
                std::thread::spawn(move || {
                    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        runtime.block_on(fallback);
                    }
                });
            }
        }
    }
}
