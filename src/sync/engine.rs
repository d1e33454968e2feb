// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The resource sync engine.
//!
//! # State machine
//!
//! ```text
//!            poll / caller / push
//!   Idle ─────────────────────────→ Fetching
//!    ↑                                 │
//!    │ success                         │ retryable failure
//!    ├─────────────────────────────────┤
//!    │                                 ▼
//!    └──── now >= backoff_until ──── Backoff
//!          or caller refresh
//! ```
//!
//! - At most one fetch is in flight. A trigger that arrives meanwhile joins
//!   it and receives its outcome.
//! - A push that arrives mid-fetch schedules one follow-up fetch, since the
//!   running request may predate the change.
//! - A fetch that started before a mutation was applied, or before a scope
//!   switch, has its payload discarded.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::remote::ResourceApi;
use super::snapshot::SnapshotStore;
use super::state::{Cadence, CollectionState, CollectionView, RefreshOutcome, Trigger};
use crate::bus::{ChangeBus, ChangeEvent, ChangeKind, Subscription, RESOURCE_CHANGED};
use crate::config::SyncConfig;
use crate::types::{Resource, ResourceDraft, ResourceId, ScopeId};

/// Outcome of the most recent fetch, watched by joined triggers.
#[derive(Debug, Clone, Default)]
struct FetchCompletion {
    outcome: Option<RefreshOutcome>,
}

struct Shared<A: ResourceApi> {
    api: A,
    bus: Arc<ChangeBus>,
    snapshots: Arc<dyn SnapshotStore>,
    config: watch::Receiver<SyncConfig>,
    state: Mutex<CollectionState>,
    view: watch::Sender<CollectionView>,
    fetch_done: watch::Sender<FetchCompletion>,
    push: Notify,
    shutdown: watch::Sender<bool>,
    subscription: Mutex<Option<Subscription>>,
}

/// Mirrors one remote collection for the current organization scope.
///
/// Cheap to clone; clones share the same mirror.
pub struct ResourceSyncEngine<A: ResourceApi> {
    shared: Arc<Shared<A>>,
}

impl<A: ResourceApi> Clone for ResourceSyncEngine<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

enum Admission {
    Lead,
    Join(watch::Receiver<FetchCompletion>),
    Skip(RefreshOutcome),
}

/// What a finished request leaves to do outside the state lock.
struct Settled {
    outcome: RefreshOutcome,
    save: Option<Arc<Vec<Resource>>>,
    restore: bool,
}

impl Settled {
    fn outcome(outcome: RefreshOutcome) -> Self {
        Self {
            outcome,
            save: None,
            restore: false,
        }
    }
}

impl<A: ResourceApi> ResourceSyncEngine<A> {
    /// Build an engine for `scope`. `config` may be updated at runtime.
    ///
    /// The engine subscribes to [`RESOURCE_CHANGED`] on `bus` and treats
    /// events for its scope as push triggers.
    pub fn new(
        api: A,
        scope: ScopeId,
        bus: Arc<ChangeBus>,
        snapshots: Arc<dyn SnapshotStore>,
        config: watch::Receiver<SyncConfig>,
    ) -> Self {
        let state = CollectionState::new(scope);
        let (view, _) = watch::channel(state.view(Instant::now()));
        let (fetch_done, _) = watch::channel(FetchCompletion::default());
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            api,
            bus: bus.clone(),
            snapshots,
            config,
            state: Mutex::new(state),
            view,
            fetch_done,
            push: Notify::new(),
            shutdown,
            subscription: Mutex::new(None),
        });

        let weak: Weak<Shared<A>> = Arc::downgrade(&shared);
        let subscription = bus.subscribe(RESOURCE_CHANGED, move |event: &ChangeEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_push(event);
            }
        });
        *shared.subscription.lock() = Some(subscription);

        Self { shared }
    }

    /// Engine whose config never changes.
    pub fn with_config(
        api: A,
        scope: ScopeId,
        bus: Arc<ChangeBus>,
        snapshots: Arc<dyn SnapshotStore>,
        config: SyncConfig,
    ) -> Self {
        let (_tx, rx) = watch::channel(config);
        Self::new(api, scope, bus, snapshots, rx)
    }

    #[must_use]
    pub fn api(&self) -> &A {
        &self.shared.api
    }

    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.shared.state.lock().scope.clone()
    }

    #[must_use]
    pub fn config(&self) -> SyncConfig {
        self.shared.config.borrow().clone()
    }

    /// Current items. The same `Arc` is returned until the content changes.
    #[must_use]
    pub fn items(&self) -> Arc<Vec<Resource>> {
        self.shared.state.lock().items.clone()
    }

    /// Copy of the full collection state.
    #[must_use]
    pub fn state(&self) -> CollectionState {
        self.shared.state.lock().clone()
    }

    #[must_use]
    pub fn view(&self) -> CollectionView {
        self.shared.view.borrow().clone()
    }

    /// Receive a new [`CollectionView`] on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CollectionView> {
        self.shared.view.subscribe()
    }

    /// Poll interval implied by the current items.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        let config = self.config();
        match self.shared.state.lock().cadence {
            Cadence::Fast => config.fast_poll_interval(),
            Cadence::Base => config.base_poll_interval(),
        }
    }

    /// Explicit refresh: bypasses debounce, clears any backoff window.
    /// Joins the in-flight fetch if there is one.
    #[tracing::instrument(skip_all, fields(scope = %self.scope()))]
    pub async fn refresh(&self) -> RefreshOutcome {
        self.trigger(Trigger::Caller).await
    }

    /// Feed a trigger into the state machine.
    pub async fn trigger(&self, trigger: Trigger) -> RefreshOutcome {
        match self.shared.admit(trigger) {
            Admission::Skip(outcome) => outcome,
            Admission::Join(mut done) => {
                debug!(trigger = trigger.as_str(), "Joining in-flight fetch");
                match done.changed().await {
                    Ok(()) => done
                        .borrow()
                        .outcome
                        .clone()
                        .unwrap_or(RefreshOutcome::Abandoned),
                    Err(_) => RefreshOutcome::Abandoned,
                }
            }
            Admission::Lead => self.shared.lead_fetch().await,
        }
    }

    /// Switch to another organization scope. The mirror is cleared and the
    /// next fetch targets the new scope.
    #[tracing::instrument(skip_all, fields(scope = %scope))]
    pub fn set_scope(&self, scope: ScopeId) {
        {
            let mut state = self.shared.state.lock();
            if state.scope == scope {
                return;
            }
            info!(from = %state.scope, to = %scope, "Switching scope");
            state.reset(scope);
            if !state.fetch_in_flight {
                self.shared.push.notify_one();
            }
        }
        crate::metrics::set_items(0);
        self.shared.publish_view();
    }

    /// Create a resource. The mirror is updated from the server's response.
    #[tracing::instrument(skip_all, fields(scope = %self.scope()))]
    pub async fn create(&self, draft: ResourceDraft) -> Result<Resource, SyncError> {
        let scope = self.scope();
        let result = self.shared.api.create(&scope, &draft).await;
        crate::metrics::record_mutation("create", result.is_ok());
        let resource = result.map_err(|e| {
            warn!(error = %e, "Create failed");
            e
        })?;

        self.shared.apply_mutation(&scope, ChangeKind::Created, |items| {
            upsert(items, resource.clone());
        })
        .await;
        self.shared
            .bus
            .publish(RESOURCE_CHANGED, &ChangeEvent::for_resource(ChangeKind::Created, &scope, &resource));
        Ok(resource)
    }

    /// Update a resource. The mirror is updated from the server's response.
    #[tracing::instrument(skip_all, fields(scope = %self.scope(), id = %id))]
    pub async fn update(&self, id: &ResourceId, patch: ResourceDraft) -> Result<Resource, SyncError> {
        let scope = self.scope();
        let result = self.shared.api.update(&scope, id, &patch).await;
        crate::metrics::record_mutation("update", result.is_ok());
        let resource = result.map_err(|e| {
            warn!(error = %e, "Update failed");
            e
        })?;

        self.shared.apply_mutation(&scope, ChangeKind::Updated, |items| {
            upsert(items, resource.clone());
        })
        .await;
        self.shared
            .bus
            .publish(RESOURCE_CHANGED, &ChangeEvent::for_resource(ChangeKind::Updated, &scope, &resource));
        Ok(resource)
    }

    /// Delete a resource. It leaves the mirror as soon as the server confirms.
    #[tracing::instrument(skip_all, fields(scope = %self.scope(), id = %id))]
    pub async fn delete(&self, id: &ResourceId) -> Result<(), SyncError> {
        let scope = self.scope();
        let result = self.shared.api.delete(&scope, id).await;
        crate::metrics::record_mutation("delete", result.is_ok());
        result.map_err(|e| {
            warn!(error = %e, "Delete failed");
            e
        })?;

        self.shared.apply_mutation(&scope, ChangeKind::Deleted, |items| {
            items.retain(|r| &r.id != id);
        })
        .await;
        let event = ChangeEvent::new(ChangeKind::Deleted)
            .with_scope(scope)
            .with_id(id.clone());
        self.shared.bus.publish(RESOURCE_CHANGED, &event);
        Ok(())
    }

    /// Drive polling until [`shutdown`](Self::shutdown).
    ///
    /// Waits on the next poll deadline, push notifications and config
    /// updates. Fetches immediately on start.
    pub async fn run(&self) {
        let mut config_rx = self.shared.config.clone();
        let mut config_open = true;
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        info!(scope = %self.scope(), "Sync loop started");

        if !*shutdown_rx.borrow() {
            self.trigger(Trigger::Poll).await;
        }

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let deadline = self.next_poll_deadline();

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                () = tokio::time::sleep_until(deadline) => {
                    self.trigger(Trigger::Poll).await;
                }
                () = self.shared.push.notified() => {
                    self.trigger(Trigger::Push).await;
                }
                changed = config_rx.changed(), if config_open => {
                    if changed.is_ok() {
                        let config = config_rx.borrow_and_update().clone();
                        info!(
                            base_poll_ms = config.base_poll_ms,
                            fast_poll_ms = config.fast_poll_ms,
                            "Sync config updated"
                        );
                    } else {
                        config_open = false;
                    }
                }
            }
        }
        info!(scope = %self.scope(), "Sync loop stopped");
    }

    /// Stop [`run`](Self::run). An in-flight fetch still completes.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    fn next_poll_deadline(&self) -> Instant {
        let interval = self.poll_interval();
        let state = self.shared.state.lock();
        let now = Instant::now();
        let next = state.last_fetch_at.map_or(now, |at| at + interval);
        match state.backoff_until {
            Some(until) if until > next => until,
            _ => next,
        }
    }
}

impl<A: ResourceApi> Shared<A> {
    fn config(&self) -> SyncConfig {
        self.config.borrow().clone()
    }

    fn admit(&self, trigger: Trigger) -> Admission {
        let min_interval = self.config().min_fetch_interval();
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.fetch_in_flight {
            if trigger == Trigger::Push {
                state.push_pending = true;
            }
            crate::metrics::record_trigger(trigger.as_str(), "joined");
            return Admission::Join(self.fetch_done.subscribe());
        }

        match trigger {
            Trigger::Caller => state.backoff_until = None,
            Trigger::Poll | Trigger::Push => {
                if let Some(until) = state.backoff_until.filter(|until| now < *until) {
                    debug!(trigger = trigger.as_str(), "Inside backoff window, dropping trigger");
                    crate::metrics::record_trigger(trigger.as_str(), "backoff");
                    return Admission::Skip(RefreshOutcome::BackingOff { until });
                }
                let debounced = trigger == Trigger::Poll
                    && state
                        .last_fetch_at
                        .is_some_and(|at| now.saturating_duration_since(at) < min_interval);
                if debounced {
                    debug!("Within min fetch interval, dropping poll");
                    crate::metrics::record_trigger(trigger.as_str(), "debounced");
                    return Admission::Skip(RefreshOutcome::Debounced);
                }
            }
        }

        state.fetch_in_flight = true;
        crate::metrics::record_trigger(trigger.as_str(), "admitted");
        Admission::Lead
    }

    async fn lead_fetch(&self) -> RefreshOutcome {
        let mut guard = InFlight {
            shared: self,
            armed: true,
        };
        self.publish_view();

        loop {
            let outcome = self.fetch_once().await;

            let mut state = self.state.lock();
            let follow_up = std::mem::take(&mut state.push_pending);
            match outcome {
                None => {
                    debug!("Scope changed during fetch, fetching new scope");
                    continue;
                }
                Some(_) if follow_up && !state.backing_off(Instant::now()) => {
                    debug!("Change pushed during fetch, fetching again");
                    continue;
                }
                Some(outcome) => {
                    if follow_up {
                        // Admission drops it until the backoff window closes
                        self.push.notify_one();
                    }
                    state.fetch_in_flight = false;
                    state.last_outcome = Some(outcome.clone());
                    drop(state);
                    guard.armed = false;
                    self.complete(outcome.clone());
                    return outcome;
                }
            }
        }
    }

    /// One request. `None` means the scope changed underneath it.
    async fn fetch_once(&self) -> Option<RefreshOutcome> {
        let config = self.config();
        let (scope, generation, epoch) = {
            let mut state = self.state.lock();
            state.last_fetch_at = Some(Instant::now());
            (state.scope.clone(), state.generation, state.mutation_epoch)
        };

        let started = Instant::now();
        let result = self.api.list(&scope).await;
        let elapsed = started.elapsed();

        let settled = self.settle(result, &scope, generation, epoch, &config)?;
        if let Some(items) = settled.save {
            self.save_snapshot(&scope, &items).await;
        }
        if settled.restore {
            self.restore_snapshot(&scope, generation, &config.hash_fields).await;
        }

        crate::metrics::record_fetch(settled.outcome.metric_label(), elapsed);
        Some(settled.outcome)
    }

    /// Fold a fetch result into the state.
    fn settle(
        &self,
        result: Result<Vec<Resource>, SyncError>,
        scope: &ScopeId,
        generation: u64,
        epoch: u64,
        config: &SyncConfig,
    ) -> Option<Settled> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return None;
        }

        let settled = match result {
            Ok(items) if state.mutation_epoch != epoch => {
                debug!(items = items.len(), "Mutation applied during fetch, discarding payload");
                Settled::outcome(RefreshOutcome::Discarded)
            }
            Ok(items) => {
                let items = in_scope(items, scope);
                let count = items.len();
                let changed = state.apply_items(items, &config.hash_fields);
                state.retry_count = 0;
                state.backoff_until = None;
                state.error = None;
                state.auth_required = false;
                state.from_snapshot = false;
                crate::metrics::set_retry_count(0);
                crate::metrics::set_items(count);

                let outcome = if changed {
                    info!(items = count, cadence = ?state.cadence, "Collection updated");
                    RefreshOutcome::Updated { items: count }
                } else {
                    debug!(items = count, "Collection unchanged");
                    RefreshOutcome::Unchanged
                };
                // Persist on every success, not only on change
                Settled {
                    outcome,
                    save: Some(state.items.clone()),
                    restore: false,
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    let backoff = config.fetch_backoff();
                    let mut delay = backoff.delay_for(state.retry_count);
                    if let SyncError::RateLimited { retry_after: Some(after) } = &e {
                        delay = delay.max(*after).min(backoff.max_delay);
                    }
                    state.backoff_until = Some(Instant::now() + delay);
                    state.retry_count += 1;
                    crate::metrics::set_retry_count(state.retry_count);
                    if state.retry_count >= config.max_fetch_retries {
                        state.error = Some(e.clone());
                    }
                    warn!(
                        error = %e,
                        retry_count = state.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, backing off"
                    );
                } else {
                    if e.is_auth() {
                        state.auth_required = true;
                    }
                    state.error = Some(e.clone());
                    warn!(error = %e, "Fetch failed");
                }
                Settled {
                    restore: state.items.is_empty() && !state.auth_required,
                    outcome: RefreshOutcome::Failed(e),
                    save: None,
                }
            }
        };
        Some(settled)
    }

    async fn save_snapshot(&self, scope: &ScopeId, items: &[Resource]) {
        if let Err(e) = self.snapshots.save(scope, items).await {
            warn!(error = %e, "Failed to save snapshot");
        }
    }

    async fn restore_snapshot(&self, scope: &ScopeId, generation: u64, hash_fields: &[String]) {
        let snapshot = match self.snapshots.load(scope).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to load snapshot");
                None
            }
        };
        crate::metrics::record_snapshot_fallback(snapshot.is_some());
        let Some(snapshot) = snapshot else {
            return;
        };

        let mut state = self.state.lock();
        if state.generation != generation || !state.items.is_empty() {
            return;
        }
        info!(items = snapshot.items.len(), saved_at = %snapshot.saved_at, "Showing last-known-good snapshot");
        state.apply_items(snapshot.items, hash_fields);
        state.from_snapshot = true;
    }

    /// Apply a confirmed mutation to the mirror and persist the result.
    async fn apply_mutation<F>(&self, scope: &ScopeId, kind: ChangeKind, edit: F)
    where
        F: FnOnce(&mut Vec<Resource>),
    {
        let hash_fields = self.config().hash_fields;
        let items = {
            let mut state = self.state.lock();
            if &state.scope != scope {
                debug!(?kind, "Scope changed during mutation, not applying locally");
                return;
            }
            let mut items = state.items.as_ref().clone();
            edit(&mut items);
            state.apply_items(items, &hash_fields);
            state.mutation_epoch += 1;
            crate::metrics::set_items(state.items.len());
            state.items.clone()
        };
        self.publish_view();
        self.save_snapshot(scope, &items).await;
    }

    fn on_push(&self, event: &ChangeEvent) {
        let mut state = self.state.lock();
        if !event.applies_to(&state.scope) {
            return;
        }
        if state.fetch_in_flight {
            state.push_pending = true;
        } else {
            self.push.notify_one();
        }
    }

    fn complete(&self, outcome: RefreshOutcome) {
        self.fetch_done.send_modify(|done| done.outcome = Some(outcome));
        self.publish_view();
    }

    fn publish_view(&self) {
        let view = self.state.lock().view(Instant::now());
        self.view.send_replace(view);
    }
}

/// Resets the in-flight flag if the leading future is dropped mid-fetch.
struct InFlight<'a, A: ResourceApi> {
    shared: &'a Shared<A>,
    armed: bool,
}

impl<A: ResourceApi> Drop for InFlight<'_, A> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pending = {
            let mut state = self.shared.state.lock();
            state.fetch_in_flight = false;
            state.last_outcome = Some(RefreshOutcome::Abandoned);
            std::mem::take(&mut state.push_pending)
        };
        if pending {
            self.shared.push.notify_one();
        }
        self.shared.complete(RefreshOutcome::Abandoned);
    }
}

fn upsert(items: &mut Vec<Resource>, resource: Resource) {
    match items.iter_mut().find(|r| r.id == resource.id) {
        Some(slot) => *slot = resource,
        None => items.push(resource),
    }
}

/// Drop items the remote tagged with another scope.
fn in_scope(items: Vec<Resource>, scope: &ScopeId) -> Vec<Resource> {
    let before = items.len();
    let items: Vec<Resource> = items
        .into_iter()
        .filter(|r| r.organization_scope.as_ref().map_or(true, |s| s == scope))
        .collect();
    if items.len() != before {
        warn!(dropped = before - items.len(), "Remote returned items from another scope");
    }
    items
}
