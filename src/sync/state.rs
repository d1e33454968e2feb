// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-scope collection state and what the engine publishes about it.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::time::Instant;

use super::error::SyncError;
use crate::types::{Resource, ScopeId};

/// What asked for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Poll timer tick. Subject to debounce and backoff.
    Poll,
    /// Explicit refresh. Bypasses debounce and backoff.
    Caller,
    /// Invalidation from the change bus. Subject to backoff only.
    Push,
}

impl Trigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Poll => "poll",
            Trigger::Caller => "caller",
            Trigger::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Backoff,
}

/// Poll interval currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cadence {
    #[default]
    Base,
    /// At least one item is processing
    Fast,
}

impl Cadence {
    /// Fast while any item is processing.
    #[must_use]
    pub fn for_items(items: &[Resource]) -> Self {
        if items.iter().any(Resource::is_processing) {
            Cadence::Fast
        } else {
            Cadence::Base
        }
    }
}

/// Result of one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New content replaced the mirror
    Updated { items: usize },
    /// Same content hash; the mirror kept its identity
    Unchanged,
    /// Dropped: too soon after the previous fetch
    Debounced,
    /// Dropped: inside the backoff window
    BackingOff { until: Instant },
    Failed(SyncError),
    /// A mutation landed while the fetch was in flight; its payload was stale
    Discarded,
    /// The fetch was cancelled before it completed
    Abandoned,
}

impl RefreshOutcome {
    /// Whether a network request was made for this outcome.
    #[must_use]
    pub fn fetched(&self) -> bool {
        matches!(
            self,
            RefreshOutcome::Updated { .. }
                | RefreshOutcome::Unchanged
                | RefreshOutcome::Failed(_)
                | RefreshOutcome::Discarded
        )
    }

    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            RefreshOutcome::Updated { .. } => "updated",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Debounced => "debounced",
            RefreshOutcome::BackingOff { .. } => "backoff",
            RefreshOutcome::Failed(_) => "error",
            RefreshOutcome::Discarded => "discarded",
            RefreshOutcome::Abandoned => "abandoned",
        }
    }
}

/// Mirror of one remote collection.
#[derive(Debug, Clone)]
pub struct CollectionState {
    pub scope: ScopeId,
    pub items: Arc<Vec<Resource>>,
    pub content_hash: Option<String>,
    pub fetch_in_flight: bool,
    pub last_fetch_at: Option<Instant>,
    pub retry_count: u32,
    pub backoff_until: Option<Instant>,
    /// Raised once retries are exhausted, or at once for non-retryable failures
    pub error: Option<SyncError>,
    pub auth_required: bool,
    /// Items came from the snapshot store, not the remote
    pub from_snapshot: bool,
    pub cadence: Cadence,
    pub last_outcome: Option<RefreshOutcome>,
    /// Bumped by every scope switch
    pub(crate) generation: u64,
    /// Bumped by every applied mutation
    pub(crate) mutation_epoch: u64,
    /// A push arrived while a fetch was in flight
    pub(crate) push_pending: bool,
}

impl CollectionState {
    pub(crate) fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            items: Arc::new(Vec::new()),
            content_hash: None,
            fetch_in_flight: false,
            last_fetch_at: None,
            retry_count: 0,
            backoff_until: None,
            error: None,
            auth_required: false,
            from_snapshot: false,
            cadence: Cadence::Base,
            last_outcome: None,
            generation: 0,
            mutation_epoch: 0,
            push_pending: false,
        }
    }

    /// Forget everything about the previous scope.
    pub(crate) fn reset(&mut self, scope: ScopeId) {
        let generation = self.generation + 1;
        let fetch_in_flight = self.fetch_in_flight;
        *self = Self::new(scope);
        self.generation = generation;
        self.fetch_in_flight = fetch_in_flight;
    }

    #[must_use]
    pub fn backing_off(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    #[must_use]
    pub fn phase(&self, now: Instant) -> Phase {
        if self.fetch_in_flight {
            Phase::Fetching
        } else if self.backing_off(now) {
            Phase::Backoff
        } else {
            Phase::Idle
        }
    }

    /// Replace the items if their content differs. Returns whether it did.
    pub(crate) fn apply_items(&mut self, items: Vec<Resource>, hash_fields: &[String]) -> bool {
        let hash = content_hash(&items, hash_fields);
        if self.content_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        self.cadence = Cadence::for_items(&items);
        self.items = Arc::new(items);
        self.content_hash = Some(hash);
        true
    }

    pub(crate) fn view(&self, now: Instant) -> CollectionView {
        CollectionView {
            scope: self.scope.clone(),
            items: self.items.clone(),
            content_hash: self.content_hash.clone(),
            is_loading: self.fetch_in_flight,
            error: self.error.clone(),
            auth_required: self.auth_required,
            from_snapshot: self.from_snapshot,
            cadence: self.cadence,
            phase: self.phase(now),
        }
    }
}

/// Read-only snapshot handed to consumers.
#[derive(Debug, Clone)]
pub struct CollectionView {
    pub scope: ScopeId,
    pub items: Arc<Vec<Resource>>,
    pub content_hash: Option<String>,
    pub is_loading: bool,
    pub error: Option<SyncError>,
    pub auth_required: bool,
    pub from_snapshot: bool,
    pub cadence: Cadence,
    pub phase: Phase,
}

/// SHA-256 (hex) over the id-sorted `(id, status, lastSyncedAt, fields)` tuples.
///
/// `hash_fields` restricts which entries of `fields` count; empty means all.
/// Order of the input does not matter.
#[must_use]
pub fn content_hash(items: &[Resource], hash_fields: &[String]) -> String {
    let mut sorted: Vec<&Resource> = items.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = Sha256::new();
    for item in sorted {
        let fields: Map<String, Value> = if hash_fields.is_empty() {
            item.fields.clone()
        } else {
            hash_fields
                .iter()
                .filter_map(|name| item.fields.get(name).map(|v| (name.clone(), v.clone())))
                .collect()
        };
        let tuple = serde_json::json!([
            item.id.as_str(),
            item.status.to_string(),
            item.last_synced_at.map(|t| t.to_rfc3339()),
            Value::Object(fields),
        ]);
        hasher.update(tuple.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceStatus;
    use serde_json::json;

    fn item(id: &str, status: ResourceStatus) -> Resource {
        Resource::new(id, status).with_field("name", json!(format!("{id}.csv")))
    }

    #[test]
    fn test_hash_ignores_order() {
        let a = vec![item("1", ResourceStatus::Ready), item("2", ResourceStatus::Idle)];
        let b = vec![item("2", ResourceStatus::Idle), item("1", ResourceStatus::Ready)];
        assert_eq!(content_hash(&a, &[]), content_hash(&b, &[]));
    }

    #[test]
    fn test_hash_tracks_visible_changes() {
        let before = vec![item("1", ResourceStatus::Processing)];
        let after = vec![item("1", ResourceStatus::Ready)];
        assert_ne!(content_hash(&before, &[]), content_hash(&after, &[]));

        let renamed = vec![item("1", ResourceStatus::Processing).with_field("name", json!("x"))];
        assert_ne!(content_hash(&before, &[]), content_hash(&renamed, &[]));
    }

    #[test]
    fn test_hash_fields_of_interest() {
        let fields = vec!["name".to_string()];
        let a = vec![item("1", ResourceStatus::Ready).with_field("progress", json!(10))];
        let b = vec![item("1", ResourceStatus::Ready).with_field("progress", json!(90))];
        assert_eq!(content_hash(&a, &fields), content_hash(&b, &fields));
        assert_ne!(content_hash(&a, &[]), content_hash(&b, &[]));
    }

    #[test]
    fn test_apply_items_keeps_identity_when_unchanged() {
        let mut state = CollectionState::new(ScopeId::new("org"));
        assert!(state.apply_items(vec![item("1", ResourceStatus::Ready)], &[]));
        let first = state.items.clone();

        assert!(!state.apply_items(vec![item("1", ResourceStatus::Ready)], &[]));
        assert!(Arc::ptr_eq(&first, &state.items));
    }

    #[test]
    fn test_cadence_follows_processing_items() {
        let mut state = CollectionState::new(ScopeId::new("org"));
        state.apply_items(vec![item("a", ResourceStatus::Processing)], &[]);
        assert_eq!(state.cadence, Cadence::Fast);
        state.apply_items(vec![item("a", ResourceStatus::Ready)], &[]);
        assert_eq!(state.cadence, Cadence::Base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase() {
        let mut state = CollectionState::new(ScopeId::new("org"));
        let now = Instant::now();
        assert_eq!(state.phase(now), Phase::Idle);

        state.backoff_until = Some(now + std::time::Duration::from_secs(1));
        assert_eq!(state.phase(now), Phase::Backoff);

        state.fetch_in_flight = true;
        assert_eq!(state.phase(now), Phase::Fetching);
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut state = CollectionState::new(ScopeId::new("a"));
        state.apply_items(vec![item("1", ResourceStatus::Ready)], &[]);
        state.retry_count = 3;
        state.reset(ScopeId::new("b"));
        assert_eq!(state.generation, 1);
        assert!(state.items.is_empty());
        assert_eq!(state.retry_count, 0);
        assert!(state.content_hash.is_none());
    }
}
