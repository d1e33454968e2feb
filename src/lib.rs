// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Resource Sync
//!
//! Client-side synchronization and caching for a multi-tenant dashboard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SyncContext (composition root)             │
//! │  • Builds the shared bus, cache, offload engine, snapshots  │
//! │  • Broadcasts live SyncConfig updates                       │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │   ResourceSyncEngine<A>      │  │   ComputeOffloadEngine       │
//! │  • One mirror per scope      │  │  • Worker thread, lazy       │
//! │  • Poll / caller / push      │  │  • Timeout → input unchanged │
//! │  • Debounce + backoff        │  │  • Results in KeyedCache     │
//! │  • Hash-based diffing        │  └──────────────────────────────┘
//! │  • Authoritative mutations   │                 │
//! └──────────────────────────────┘                 ▼
//!       │            ▲               ┌──────────────────────────────┐
//!       │ publish    │ push          │   KeyedCache<T>              │
//!       ▼            │               │  • LRU + TTL, never fails    │
//! ┌──────────────────────────────┐   └──────────────────────────────┘
//! │   ChangeBus                  │
//! │  • In-process, synchronous   │
//! └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resource_sync::{EngineConfig, ScopeId, StaticSession, SyncContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = SyncContext::new(EngineConfig::default());
//!     let api = ctx
//!         .http_api(Arc::new(StaticSession::new("token")))
//!         .expect("http client");
//!
//!     let engine = ctx.sync_engine(api, ScopeId::new("org-1"));
//!     let runner = engine.clone();
//!     tokio::spawn(async move { runner.run().await });
//!
//!     let mut view = engine.subscribe();
//!     while view.changed().await.is_ok() {
//!         let current = view.borrow().clone();
//!         println!("{} items, loading={}", current.items.len(), current.is_loading);
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: [`KeyedCache`], LRU + TTL keyed by a dataset fingerprint
//! - [`offload`]: [`ComputeOffloadEngine`] and the built-in chart transforms
//! - [`sync`]: [`ResourceSyncEngine`], the remote seam and snapshots
//! - [`bus`]: [`ChangeBus`] publish/subscribe
//! - [`context`]: [`SyncContext`] composition root
//! - [`resilience`]: backoff schedules and the retry helper
//! - [`config`]: serde-backed configuration
//! - [`metrics`]: `metrics` crate instrumentation

pub mod bus;
pub mod cache;
pub mod config;
pub mod context;
pub mod metrics;
pub mod offload;
pub mod resilience;
pub mod sync;
pub mod types;

pub use bus::{ChangeBus, ChangeEvent, ChangeKind, Subscription, RESOURCE_CHANGED};
pub use cache::{CacheEntry, CacheKey, CacheStats, KeyedCache};
pub use config::{CacheConfig, EngineConfig, OffloadConfig, RemoteConfig, SyncConfig};
pub use context::SyncContext;
pub use offload::{
    ComputeOffloadEngine, OffloadResult, OffloadStats, SampleMethod, SampleOptions, Statistics,
    TaskError, TransformConfig,
};
pub use resilience::RetryConfig;
pub use sync::{
    CollectionState, CollectionView, FileSnapshotStore, HttpResourceApi, MemorySnapshotStore,
    RefreshOutcome, ResourceApi, ResourceSyncEngine, SessionProvider, SnapshotStore,
    StaticSession, SyncError, Trigger,
};
pub use types::{canonical_id, Resource, ResourceDraft, ResourceId, ResourceStatus, ScopeId};
