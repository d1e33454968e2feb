// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resource synchronization: keep a local mirror of one remote collection
//! per organization scope.
//!
//! - [`ResourceSyncEngine`] owns the mirror and its fetch state machine
//! - [`ResourceApi`] is the remote seam; [`HttpResourceApi`] talks HTTP
//! - [`SnapshotStore`] keeps a last-known-good copy for failed fetches

mod engine;
pub mod error;
pub mod http;
pub mod remote;
pub mod snapshot;
pub mod state;

pub use engine::ResourceSyncEngine;
pub use error::SyncError;
pub use http::HttpResourceApi;
pub use remote::{ResourceApi, SessionProvider, StaticSession};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use state::{
    content_hash, Cadence, CollectionState, CollectionView, Phase, RefreshOutcome, Trigger,
};
