// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The remote collection seam.
//!
//! [`ResourceSyncEngine`](super::ResourceSyncEngine) is generic over
//! [`ResourceApi`]; production code plugs in
//! [`HttpResourceApi`](super::HttpResourceApi), tests plug in a scripted mock.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::error::SyncError;
use crate::types::{Resource, ResourceDraft, ResourceId, ScopeId};

/// CRUD over one remote collection, partitioned by organization scope.
#[async_trait]
pub trait ResourceApi: Send + Sync + 'static {
    /// Every resource visible in `scope`.
    async fn list(&self, scope: &ScopeId) -> Result<Vec<Resource>, SyncError>;

    /// Create a resource; returns the server's view of it.
    async fn create(&self, scope: &ScopeId, draft: &ResourceDraft) -> Result<Resource, SyncError>;

    /// Apply `patch`; returns the server's view of the updated resource.
    async fn update(
        &self,
        scope: &ScopeId,
        id: &ResourceId,
        patch: &ResourceDraft,
    ) -> Result<Resource, SyncError>;

    async fn delete(&self, scope: &ScopeId, id: &ResourceId) -> Result<(), SyncError>;
}

#[async_trait]
impl<A: ResourceApi> ResourceApi for std::sync::Arc<A> {
    async fn list(&self, scope: &ScopeId) -> Result<Vec<Resource>, SyncError> {
        (**self).list(scope).await
    }

    async fn create(&self, scope: &ScopeId, draft: &ResourceDraft) -> Result<Resource, SyncError> {
        (**self).create(scope, draft).await
    }

    async fn update(
        &self,
        scope: &ScopeId,
        id: &ResourceId,
        patch: &ResourceDraft,
    ) -> Result<Resource, SyncError> {
        (**self).update(scope, id, patch).await
    }

    async fn delete(&self, scope: &ScopeId, id: &ResourceId) -> Result<(), SyncError> {
        (**self).delete(scope, id).await
    }
}

/// Source of bearer tokens for the HTTP remote.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Current access token, if signed in.
    fn access_token(&self) -> Option<String>;

    /// Try to obtain a fresh token after a 401 (refresh token, re-handshake, ...).
    async fn restore(&self) -> Result<(), SyncError>;

    /// Forget local session state once restore is exhausted.
    fn clear(&self);
}

/// Fixed token; `restore` succeeds while a token is present.
#[derive(Debug, Default)]
pub struct StaticSession {
    token: RwLock<Option<String>>,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// No token at all.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    async fn restore(&self) -> Result<(), SyncError> {
        if self.token.read().is_some() {
            Ok(())
        } else {
            Err(SyncError::AuthRequired)
        }
    }

    fn clear(&self) {
        self.token.write().take();
    }
}
