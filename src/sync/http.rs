// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! [`ResourceApi`] over HTTP.
//!
//! | Call     | Request                                  |
//! |----------|------------------------------------------|
//! | `list`   | `GET    {base}/resources?scope={scope}`      |
//! | `create` | `POST   {base}/resources?scope={scope}`      |
//! | `update` | `PATCH  {base}/resources/{id}?scope={scope}` |
//! | `delete` | `DELETE {base}/resources/{id}?scope={scope}` |
//!
//! A 401 sends the request back through the session restore loop
//! ([`RemoteConfig::session_retry`]). When that is exhausted the session is
//! cleared and the call fails with [`SyncError::AuthRequired`].

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::SyncError;
use super::remote::{ResourceApi, SessionProvider};
use crate::config::RemoteConfig;
use crate::resilience::retry::{retry, RetryConfig};
use crate::types::{Resource, ResourceDraft, ResourceId, ScopeId};

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct HttpResourceApi {
    client: Client,
    base_url: String,
    session: Arc<dyn SessionProvider>,
    session_retry: RetryConfig,
}

impl HttpResourceApi {
    pub fn new(config: &RemoteConfig, session: Arc<dyn SessionProvider>) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
            session_retry: config.session_retry(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self) -> String {
        format!("{}/resources", self.base_url)
    }

    fn item_url(&self, id: &ResourceId) -> String {
        format!("{}/resources/{}", self.base_url, id)
    }

    /// Send with bearer auth; on 401 restore the session and try again.
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response, SyncError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        match self.send_once(&build).await {
            Err(SyncError::Unauthorized) => {}
            other => return other,
        }

        debug!(operation, "Unauthorized, restoring session");
        let this = self;
        let build = &build;
        let outcome = retry(operation, &self.session_retry, move || async move {
            if let Err(e) = this.session.restore().await {
                return Err(e);
            }
            match this.send_once(build).await {
                Err(e) if e.is_auth() => Err(e),
                other => Ok::<_, SyncError>(other),
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(operation, error = %e, "Session restore exhausted, clearing session");
                self.session.clear();
                Err(SyncError::AuthRequired)
            }
        }
    }

    async fn send_once<F>(&self, build: &F) -> Result<Response, SyncError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut request = build(&self.client);
        if let Some(token) = self.session.access_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response).await)
        }
    }
}

#[async_trait]
impl ResourceApi for HttpResourceApi {
    async fn list(&self, scope: &ScopeId) -> Result<Vec<Resource>, SyncError> {
        let url = self.collection_url();
        let response = self
            .send("list", |client| client.get(&url).query(&[("scope", scope.as_str())]))
            .await?;
        response.json::<Vec<Resource>>().await.map_err(body_error)
    }

    async fn create(&self, scope: &ScopeId, draft: &ResourceDraft) -> Result<Resource, SyncError> {
        let url = self.collection_url();
        let response = self
            .send("create", |client| {
                client
                    .post(&url)
                    .query(&[("scope", scope.as_str())])
                    .json(draft)
            })
            .await?;
        response.json::<Resource>().await.map_err(body_error)
    }

    async fn update(
        &self,
        scope: &ScopeId,
        id: &ResourceId,
        patch: &ResourceDraft,
    ) -> Result<Resource, SyncError> {
        let url = self.item_url(id);
        let response = self
            .send("update", |client| {
                client
                    .patch(&url)
                    .query(&[("scope", scope.as_str())])
                    .json(patch)
            })
            .await?;
        response.json::<Resource>().await.map_err(body_error)
    }

    async fn delete(&self, scope: &ScopeId, id: &ResourceId) -> Result<(), SyncError> {
        let url = self.item_url(id);
        self.send("delete", |client| {
            client.delete(&url).query(&[("scope", scope.as_str())])
        })
        .await?;
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> SyncError {
    if e.is_decode() {
        SyncError::Decode(e.to_string())
    } else {
        SyncError::Network(e.to_string())
    }
}

fn body_error(e: reqwest::Error) -> SyncError {
    if e.is_decode() {
        SyncError::Decode(e.to_string())
    } else {
        transport_error(e)
    }
}

async fn status_error(response: Response) -> SyncError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    match status {
        StatusCode::UNAUTHORIZED => SyncError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited { retry_after },
        StatusCode::NOT_FOUND => SyncError::NotFound(message),
        s if s.is_server_error() => SyncError::Server {
            status: s.as_u16(),
            message,
        },
        s => SyncError::Validation {
            status: s.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in delta-seconds form.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
