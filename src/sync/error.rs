// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;
use thiserror::Error;

/// Failures of the remote collection API and the snapshot store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Connection refused, reset, DNS failure or request timeout
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// A single 401; the remote layer restores the session before giving up
    #[error("unauthorized")]
    Unauthorized,

    /// Session restore exhausted; the user must sign in again
    #[error("authentication required")]
    AuthRequired,

    #[error("validation failed ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("snapshot store error: {0}")]
    Snapshot(String),
}

impl SyncError {
    /// Whether the read path should back off and try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::RateLimited { .. } | SyncError::Server { .. }
        )
    }

    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized | SyncError::AuthRequired)
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Network(_) => "network",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Server { .. } => "server",
            SyncError::Unauthorized => "unauthorized",
            SyncError::AuthRequired => "auth_required",
            SyncError::Validation { .. } => "validation",
            SyncError::NotFound(_) => "not_found",
            SyncError::Decode(_) => "decode",
            SyncError::Snapshot(_) => "snapshot",
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}
