// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared resource types.
//!
//! The remote may report the same logical resource as `42`, `"42"` or
//! `"0042"`. Every identifier passes through [`canonical_id`] on the way in,
//! so equality on [`ResourceId`]/[`ScopeId`] is equality of the canonical
//! form.
//!
//! ```
//! use resource_sync::ResourceId;
//!
//! let a: ResourceId = serde_json::from_str("42").unwrap();
//! let b: ResourceId = serde_json::from_str("\" 0042 \"").unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.as_str(), "42");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Canonical string form of an identifier.
///
/// Digit-only ids lose leading zeros; everything else is trimmed.
#[must_use]
pub fn canonical_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let stripped = trimmed.trim_start_matches('0');
        if stripped.is_empty() {
            return "0".to_string();
        }
        return stripped.to_string();
    }
    trimmed.to_string()
}

fn canonical_number(n: &Number) -> String {
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(Number),
}

impl RawId {
    fn canonical(self) -> String {
        match self {
            RawId::Text(s) => canonical_id(&s),
            RawId::Number(n) => canonical_number(&n),
        }
    }
}

macro_rules! canonical_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl AsRef<str>) -> Self {
                Self(canonical_id(raw.as_ref()))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n.to_string())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Ok(Self(RawId::deserialize(deserializer)?.canonical()))
            }
        }
    };
}

canonical_id_type!(
    /// Identity of a mirrored resource.
    ResourceId
);

canonical_id_type!(
    /// Organization scope a collection belongs to.
    ScopeId
);

/// Processing status reported by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    #[default]
    Idle,
    #[serde(alias = "pending")]
    Processing,
    #[serde(alias = "connected")]
    Ready,
    #[serde(alias = "failed")]
    Error,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One element of a remote collection (a data source, a knowledge source, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceId,
    #[serde(default, alias = "organizationId", alias = "organization_id")]
    pub organization_scope: Option<ScopeId>,
    #[serde(default)]
    pub status: ResourceStatus,
    #[serde(default, alias = "last_synced_at")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Resource {
    pub fn new(id: impl Into<ResourceId>, status: ResourceStatus) -> Self {
        Self {
            id: id.into(),
            organization_scope: None,
            status,
            last_synced_at: None,
            fields: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.status == ResourceStatus::Processing
    }
}

/// Fields to set on create, or to change on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceStatus>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ResourceDraft {
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = Some(status);
        self
    }
}
