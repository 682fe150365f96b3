//! Wire DTOs shared with the remote API.
//!
//! # Design
//! Field names follow the server's camelCase convention. The mock-server crate
//! defines its own copies of these shapes; integration tests catch drift.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access/refresh credential pair.
///
/// Without a `refresh_token` the credential cannot be renewed, so reaching
/// its expiry is a terminal auth failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    /// Epoch milliseconds on the wire.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
            refresh_token: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn can_renew(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// True when the credential expires at or before `now + threshold`.
    /// A credential without `expires_at` never needs renewal.
    pub fn expires_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.expires_at.is_some_and(|at| at - threshold <= now)
    }

    /// Merge a renewal response into a full credential. A renewal that omits
    /// `refreshToken` keeps the previous one.
    pub fn renewed(&self, fresh: Credential) -> Credential {
        Credential {
            access_token: fresh.access_token,
            expires_at: fresh.expires_at,
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
        }
    }
}

/// The `{code, message, data}` wrapper every API response uses.
///
/// `message` may be absent or null; absent `data` reads as `T::default()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: T,
}

/// Body of the renewal request. Carries only the refresh credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewRequest {
    pub refresh_token: String,
}
