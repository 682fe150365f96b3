//! Error types for the network layer.
//!
//! # Design
//! Failures are classified into four kinds that drive the orchestrator's
//! policy: `Network` and `Contract` may be retried, `Auth` gets one silent
//! renewal cycle, `Business` is surfaced verbatim. Cancellation is not a
//! failure and has no variant here; it is an `Outcome` of its own.

use std::fmt;

use serde::Serialize;

/// Failure taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport unreachable, DNS, timeouts, 5xx, or an abort nobody asked for.
    Network,
    /// Expired or invalid credential, or a failed renewal.
    Auth,
    /// Well-formed rejection from the server (validation, conflict).
    Business,
    /// The payload did not have the expected shape.
    Contract,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Business => "business",
            ErrorKind::Contract => "contract",
        };
        f.write_str(s)
    }
}

/// Detail carried by `Outcome::Transient` and `Outcome::Fatal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct Failure {
    pub kind: ErrorKind,
    /// Server-provided message for business errors, otherwise a description.
    pub message: String,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Envelope code, when the envelope was parsed.
    pub code: Option<i64>,
    /// Number of transport attempts made before this failure surfaced.
    pub attempts: u32,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
            attempts: 1,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Contract, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Errors reported by a `Transport` when no response reached the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The call was aborted through its cancellation token.
    #[error("request aborted")]
    Aborted,

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport I/O failed: {0}")]
    Io(String),
}

/// Errors from credential and cache persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Why a credential renewal did not produce a fresh credential.
///
/// `Clone` because every waiter attached to a single renewal receives the
/// same result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenewError {
    #[error("no credential to renew")]
    NoCredential,

    #[error("credential has no refresh token")]
    NoRefreshToken,

    #[error("renewal rejected: {0}")]
    Rejected(Failure),

    #[error("credential store failed: {0}")]
    Store(String),
}

impl RenewError {
    /// Terminal auth failure surfaced to the caller whose call needed renewal.
    pub fn into_failure(self) -> Failure {
        match self {
            RenewError::Rejected(inner) => {
                let mut failure = Failure::auth(format!("credential renewal failed: {}", inner.message));
                failure.status = inner.status;
                failure.code = inner.code;
                failure
            }
            other => Failure::auth(other.to_string()),
        }
    }
}

impl From<StoreError> for RenewError {
    fn from(err: StoreError) -> Self {
        RenewError::Store(err.to_string())
    }
}
