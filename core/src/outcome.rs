//! The tagged result of a call.

use serde_json::Value;

use crate::error::Failure;

/// Result of interpreting one response, and of a whole orchestrated call.
///
/// `AuthExpired` is consumed by the orchestrator (one renewal, one re-issue)
/// and never reaches callers of `RequestOrchestrator::call`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T = Value> {
    Success(T),
    AuthExpired,
    Transient(Failure),
    Fatal(Failure),
    /// The caller (or a superseding call) cancelled this request. Not an error.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Transient(f) | Outcome::Fatal(f) => Some(f),
            _ => None,
        }
    }

    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(data) => Outcome::Success(f(data)),
            Outcome::AuthExpired => Outcome::AuthExpired,
            Outcome::Transient(failure) => Outcome::Transient(failure),
            Outcome::Fatal(failure) => Outcome::Fatal(failure),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// `Ok(Some(data))` on success, `Ok(None)` when cancelled, `Err` otherwise.
    pub fn into_result(self) -> Result<Option<T>, Failure> {
        match self {
            Outcome::Success(data) => Ok(Some(data)),
            Outcome::Cancelled => Ok(None),
            Outcome::AuthExpired => Err(Failure::auth("credential expired")),
            Outcome::Transient(failure) | Outcome::Fatal(failure) => Err(failure),
        }
    }

    /// Short name used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::AuthExpired => "auth_expired",
            Outcome::Transient(_) => "transient",
            Outcome::Fatal(_) => "fatal",
            Outcome::Cancelled => "cancelled",
        }
    }
}
