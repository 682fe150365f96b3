//! Classification of raw transport results.
//!
//! # Design
//! `ResponseInterpreter` is a pure function from "what the transport handed
//! back" to an `Outcome`. It never looks at the request and holds only the
//! two reserved envelope codes, so it can be exercised exhaustively with
//! canned responses.
//!
//! Status handling:
//! - 2xx with an envelope: `code` decides success, token expiry, or business error.
//! - 2xx whose body is not JSON, or is an HTML page: infrastructure failure, transient.
//! - 204: success with no data.
//! - 401: token expired.
//! - 408, 429, 5xx: transient.
//! - other 4xx: business rejection, never retried.

use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::{Failure, TransportError};
use crate::http::HttpResponse;
use crate::outcome::Outcome;
use crate::types::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseInterpreter {
    success_code: i64,
    token_expired_code: i64,
}

impl Default for ResponseInterpreter {
    fn default() -> Self {
        Self::new(0, 1001)
    }
}

impl ResponseInterpreter {
    pub fn new(success_code: i64, token_expired_code: i64) -> Self {
        Self {
            success_code,
            token_expired_code,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.success_code, config.token_expired_code)
    }

    /// Classify the result of one transport attempt.
    pub fn interpret(&self, result: Result<HttpResponse, TransportError>) -> Outcome {
        match result {
            Ok(response) => self.interpret_response(&response),
            Err(TransportError::Aborted) => Outcome::Cancelled,
            Err(err) => Outcome::Transient(Failure::network(err.to_string())),
        }
    }

    pub fn interpret_response(&self, response: &HttpResponse) -> Outcome {
        let status = response.status;
        match status {
            204 => Outcome::Success(Value::Null),
            200..=299 => self.interpret_envelope(response),
            401 => Outcome::AuthExpired,
            408 | 429 | 500..=599 => Outcome::Transient(
                Failure::network(format!("server responded with HTTP {status}")).with_status(status),
            ),
            400..=499 => Outcome::Fatal(rejection(response)),
            _ => Outcome::Fatal(
                Failure::contract(format!("unexpected HTTP status {status}")).with_status(status),
            ),
        }
    }

    fn interpret_envelope(&self, response: &HttpResponse) -> Outcome {
        let status = response.status;
        if looks_like_html(response) {
            return Outcome::Transient(
                Failure::contract("received an HTML page instead of JSON").with_status(status),
            );
        }

        // Syntax errors mean the body is not JSON at all; data errors mean
        // JSON that breaks the envelope contract.
        let envelope: Envelope = match serde_json::from_str(&response.body) {
            Ok(envelope) => envelope,
            Err(err) if err.is_data() => {
                return Outcome::Fatal(
                    Failure::contract(format!("malformed response envelope: {err}")).with_status(status),
                );
            }
            Err(err) => {
                return Outcome::Transient(
                    Failure::contract(format!("response body is not JSON: {err}")).with_status(status),
                );
            }
        };

        let code = envelope.code;
        if code == self.success_code {
            return Outcome::Success(envelope.data);
        }
        if code == self.token_expired_code {
            return Outcome::AuthExpired;
        }

        let message = match envelope.message {
            Some(m) if !m.is_empty() => m,
            _ => format!("request rejected with code {code}"),
        };
        Outcome::Fatal(Failure::business(message).with_status(status).with_code(code))
    }
}

/// JSON never starts with `<`, so a leading tag means an HTML error page from
/// a proxy or gateway even when the content type lies.
fn looks_like_html(response: &HttpResponse) -> bool {
    let is_html_type = response
        .header("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
    is_html_type || response.body.trim_start().starts_with('<')
}

/// Business rejection for a non-2xx status, preferring the envelope message.
fn rejection(response: &HttpResponse) -> Failure {
    let status = response.status;
    let envelope = serde_json::from_str::<Value>(&response.body).ok();
    let message = envelope
        .as_ref()
        .and_then(|body| body.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("server rejected the request with HTTP {status}"));
    let mut failure = Failure::business(message).with_status(status);
    if let Some(code) = envelope.as_ref().and_then(|b| b.get("code")).and_then(Value::as_i64) {
        failure = failure.with_code(code);
    }
    failure
}
