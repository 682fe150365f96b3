//! Caller-supplied call descriptors and request building.
//!
//! # Design
//! A `RequestDescriptor` is immutable for the lifetime of a call. Each
//! attempt (first try, auth re-issue, transient retry) builds a fresh
//! `HttpRequest` from it with whatever credential is current at that moment.

use std::time::Duration;

use serde_json::Value;

use crate::http::{HttpMethod, HttpRequest};
use crate::types::Credential;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Path relative to the configured base URL, or an absolute URL.
    pub url: String,
    pub method: HttpMethod,
    pub body: Option<Value>,
    /// Serve from and write to the cache. Ignored for non-GET methods.
    pub use_cache: bool,
    /// Falls back to the configured default TTL.
    pub cache_ttl: Option<Duration>,
    /// Overrides the derived `"<METHOD> <url>"` key.
    pub cache_key: Option<String>,
    /// Maximum retries for transient failures; 0 disables.
    pub retry: u32,
    pub context: Option<String>,
    /// Registry id. A new call with the same id supersedes the old one.
    pub id: Option<String>,
    pub skip_auth: bool,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            use_cache: false,
            cache_ttl: None,
            cache_key: None,
            retry: 0,
            context: None,
            id: None,
            skip_auth: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Put, url).with_body(body)
    }

    pub fn patch(url: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Patch, url).with_body(body)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_cache(mut self, ttl: Option<Duration>) -> Self {
        self.use_cache = true;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_retry(mut self, retries: u32) -> Self {
        self.retry = retries;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.use_cache && self.method.is_read_only()
    }

    pub fn cache_key(&self) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.method, self.url))
    }

    /// Build the wire request for one attempt.
    pub fn build_request(&self, base_url: &str, credential: Option<&Credential>) -> HttpRequest {
        let mut headers = Vec::new();
        let body = self.body.as_ref().map(Value::to_string);
        if body.is_some() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if !self.skip_auth {
            if let Some(credential) = credential {
                headers.push((
                    "authorization".to_string(),
                    format!("Bearer {}", credential.access_token),
                ));
            }
        }
        HttpRequest {
            method: self.method,
            path: join_url(base_url, &self.url),
            headers,
            body,
        }
    }
}

/// Join a base URL and a path. Absolute URLs pass through unchanged.
pub fn join_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "http://localhost:3000";

    #[test]
    fn get_request_has_no_body_and_bearer_header() {
        let credential = Credential::new("tok");
        let req = RequestDescriptor::get("/profile").build_request(BASE, Some(&credential));
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "http://localhost:3000/profile");
        assert!(req.body.is_none());
        assert_eq!(
            req.headers,
            vec![("authorization".to_string(), "Bearer tok".to_string())]
        );
    }

    #[test]
    fn post_request_serializes_json_body() {
        let req = RequestDescriptor::post("/items", json!({"name": "Tea", "price": 12}))
            .build_request(BASE, None);
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert!(req.header("authorization").is_none());
        let body: Value = serde_json::from_str(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["name"], "Tea");
        assert_eq!(body["price"], 12);
    }

    #[test]
    fn skip_auth_omits_authorization() {
        let credential = Credential::new("tok");
        let req = RequestDescriptor::get("/public")
            .skip_auth()
            .build_request(BASE, Some(&credential));
        assert!(req.header("authorization").is_none());
    }

    #[test]
    fn trailing_slash_is_stripped() {
        assert_eq!(join_url("http://localhost:3000/", "/items"), "http://localhost:3000/items");
        assert_eq!(join_url("http://localhost:3000", "items"), "http://localhost:3000/items");
        assert_eq!(join_url("http://localhost:3000", "https://cdn.test/a"), "https://cdn.test/a");
    }

    #[test]
    fn only_cached_gets_are_cacheable() {
        assert!(RequestDescriptor::get("/list").with_cache(None).is_cacheable());
        assert!(!RequestDescriptor::get("/list").is_cacheable());
        assert!(!RequestDescriptor::post("/list", json!({})).with_cache(None).is_cacheable());
    }

    #[test]
    fn cache_key_defaults_to_method_and_url() {
        assert_eq!(RequestDescriptor::get("/list?page=2").cache_key(), "GET /list?page=2");
        assert_eq!(
            RequestDescriptor::get("/list").with_cache_key("menu").cache_key(),
            "menu"
        );
    }
}
