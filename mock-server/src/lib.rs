//! In-process envelope API used by the integration tests.
//!
//! Every JSON reply is `{code, message, data}`. Code 0 is success, 1001 means
//! the access token is expired or unknown, anything else is a business
//! rejection. A few routes exist only to provoke client behaviour: `/html`
//! answers 200 with an HTML page, `/flaky` fails with 503 before it succeeds,
//! and `/auth/expire` invalidates every issued access token.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const SUCCESS: i64 = 0;
pub const TOKEN_EXPIRED: i64 = 1001;
pub const INVALID_INPUT: i64 = 4001;
pub const INVALID_REFRESH: i64 = 4010;

/// Failures `/flaky` serves before its first success.
pub const FLAKY_FAILURES: u64 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
    pub price: i64,
}

#[derive(Deserialize)]
pub struct CreateItem {
    pub name: String,
    #[serde(default)]
    pub price: i64,
}

#[derive(Deserialize)]
pub struct Login {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Renew {
    pub refresh_token: String,
}

/// Credential as issued on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issued {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub logins: u64,
    pub renewals: u64,
    pub flaky_hits: u64,
    pub profile_hits: u64,
}

#[derive(Default)]
pub struct Db {
    pub items: HashMap<Uuid, Item>,
    /// access token -> owning user
    pub access: HashMap<String, String>,
    /// refresh token -> owning user
    pub refresh: HashMap<String, String>,
    pub stats: Stats,
}

pub type SharedDb = Arc<RwLock<Db>>;

pub fn app() -> Router {
    app_with_db(SharedDb::default())
}

pub fn app_with_db(db: SharedDb) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/renew", post(renew))
        .route("/auth/expire", post(expire))
        .route("/profile", get(profile))
        .route("/items", get(list_items).post(create_item))
        .route("/html", get(html))
        .route("/flaky", get(flaky))
        .route("/stats", get(stats))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

fn envelope(code: i64, message: &str, data: Value) -> Response {
    Json(json!({ "code": code, "message": message, "data": data })).into_response()
}

fn ok<T: Serialize>(data: T) -> Response {
    match serde_json::to_value(data) {
        Ok(data) => envelope(SUCCESS, "ok", data),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn issue(db: &mut Db, user: &str) -> Issued {
    let issued = Issued {
        access_token: format!("at-{}", Uuid::new_v4()),
        refresh_token: format!("rt-{}", Uuid::new_v4()),
        expires_at: (Utc::now() + Duration::hours(1)).timestamp_millis(),
    };
    db.access.insert(issued.access_token.clone(), user.to_string());
    db.refresh.insert(issued.refresh_token.clone(), user.to_string());
    issued
}

/// Resolve the bearer token to its user, or the response to send instead.
fn authorize(db: &Db, headers: &HeaderMap) -> Result<String, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| StatusCode::UNAUTHORIZED.into_response())?;
    db.access
        .get(token)
        .cloned()
        .ok_or_else(|| envelope(TOKEN_EXPIRED, "token expired", Value::Null))
}

async fn login(State(db): State<SharedDb>, Json(input): Json<Login>) -> Response {
    if input.password.is_empty() {
        return envelope(INVALID_INPUT, "invalid credentials", Value::Null);
    }
    let mut db = db.write().await;
    db.stats.logins += 1;
    ok(issue(&mut db, &input.username))
}

async fn renew(State(db): State<SharedDb>, Json(input): Json<Renew>) -> Response {
    let mut db = db.write().await;
    db.stats.renewals += 1;
    let Some(user) = db.refresh.remove(&input.refresh_token) else {
        debug!("rejecting unknown refresh token");
        return envelope(INVALID_REFRESH, "refresh token invalid", Value::Null);
    };
    info!(user = %user, "renewing credential");
    ok(issue(&mut db, &user))
}

async fn expire(State(db): State<SharedDb>) -> Response {
    let mut db = db.write().await;
    let expired = db.access.len();
    db.access.clear();
    ok(json!({ "expired": expired }))
}

async fn profile(State(db): State<SharedDb>, headers: HeaderMap) -> Response {
    let mut db = db.write().await;
    db.stats.profile_hits += 1;
    match authorize(&db, &headers) {
        Ok(user) => ok(json!({ "username": user })),
        Err(response) => response,
    }
}

async fn list_items(State(db): State<SharedDb>, headers: HeaderMap) -> Response {
    let db = db.read().await;
    if let Err(response) = authorize(&db, &headers) {
        return response;
    }
    let mut items: Vec<Item> = db.items.values().cloned().collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    ok(items)
}

async fn create_item(
    State(db): State<SharedDb>,
    headers: HeaderMap,
    Json(input): Json<CreateItem>,
) -> Response {
    let mut db = db.write().await;
    if let Err(response) = authorize(&db, &headers) {
        return response;
    }
    if input.name.trim().is_empty() {
        return envelope(INVALID_INPUT, "name must not be empty", Value::Null);
    }
    let item = Item {
        id: Uuid::new_v4(),
        name: input.name,
        price: input.price,
    };
    db.items.insert(item.id, item.clone());
    (StatusCode::CREATED, ok(item)).into_response()
}

async fn html() -> Html<&'static str> {
    Html("<!doctype html><html><body><h1>Sign in</h1></body></html>")
}

async fn flaky(State(db): State<SharedDb>) -> Response {
    let mut db = db.write().await;
    db.stats.flaky_hits += 1;
    if db.stats.flaky_hits <= FLAKY_FAILURES {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }
    ok(json!({ "hits": db.stats.flaky_hits }))
}

async fn stats(State(db): State<SharedDb>) -> Response {
    ok(db.read().await.stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_credential_uses_camel_case() {
        let issued = Issued {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["expiresAt"], 1_700_000_000_000i64);
    }

    #[test]
    fn create_item_defaults_price_to_zero() {
        let input: CreateItem = serde_json::from_str(r#"{"name":"Tea"}"#).unwrap();
        assert_eq!(input.name, "Tea");
        assert_eq!(input.price, 0);
    }

    #[test]
    fn create_item_rejects_missing_name() {
        let result: Result<CreateItem, _> = serde_json::from_str(r#"{"price":3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn issue_registers_both_tokens() {
        let mut db = Db::default();
        let issued = issue(&mut db, "ada");
        assert_eq!(db.access.get(&issued.access_token).map(String::as_str), Some("ada"));
        assert_eq!(db.refresh.get(&issued.refresh_token).map(String::as_str), Some("ada"));
    }

    #[test]
    fn authorize_distinguishes_missing_and_unknown_tokens() {
        let mut db = Db::default();
        let issued = issue(&mut db, "ada");

        let missing = authorize(&db, &HeaderMap::new()).unwrap_err();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        let unknown = authorize(&db, &headers).unwrap_err();
        assert_eq!(unknown.status(), StatusCode::OK);

        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {}", issued.access_token).parse().unwrap(),
        );
        assert_eq!(authorize(&db, &headers).unwrap(), "ada");
    }
}
