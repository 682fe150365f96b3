//! End-to-end call scenarios over a scripted transport.
//!
//! # Design
//! `Scripted` answers each request from a closure keyed on the request path
//! and the per-path call number, with an optional delay that honours the
//! abort token. Time is paused (`start_paused`) wherever delays matter, and
//! the orchestrator reads a `ManualClock`, so TTL and staleness checks are
//! driven explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apilink_core::{
    ClientConfig, Clock, Credential, DurableTier, ErrorKind, HttpRequest, HttpResponse,
    ManualClock, MemoryCredentialStore, Outcome, RequestDescriptor, RequestOrchestrator,
    TierSelection, Transport, TransportError,
};
use async_trait::async_trait;
use chrono::TimeZone;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

const BASE: &str = "http://api.test";

type Reply = (Duration, Result<HttpResponse, TransportError>);
type Handler = Box<dyn Fn(&HttpRequest, usize) -> Reply + Send + Sync>;

struct Scripted {
    handler: Handler,
    log: Mutex<Vec<HttpRequest>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl Scripted {
    fn calls(&self, path: &str) -> usize {
        self.counts.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| path_of(r) == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(
        &self,
        request: HttpRequest,
        abort: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let n = {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(path_of(&request).to_string()).or_default();
            *n += 1;
            *n
        };
        let (delay, reply) = (self.handler)(&request, n);
        self.log.lock().unwrap().push(request);
        if !delay.is_zero() {
            tokio::select! {
                _ = abort.cancelled() => return Err(TransportError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        reply
    }
}

struct Harness {
    client: RequestOrchestrator,
    clock: Arc<ManualClock>,
    transport: Arc<Scripted>,
}

fn path_of(request: &HttpRequest) -> &str {
    request.path.strip_prefix(BASE).unwrap_or(&request.path)
}

fn bearer(request: &HttpRequest) -> Option<&str> {
    request
        .header("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
    ))
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn ok(data: Value) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(
        200,
        json!({"code": 0, "message": "ok", "data": data}).to_string(),
    ))
}

fn rejected(code: i64, message: &str) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse::new(
        200,
        json!({"code": code, "message": message, "data": null}).to_string(),
    ))
}

fn unscripted() -> Reply {
    (Duration::ZERO, Err(TransportError::Connect("unscripted".into())))
}

fn scripted(handler: impl Fn(&HttpRequest, usize) -> Reply + Send + Sync + 'static) -> Arc<Scripted> {
    Arc::new(Scripted {
        handler: Box::new(handler),
        log: Mutex::new(Vec::new()),
        counts: Mutex::new(HashMap::new()),
    })
}

fn harness(
    clock: Arc<ManualClock>,
    credential: Option<Credential>,
    handler: impl Fn(&HttpRequest, usize) -> Reply + Send + Sync + 'static,
) -> Harness {
    let transport = scripted(handler);
    let store = Arc::new(match credential {
        Some(credential) => MemoryCredentialStore::with_credential(credential),
        None => MemoryCredentialStore::new(),
    });
    let client = RequestOrchestrator::builder(ClientConfig::new(BASE))
        .transport(transport.clone())
        .credential_store(store)
        .clock(clock.clone())
        .build()
        .unwrap();
    Harness {
        client,
        clock,
        transport,
    }
}

/// Renewal endpoint answer issuing `token`, valid for an hour from `clock`.
fn renewal(clock: &ManualClock, token: &str) -> Result<HttpResponse, TransportError> {
    ok(json!({
        "accessToken": token,
        "refreshToken": format!("refresh-{token}"),
        "expiresAt": (clock.now() + chrono::Duration::hours(1)).timestamp_millis(),
    }))
}

// --- credential renewal ---

#[tokio::test(start_paused = true)]
async fn concurrent_calls_share_one_renewal() {
    let clock = clock();
    let expiring = Credential::new("old")
        .with_refresh_token("r1")
        .with_expiry(clock.now() + chrono::Duration::seconds(30));
    let renew_clock = clock.clone();
    let h = harness(clock, Some(expiring), move |req, _| match path_of(req) {
        "/auth/renew" => (ms(50), renewal(&renew_clock, "new")),
        "/profile" if bearer(req) == Some("new") => (ms(5), ok(json!({"name": "Ada"}))),
        "/profile" => (Duration::ZERO, rejected(1001, "token expired")),
        _ => unscripted(),
    });

    let (a, b, c) = tokio::join!(
        h.client.call_value(RequestDescriptor::get("/profile")),
        h.client.call_value(RequestDescriptor::get("/profile")),
        h.client.call_value(RequestDescriptor::get("/profile")),
    );

    for outcome in [a, b, c] {
        assert_eq!(outcome, Outcome::Success(json!({"name": "Ada"})));
    }
    assert_eq!(h.transport.calls("/auth/renew"), 1);
    assert_eq!(h.transport.calls("/profile"), 3);
    assert!(h
        .transport
        .requests_to("/profile")
        .iter()
        .all(|r| bearer(r) == Some("new")));
    assert_eq!(h.client.metrics().renewals, 1);
    assert_eq!(
        h.client.tokens().current().unwrap().refresh_token.as_deref(),
        Some("refresh-new")
    );
}

#[tokio::test]
async fn expired_response_renews_and_reissues_once() {
    let clock = clock();
    let credential = Credential::new("old").with_refresh_token("r1");
    let renew_clock = clock.clone();
    let h = harness(clock, Some(credential), move |req, _| match path_of(req) {
        "/auth/renew" => (Duration::ZERO, renewal(&renew_clock, "new")),
        "/profile" if bearer(req) == Some("new") => (Duration::ZERO, ok(json!({"name": "Ada"}))),
        "/profile" => (Duration::ZERO, rejected(1001, "token expired")),
        _ => unscripted(),
    });

    let outcome = h.client.call_value(RequestDescriptor::get("/profile")).await;

    assert_eq!(outcome, Outcome::Success(json!({"name": "Ada"})));
    assert_eq!(h.transport.calls("/profile"), 2);
    assert_eq!(h.transport.calls("/auth/renew"), 1);
    let renew = &h.transport.requests_to("/auth/renew")[0];
    assert!(renew.header("authorization").is_none());
    let body: Value = serde_json::from_str(renew.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!({"refreshToken": "r1"}));
}

#[tokio::test]
async fn second_expiry_after_renewal_is_fatal() {
    let clock = clock();
    let credential = Credential::new("old").with_refresh_token("r1");
    let renew_clock = clock.clone();
    let h = harness(clock, Some(credential), move |req, _| match path_of(req) {
        "/auth/renew" => (Duration::ZERO, renewal(&renew_clock, "new")),
        "/profile" => (Duration::ZERO, rejected(1001, "token expired")),
        _ => unscripted(),
    });

    let outcome = h.client.call_value(RequestDescriptor::get("/profile")).await;

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Auth);
    assert_eq!(failure.attempts, 2);
    assert_eq!(h.transport.calls("/profile"), 2);
    assert_eq!(h.transport.calls("/auth/renew"), 1);
}

#[tokio::test]
async fn rejected_renewal_clears_credential() {
    let h = harness(
        clock(),
        Some(Credential::new("old").with_refresh_token("r1")),
        |req, _| match path_of(req) {
            "/auth/renew" => (Duration::ZERO, rejected(4010, "refresh token invalid")),
            "/profile" => (Duration::ZERO, Ok(HttpResponse::new(401, ""))),
            _ => unscripted(),
        },
    );

    let outcome = h.client.call_value(RequestDescriptor::get("/profile")).await;

    assert_eq!(outcome.failure().map(|f| f.kind), Some(ErrorKind::Auth));
    assert!(h.client.tokens().current().is_none());
    assert_eq!(h.transport.calls("/profile"), 1);
}

#[tokio::test(start_paused = true)]
async fn call_superseded_while_awaiting_renewal_stays_superseded() {
    let clock = clock();
    let credential = Credential::new("old").with_refresh_token("r1");
    let renew_clock = clock.clone();
    let h = harness(clock, Some(credential), move |req, _| match path_of(req) {
        "/auth/renew" => (ms(100), renewal(&renew_clock, "new")),
        "/detail/a" if bearer(req) == Some("new") => (Duration::ZERO, ok(json!("a"))),
        "/detail/a" => (Duration::ZERO, rejected(1001, "token expired")),
        "/detail/b" => (ms(500), ok(json!("b"))),
        _ => unscripted(),
    });
    let client = h.client.clone();
    let older = tokio::spawn(async move {
        client
            .call_value(RequestDescriptor::get("/detail/a").with_cache(None).with_id("detail"))
            .await
    });

    tokio::time::sleep(ms(20)).await;
    assert!(h.client.tokens().is_renewing());
    let newer = h
        .client
        .call_value(RequestDescriptor::get("/detail/b").with_cache(None).with_id("detail"))
        .await;

    assert_eq!(newer, Outcome::Success(json!("b")));
    assert_eq!(older.await.unwrap(), Outcome::Cancelled);
    // the superseded call never re-issued after the renewal landed
    assert_eq!(h.transport.calls("/detail/a"), 1);
    assert_eq!(h.transport.calls("/auth/renew"), 1);
    assert_eq!(h.client.tokens().current().unwrap().access_token, "new");
    let cache = h.client.cache();
    assert!(cache.get_value("GET /detail/a", TierSelection::VolatileFirst).is_none());
    assert!(cache.get_value("GET /detail/b", TierSelection::VolatileFirst).is_some());
    assert!(h.client.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_renewal_wait_stops_the_call() {
    let clock = clock();
    let credential = Credential::new("old").with_refresh_token("r1");
    let renew_clock = clock.clone();
    let h = harness(clock, Some(credential), move |req, _| match path_of(req) {
        "/auth/renew" => (ms(100), renewal(&renew_clock, "new")),
        "/orders" | "/cart" if bearer(req) == Some("new") => (Duration::ZERO, ok(json!([]))),
        "/orders" | "/cart" => (Duration::ZERO, rejected(1001, "token expired")),
        _ => unscripted(),
    });
    let spawn = |descriptor: RequestDescriptor| {
        let client = h.client.clone();
        tokio::spawn(async move { client.call_value(descriptor).await })
    };
    let orders = spawn(RequestDescriptor::get("/orders").with_cache(None).with_id("orders"));
    let cart = spawn(RequestDescriptor::get("/cart").with_cache(None).with_context("checkout"));

    tokio::time::sleep(ms(20)).await;
    assert_eq!(h.client.registry().len(), 2);
    assert!(h.client.cancel("orders"));
    assert_eq!(h.client.cancel_context("checkout"), 1);

    assert_eq!(orders.await.unwrap(), Outcome::Cancelled);
    assert_eq!(cart.await.unwrap(), Outcome::Cancelled);
    assert!(h.client.registry().is_empty());

    // the shared renewal still completes for everyone else
    tokio::time::sleep(ms(200)).await;
    assert_eq!(h.client.tokens().current().unwrap().access_token, "new");
    assert_eq!(h.transport.calls("/orders"), 1);
    assert_eq!(h.transport.calls("/cart"), 1);
    assert_eq!(h.client.cache().volatile_len(), 0);
    assert_eq!(h.client.metrics().cancellations, 2);
}

// --- cache ---

#[tokio::test(start_paused = true)]
async fn aging_cache_entry_schedules_one_background_refresh() {
    let h = harness(clock(), Some(Credential::new("tok")), |req, n| match path_of(req) {
        "/list" => (Duration::ZERO, ok(json!({"version": n}))),
        _ => unscripted(),
    });
    let list = || RequestDescriptor::get("/list").with_cache(Some(ms(5000)));

    let first = h.client.call_value(list()).await;
    assert_eq!(first, Outcome::Success(json!({"version": 1})));

    h.clock.advance(chrono::Duration::milliseconds(4500));
    let second = h.client.call_value(list()).await;
    let third = h.client.call_value(list()).await;
    assert_eq!(second, Outcome::Success(json!({"version": 1})));
    assert_eq!(third, Outcome::Success(json!({"version": 1})));
    // the refresh runs off the caller's path
    assert_eq!(h.transport.calls("/list"), 1);

    tokio::time::sleep(ms(10)).await;
    assert_eq!(h.transport.calls("/list"), 2);
    assert_eq!(h.client.metrics().background_refreshes, 1);

    let fourth = h.client.call_value(list()).await;
    assert_eq!(fourth, Outcome::Success(json!({"version": 2})));
    assert_eq!(h.transport.calls("/list"), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_background_refresh_keeps_serving_until_ttl() {
    let h = harness(clock(), Some(Credential::new("tok")), |req, n| match path_of(req) {
        "/list" if n == 1 => (Duration::ZERO, ok(json!({"version": 1}))),
        "/list" => (Duration::ZERO, Ok(HttpResponse::new(503, "unavailable"))),
        _ => unscripted(),
    });
    let list = || RequestDescriptor::get("/list").with_cache(Some(ms(5000)));

    h.client.call_value(list()).await;
    h.clock.advance(chrono::Duration::milliseconds(4500));
    let aging = h.client.call_value(list()).await;
    assert_eq!(aging, Outcome::Success(json!({"version": 1})));

    tokio::time::sleep(ms(10)).await;
    assert_eq!(h.transport.calls("/list"), 2);
    assert_eq!(
        h.client.cache().get_value("GET /list", TierSelection::VolatileFirst),
        Some(json!({"version": 1}))
    );
    let still_cached = h.client.call_value(list()).await;
    assert_eq!(still_cached, Outcome::Success(json!({"version": 1})));

    // the failed refresh released its slot, so the next read tried again
    tokio::time::sleep(ms(10)).await;
    assert_eq!(h.transport.calls("/list"), 3);
    assert_eq!(h.client.metrics().background_refreshes, 2);

    h.clock.advance(chrono::Duration::milliseconds(600));
    assert!(h.client.cache().get_value("GET /list", TierSelection::VolatileFirst).is_none());
    let expired = h.client.call_value(list()).await;
    assert_eq!(expired.label(), "transient");
    assert_eq!(h.transport.calls("/list"), 4);
}

#[tokio::test]
async fn expired_entry_is_replaced_not_merged() {
    let h = harness(clock(), None, |req, n| match path_of(req) {
        "/menu" if n == 1 => (Duration::ZERO, ok(json!({"a": 1, "b": 2}))),
        "/menu" => (Duration::ZERO, ok(json!({"c": 3}))),
        _ => unscripted(),
    });
    let menu = || RequestDescriptor::get("/menu").with_cache(Some(ms(1000)));

    h.client.call_value(menu()).await;
    h.clock.advance(chrono::Duration::milliseconds(1001));
    let second = h.client.call_value(menu()).await;

    assert_eq!(second, Outcome::Success(json!({"c": 3})));
    assert_eq!(
        h.client.cache().get_value("GET /menu", TierSelection::VolatileFirst),
        Some(json!({"c": 3}))
    );
    assert_eq!(h.transport.calls("/menu"), 2);
}

#[tokio::test]
async fn mutations_are_never_cached() {
    let h = harness(clock(), None, |req, n| match path_of(req) {
        "/items" => (Duration::ZERO, ok(json!({"id": n}))),
        _ => unscripted(),
    });
    let create = || RequestDescriptor::post("/items", json!({"name": "Tea"})).with_cache(None);

    h.client.call_value(create()).await;
    let second = h.client.call_value(create()).await;

    assert_eq!(second, Outcome::Success(json!({"id": 2})));
    assert_eq!(h.client.cache().volatile_len(), 0);
}

#[tokio::test]
async fn durable_tier_survives_a_new_client() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let transport = scripted(|req, _| match path_of(req) {
        "/catalog" => (Duration::ZERO, ok(json!(["tea", "cake"]))),
        _ => unscripted(),
    });
    let client = || {
        RequestOrchestrator::builder(ClientConfig::new(BASE))
            .transport(transport.clone())
            .clock(clock.clone())
            .durable_tier(Arc::new(DurableTier::open(dir.path()).unwrap()))
            .build()
            .unwrap()
    };
    let catalog = || RequestDescriptor::get("/catalog").with_cache(None);

    client().call_value(catalog()).await;
    let restarted = client();
    assert_eq!(restarted.cache().volatile_len(), 0);
    let outcome = restarted.call_value(catalog()).await;

    assert_eq!(outcome, Outcome::Success(json!(["tea", "cake"])));
    assert_eq!(transport.calls("/catalog"), 1);
    assert_eq!(restarted.cache().volatile_len(), 1);
}

// --- interpretation ---

#[tokio::test]
async fn html_with_200_is_transient_not_success() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/page" => (
            Duration::ZERO,
            Ok(HttpResponse {
                status: 200,
                headers: vec![("content-type".into(), "text/html; charset=utf-8".into())],
                body: "<html><body>Sign in</body></html>".into(),
            }),
        ),
        _ => unscripted(),
    });

    let outcome = h.client.call_value(RequestDescriptor::get("/page")).await;

    match outcome {
        Outcome::Transient(failure) => assert_eq!(failure.kind, ErrorKind::Contract),
        other => panic!("expected transient, got {other:?}"),
    }
}

#[tokio::test]
async fn business_rejection_is_verbatim_and_not_retried() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/items" => (Duration::ZERO, rejected(4001, "name must not be empty")),
        _ => unscripted(),
    });

    let outcome = h
        .client
        .call_value(RequestDescriptor::post("/items", json!({"name": ""})).with_retry(3))
        .await;

    let failure = outcome.failure().unwrap();
    assert!(matches!(outcome, Outcome::Fatal(_)));
    assert_eq!(failure.kind, ErrorKind::Business);
    assert_eq!(failure.message, "name must not be empty");
    assert_eq!(failure.code, Some(4001));
    assert_eq!(h.transport.calls("/items"), 1);
    assert_eq!(h.client.metrics().retries, 0);
}

// --- retries ---

#[tokio::test(start_paused = true)]
async fn retry_budget_bounds_attempts() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/flaky" => (Duration::ZERO, Ok(HttpResponse::new(503, "unavailable"))),
        _ => unscripted(),
    });
    let started = tokio::time::Instant::now();

    let outcome = h
        .client
        .call_value(RequestDescriptor::get("/flaky").with_retry(3))
        .await;

    let failure = match outcome {
        Outcome::Fatal(failure) => failure,
        other => panic!("expected fatal, got {other:?}"),
    };
    assert_eq!(failure.kind, ErrorKind::Network);
    assert_eq!(failure.attempts, 4);
    assert_eq!(failure.status, Some(503));
    assert_eq!(h.transport.calls("/flaky"), 4);
    assert_eq!(h.client.metrics().retries, 3);
    // 1000 + 2000 + 4000
    assert!(started.elapsed() >= ms(7000));
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_backoff_stops_retrying() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/flaky" => (Duration::ZERO, Err(TransportError::Timeout)),
        _ => unscripted(),
    });
    let client = h.client.clone();
    let call = tokio::spawn(async move {
        client
            .call_value(RequestDescriptor::get("/flaky").with_retry(5).with_id("poll"))
            .await
    });

    tokio::time::sleep(ms(500)).await;
    assert!(h.client.cancel("poll"));

    assert_eq!(call.await.unwrap(), Outcome::Cancelled);
    assert_eq!(h.transport.calls("/flaky"), 1);
    assert!(h.client.registry().is_empty());
}

// --- registry ---

#[tokio::test(start_paused = true)]
async fn newer_call_with_same_id_supersedes_older() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/search?q=a" => (ms(500), ok(json!(["apple"]))),
        "/search?q=b" => (ms(10), ok(json!(["banana"]))),
        _ => unscripted(),
    });
    let client = h.client.clone();
    let first = tokio::spawn(async move {
        client
            .call_value(RequestDescriptor::get("/search?q=a").with_cache(None).with_id("search"))
            .await
    });

    tokio::time::sleep(ms(50)).await;
    let second = h
        .client
        .call_value(RequestDescriptor::get("/search?q=b").with_cache(None).with_id("search"))
        .await;

    assert_eq!(second, Outcome::Success(json!(["banana"])));
    assert_eq!(first.await.unwrap(), Outcome::Cancelled);
    let cache = h.client.cache();
    assert!(cache.get_value("GET /search?q=a", TierSelection::VolatileFirst).is_none());
    assert!(cache.get_value("GET /search?q=b", TierSelection::VolatileFirst).is_some());
    assert!(h.client.registry().is_empty());
    assert_eq!(h.client.metrics().cancellations, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_by_context_leaves_other_contexts_running() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/slow" => (ms(10_000), ok(json!("done"))),
        _ => unscripted(),
    });
    let spawn = |context: &'static str| {
        let client = h.client.clone();
        tokio::spawn(async move {
            client
                .call_value(RequestDescriptor::get("/slow").with_context(context))
                .await
        })
    };
    let orders_a = spawn("orders");
    let orders_b = spawn("orders");
    let cart = spawn("cart");

    tokio::time::sleep(ms(10)).await;
    assert_eq!(h.client.registry().len(), 3);
    assert_eq!(h.client.cancel_context("orders"), 2);

    assert_eq!(orders_a.await.unwrap(), Outcome::Cancelled);
    assert_eq!(orders_b.await.unwrap(), Outcome::Cancelled);
    assert_eq!(cart.await.unwrap(), Outcome::Success(json!("done")));
    assert!(h.client.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_sweep_cancels_forgotten_calls() {
    let h = harness(clock(), None, |req, _| match path_of(req) {
        "/hang" => (ms(120_000), ok(json!(null))),
        _ => unscripted(),
    });
    let client = h.client.clone();
    let call = tokio::spawn(async move { client.call_value(RequestDescriptor::get("/hang")).await });

    tokio::time::sleep(ms(10)).await;
    assert_eq!(h.client.sweep_stale(), 0);

    h.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(h.client.sweep_stale(), 1);

    let outcome = call.await.unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.into_result(), Ok(None));
}

#[tokio::test(start_paused = true)]
async fn logout_aborts_in_flight_calls() {
    let h = harness(clock(), Some(Credential::new("tok")), |req, _| match path_of(req) {
        "/slow" => (ms(10_000), ok(json!("done"))),
        _ => unscripted(),
    });
    let client = h.client.clone();
    let call = tokio::spawn(async move { client.call_value(RequestDescriptor::get("/slow")).await });

    tokio::time::sleep(ms(10)).await;
    h.client.logout();

    assert_eq!(call.await.unwrap(), Outcome::Cancelled);
    assert!(h.client.tokens().current().is_none());
}
