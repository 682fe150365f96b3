//! The single public entry point: one call contract over cache, credential
//! renewal, registry bookkeeping, interpretation, and retries.
//!
//! # Design
//! `call` runs one explicit loop per call. Each pass ensures a valid
//! credential, makes one registered transport attempt, interprets it, and
//! picks the next step from the `Outcome`:
//!
//! - `Success`: write through to the cache when cacheable, return.
//! - `AuthExpired`: renew once (single-flight) and re-issue once. A second
//!   `AuthExpired` is terminal.
//! - `Transient`: retry with backoff while the descriptor's budget lasts,
//!   then surface `Fatal` with the attempt count.
//! - `Fatal`: surface as is.
//! - `Cancelled`: surface as a non-error.
//!
//! Registration is one `TaskGuard` held for the whole call, so credential
//! waits, renewal waits, and backoff are all cancellable, and a newer call
//! with the same id supersedes this one at any point. Each attempt sends
//! under a child of the call's token. A response that arrives after its call
//! was cancelled or superseded is reported as `Cancelled` and never written
//! to the cache.
//!
//! Instances are explicit: construct one per process with `builder` and
//! share it by cloning, which is cheap.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CacheLayer, CacheTier, DurableTier, TierSelection};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClientConfig, ConfigError};
use crate::error::{Failure, StoreError, TransportError};
use crate::interpret::ResponseInterpreter;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::outcome::Outcome;
use crate::registry::{RequestRegistry, TaskGuard};
use crate::request::{join_url, RequestDescriptor};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::token::{CredentialStore, MemoryCredentialStore, TokenManager};
use crate::transport::{send_abortable, Transport};
use crate::types::Credential;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no transport configured")]
    NoTransport,
    #[error("failed to create transport: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to open durable cache: {0}")]
    DurableCache(#[from] StoreError),
}

pub struct OrchestratorBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn CredentialStore>>,
    clock: Option<Arc<dyn Clock>>,
    durable: Option<Arc<dyn CacheTier>>,
}

impl OrchestratorBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn durable_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.durable = Some(tier);
        self
    }

    pub fn build(self) -> Result<RequestOrchestrator, BuildError> {
        let config = self.config;
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config)?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let durable = match (self.durable, &config.durable_cache_dir) {
            (Some(tier), _) => Some(tier),
            (None, Some(dir)) => Some(Arc::new(DurableTier::open(dir)?) as Arc<dyn CacheTier>),
            (None, None) => None,
        };

        let metrics = Arc::new(Metrics::new());
        let interpreter = ResponseInterpreter::from_config(&config);
        let tokens = TokenManager::new(
            store,
            Arc::clone(&transport),
            interpreter,
            Arc::clone(&clock),
            join_url(&config.base_url, &config.renew_path),
            config.renew_threshold(),
            Arc::clone(&metrics),
        );
        let mut cache = CacheLayer::new(Arc::clone(&clock)).with_refresh_ratio(config.refresh_ratio);
        if let Some(durable) = durable {
            cache = cache.with_durable(durable);
        }

        Ok(RequestOrchestrator {
            inner: Arc::new(Inner {
                retry_policy: RetryPolicy::from_config(&config),
                registry: Arc::new(RequestRegistry::new(clock)),
                config,
                transport,
                interpreter,
                tokens,
                cache,
                metrics,
                refreshing: Mutex::new(HashSet::new()),
            }),
        })
    }
}

#[cfg(feature = "http-transport")]
fn default_transport(config: &ClientConfig) -> Result<Arc<dyn Transport>, BuildError> {
    let transport = crate::transport::ReqwestTransport::new(config.request_timeout())?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http-transport"))]
fn default_transport(_config: &ClientConfig) -> Result<Arc<dyn Transport>, BuildError> {
    Err(BuildError::NoTransport)
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    interpreter: ResponseInterpreter,
    retry_policy: RetryPolicy,
    tokens: TokenManager,
    cache: CacheLayer,
    registry: Arc<RequestRegistry>,
    metrics: Arc<Metrics>,
    /// Cache keys with a background refresh in flight.
    refreshing: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("base_url", &self.inner.config.base_url)
            .field("registry", &self.inner.registry)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl RequestOrchestrator {
    pub fn builder(config: ClientConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            transport: None,
            store: None,
            clock: None,
            durable: None,
        }
    }

    /// Run one call and deserialize its data into `T`.
    ///
    /// Data that does not fit `T` is a `Fatal` contract failure.
    pub async fn call<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Outcome<T> {
        match self.call_value(descriptor).await {
            Outcome::Success(data) => match serde_json::from_value(data) {
                Ok(data) => Outcome::Success(data),
                Err(err) => {
                    self.inner.metrics.record_failure();
                    Outcome::Fatal(Failure::contract(format!("unexpected data shape: {err}")))
                }
            },
            Outcome::AuthExpired => Outcome::AuthExpired,
            Outcome::Transient(failure) => Outcome::Transient(failure),
            Outcome::Fatal(failure) => Outcome::Fatal(failure),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    /// Run one call and return the envelope's raw `data`.
    pub async fn call_value(&self, descriptor: RequestDescriptor) -> Outcome {
        let request_id = descriptor
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!(
            "call",
            method = %descriptor.method,
            url = %descriptor.url,
            request_id = %request_id,
        );

        async {
            if descriptor.is_cacheable() {
                let key = descriptor.cache_key();
                if let Some(hit) = self.inner.cache.get_entry(&key, TierSelection::VolatileFirst) {
                    self.inner.metrics.record_cache_hit();
                    debug!(key = %key, age_ms = hit.age.as_millis() as u64, "cache hit");
                    if self.inner.cache.needs_refresh(&hit) {
                        self.schedule_refresh(&descriptor, key);
                    }
                    return Outcome::Success(hit.data);
                }
                self.inner.metrics.record_cache_miss();
            }

            let outcome = self.inner.execute(&descriptor, &request_id).await;
            match outcome.failure() {
                Some(failure) => info!(outcome = outcome.label(), attempts = failure.attempts, "call finished"),
                None => debug!(outcome = outcome.label(), "call finished"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Fire-and-forget refresh of a cached entry. At most one per key; its
    /// failures are logged and dropped, leaving the cached value in place
    /// until its TTL lapses.
    fn schedule_refresh(&self, descriptor: &RequestDescriptor, key: String) {
        {
            let mut refreshing = self.inner.refreshing.lock().unwrap_or_else(|e| e.into_inner());
            if !refreshing.insert(key.clone()) {
                return;
            }
        }
        self.inner.metrics.record_background_refresh();

        let mut refresh = descriptor.clone();
        let request_id = format!("cache-refresh:{key}");
        refresh.id = Some(request_id.clone());
        let slot = RefreshSlot {
            inner: Arc::clone(&self.inner),
            key,
        };
        let span = info_span!("cache_refresh", key = %slot.key);

        tokio::spawn(
            async move {
                let outcome = slot.inner.execute(&refresh, &request_id).await;
                match outcome {
                    Outcome::Success(_) => debug!("background refresh stored"),
                    other => debug!(outcome = other.label(), "background refresh dropped"),
                }
                drop(slot);
            }
            .instrument(span),
        );
    }

    /// Publish a credential obtained at sign-in.
    pub fn login(&self, credential: &Credential) -> Result<(), StoreError> {
        self.inner.tokens.publish(credential)
    }

    /// Forget the credential, abort everything in flight, and drop in-memory cached data.
    pub fn logout(&self) {
        self.inner.tokens.clear();
        let cancelled = self.inner.registry.cancel_all();
        self.inner.cache.clear(TierSelection::Volatile);
        info!(cancelled, "logged out");
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.inner.registry.cancel(id)
    }

    pub fn cancel_context(&self, context: &str) -> usize {
        self.inner.registry.cancel_by_context(context)
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.registry.cancel_all()
    }

    /// Sweep registrations older than the configured staleness age.
    pub fn sweep_stale(&self) -> usize {
        self.inner.registry.sweep_stale(self.inner.config.stale_task_age())
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.cache.remove(key, TierSelection::VolatileFirst);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.inner.registry
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    /// Run one call under a single registration. The guard lives until the
    /// call returns, so cancellation by id, context, sweep, or a superseding
    /// call reaches it during renewal waits and backoff as well as attempts.
    async fn execute(&self, descriptor: &RequestDescriptor, request_id: &str) -> Outcome {
        let guard = self.registry.register(
            request_id,
            descriptor.context.clone(),
            CancellationToken::new(),
        );
        let outcome = self.run(descriptor, &guard).await;
        if outcome.is_cancelled() {
            self.metrics.record_cancellation();
        }
        outcome
    }

    async fn run(&self, descriptor: &RequestDescriptor, guard: &TaskGuard) -> Outcome {
        let mut attempts = 0u32;
        let mut retries_done = 0u32;
        let mut reissued = false;

        loop {
            if !guard.is_current() {
                return Outcome::Cancelled;
            }

            let credential = if descriptor.skip_auth {
                None
            } else {
                match unless_cancelled(guard, self.tokens.ensure_valid()).await {
                    None => return Outcome::Cancelled,
                    Some(Ok(credential)) => credential,
                    Some(Err(err)) => {
                        self.metrics.record_failure();
                        return Outcome::Fatal(err.into_failure().with_attempts(attempts));
                    }
                }
            };

            attempts += 1;
            let outcome = self.attempt(descriptor, guard, credential.as_ref(), attempts).await;

            if let RetryDecision::Retry { delay } =
                self.retry_policy.decide(&outcome, retries_done, descriptor.retry)
            {
                debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                self.metrics.record_retry();
                retries_done += 1;
                if unless_cancelled(guard, tokio::time::sleep(delay)).await.is_none() {
                    return Outcome::Cancelled;
                }
                continue;
            }

            match outcome {
                Outcome::Success(data) => return Outcome::Success(data),
                Outcome::Cancelled => return Outcome::Cancelled,
                Outcome::AuthExpired if descriptor.skip_auth => {
                    self.metrics.record_failure();
                    return Outcome::Fatal(Failure::auth("credential expired").with_attempts(attempts));
                }
                Outcome::AuthExpired if reissued => {
                    self.metrics.record_failure();
                    return Outcome::Fatal(
                        Failure::auth("credential rejected again after renewal").with_attempts(attempts),
                    );
                }
                Outcome::AuthExpired => {
                    reissued = true;
                    // Another call may already have renewed since this attempt was built.
                    let used = credential.map(|c| c.access_token);
                    let current = self.tokens.current().map(|c| c.access_token);
                    if used.is_some() && current.is_some() && used != current {
                        debug!("credential already renewed, re-issuing");
                        continue;
                    }
                    match unless_cancelled(guard, self.tokens.renew()).await {
                        None => return Outcome::Cancelled,
                        Some(Ok(_)) => {
                            info!("re-issuing request after renewal");
                            continue;
                        }
                        Some(Err(err)) => {
                            self.metrics.record_failure();
                            return Outcome::Fatal(err.into_failure().with_attempts(attempts));
                        }
                    }
                }
                Outcome::Transient(failure) => {
                    self.metrics.record_failure();
                    if descriptor.retry > 0 {
                        return Outcome::Fatal(RetryPolicy::exhausted(failure, attempts));
                    }
                    return Outcome::Transient(failure.with_attempts(attempts));
                }
                Outcome::Fatal(failure) => {
                    self.metrics.record_failure();
                    return Outcome::Fatal(failure.with_attempts(attempts));
                }
            }
        }
    }

    /// One transport round trip under the call's registration.
    async fn attempt(
        &self,
        descriptor: &RequestDescriptor,
        guard: &TaskGuard,
        credential: Option<&Credential>,
        attempt: u32,
    ) -> Outcome {
        let request = descriptor.build_request(&self.config.base_url, credential);

        self.metrics.record_request();
        debug!(attempt, "dispatching request");
        let raw = send_abortable(self.transport.as_ref(), request, guard.token().child_token()).await;
        let outcome = self.interpreter.interpret(raw);

        if !guard.is_current() {
            debug!(attempt, outcome = outcome.label(), "discarding response of cancelled request");
            return Outcome::Cancelled;
        }
        log_attempt(&outcome, attempt);

        if let Outcome::Success(data) = &outcome {
            if descriptor.is_cacheable() {
                let ttl = descriptor
                    .cache_ttl
                    .unwrap_or_else(|| self.config.default_cache_ttl());
                self.cache
                    .set_value(&descriptor.cache_key(), data.clone(), ttl, TierSelection::VolatileFirst);
            }
        }
        outcome
    }
}

/// Drive `fut` unless the call is cancelled first.
async fn unless_cancelled<F: Future>(guard: &TaskGuard, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = guard.token().cancelled() => None,
        output = fut => Some(output),
    }
}

/// Releases the per-key background refresh slot, even if the task is dropped.
struct RefreshSlot {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.inner
            .refreshing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

fn log_attempt(outcome: &Outcome<Value>, attempt: u32) {
    match outcome {
        Outcome::Success(_) => debug!(attempt, "attempt succeeded"),
        Outcome::Cancelled => debug!(attempt, "attempt cancelled"),
        Outcome::AuthExpired => warn!(attempt, "attempt rejected with expired credential"),
        Outcome::Transient(failure) => warn!(attempt, error = %failure, "attempt failed"),
        Outcome::Fatal(failure) => error!(attempt, error = %failure, kind = %failure.kind, "attempt failed"),
    }
}
