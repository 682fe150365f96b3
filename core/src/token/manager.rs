//! Credential renewal with single-flight semantics.
//!
//! # Design
//! At most one renewal call is ever in flight. The first caller that needs a
//! renewal spawns it as a task and parks a shared handle in `in_flight`;
//! every caller arriving before it resolves clones that handle and awaits it.
//! The task itself publishes the result: on success it saves the renewed
//! credential, on failure it clears the stored one. Waiters only read the
//! outcome.
//!
//! Renewal is a plain transport call without an authorization header and is
//! not registered with the request registry. Callers may stop waiting on it
//! when their own call is cancelled; the task runs to completion regardless.
//!
//! There is no retry loop here. A failed renewal is terminal for the current
//! credential; deciding to send the user back to sign-in is up to the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Failure, RenewError, StoreError};
use crate::http::{HttpMethod, HttpRequest};
use crate::interpret::ResponseInterpreter;
use crate::metrics::Metrics;
use crate::outcome::Outcome;
use crate::token::store::CredentialStore;
use crate::transport::{send_abortable, Transport};
use crate::types::{Credential, RenewRequest};

type RenewResult = Result<Credential, RenewError>;
type RenewFlight = Shared<BoxFuture<'static, RenewResult>>;

/// The renewal currently parked in `in_flight`.
struct Flight {
    id: u64,
    shared: RenewFlight,
    task: AbortHandle,
}

/// Everything the renewal future needs, cloned into it so it is `'static`.
#[derive(Clone)]
struct Renewer {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn Transport>,
    interpreter: ResponseInterpreter,
    renew_url: String,
}

pub struct TokenManager {
    renewer: Renewer,
    clock: Arc<dyn Clock>,
    threshold: chrono::Duration,
    metrics: Arc<Metrics>,
    in_flight: Mutex<Option<Flight>>,
    next_flight: AtomicU64,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("renew_url", &self.renewer.renew_url)
            .field("threshold", &self.threshold)
            .field("renewing", &self.is_renewing())
            .finish()
    }
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
        interpreter: ResponseInterpreter,
        clock: Arc<dyn Clock>,
        renew_url: impl Into<String>,
        threshold: chrono::Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            renewer: Renewer {
                store,
                transport,
                interpreter,
                renew_url: renew_url.into(),
            },
            clock,
            threshold,
            metrics,
            in_flight: Mutex::new(None),
            next_flight: AtomicU64::new(1),
        }
    }

    /// The stored credential. A store read error is logged and reads as none.
    pub fn current(&self) -> Option<Credential> {
        match self.renewer.store.load() {
            Ok(credential) => credential,
            Err(err) => {
                warn!(error = %err, "failed to load credential");
                None
            }
        }
    }

    /// Publish a credential obtained outside this layer, e.g. at sign-in.
    pub fn publish(&self, credential: &Credential) -> Result<(), StoreError> {
        self.renewer.store.save(credential)
    }

    pub fn clear(&self) {
        if let Err(err) = self.renewer.store.clear() {
            warn!(error = %err, "failed to clear credential");
        }
    }

    pub fn needs_renewal(&self, credential: &Credential) -> bool {
        credential.expires_within(self.clock.now(), self.threshold)
    }

    pub fn is_renewing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|flight| !flight.task.is_finished())
    }

    /// Credential to authorize the next request with.
    ///
    /// Fast path when there is no credential, it has no expiry, or it is not
    /// within the renewal threshold. Otherwise waits on `renew`.
    pub async fn ensure_valid(&self) -> Result<Option<Credential>, RenewError> {
        let Some(credential) = self.current() else {
            return Ok(None);
        };
        if !self.needs_renewal(&credential) {
            return Ok(Some(credential));
        }
        debug!("credential within renewal threshold");
        self.renew().await.map(Some)
    }

    /// Renew the credential, joining an in-flight renewal if there is one.
    ///
    /// The renewal runs as its own task, so it completes even when every
    /// caller waiting on it is dropped. A flight whose task has finished is
    /// never joined; the next caller starts a new one.
    pub async fn renew(&self) -> RenewResult {
        let (flight_id, flight) = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(flight) if !flight.task.is_finished() => {
                    debug!(flight = flight.id, "joining in-flight renewal");
                    (flight.id, flight.shared.clone())
                }
                _ => {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(self.renewer.clone().run());
                    let abort = task.abort_handle();
                    let shared = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(RenewError::Rejected(Failure::network(format!(
                                "renewal task failed: {err}"
                            ))))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(Flight {
                        id,
                        shared: shared.clone(),
                        task: abort,
                    });
                    self.metrics.record_renewal();
                    info!(flight = id, "renewing credential");
                    (id, shared)
                }
            }
        };

        let result = flight.await;

        let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|flight| flight.id == flight_id) {
            *slot = None;
        }
        result
    }
}

impl Renewer {
    async fn run(self) -> RenewResult {
        let result = self.request().await;
        match &result {
            Ok(credential) => {
                if let Err(err) = self.store.save(credential) {
                    error!(error = %err, "failed to persist renewed credential");
                    return Err(err.into());
                }
                info!("credential renewed");
            }
            Err(err) => {
                error!(error = %err, "credential renewal failed");
                if let Err(clear_err) = self.store.clear() {
                    warn!(error = %clear_err, "failed to clear credential after renewal failure");
                }
            }
        }
        result
    }

    async fn request(&self) -> RenewResult {
        let current = self.store.load()?.ok_or(RenewError::NoCredential)?;
        let refresh_token = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(RenewError::NoRefreshToken)?;

        let body = serde_json::to_string(&RenewRequest { refresh_token })
            .map_err(|e| RenewError::Rejected(Failure::contract(e.to_string())))?;
        let request = HttpRequest {
            method: HttpMethod::Post,
            path: self.renew_url.clone(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(body),
        };

        let raw = send_abortable(self.transport.as_ref(), request, CancellationToken::new()).await;
        match self.interpreter.interpret(raw) {
            Outcome::Success(data) => {
                let fresh: Credential = serde_json::from_value(data).map_err(|e| {
                    RenewError::Rejected(Failure::contract(format!("malformed renewal payload: {e}")))
                })?;
                Ok(current.renewed(fresh))
            }
            Outcome::AuthExpired => Err(RenewError::Rejected(Failure::auth("refresh token expired"))),
            Outcome::Transient(failure) | Outcome::Fatal(failure) => Err(RenewError::Rejected(failure)),
            Outcome::Cancelled => Err(RenewError::Rejected(Failure::network("renewal aborted"))),
        }
    }
}
