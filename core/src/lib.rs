//! Authenticated request layer for a JSON envelope API.
//!
//! # Overview
//! Every call goes through one `RequestOrchestrator::call` and comes back as
//! an `Outcome`: success with typed data, an expired credential, a transient
//! or fatal failure, or cancellation. Around that single contract the crate
//! keeps a two-tier response cache, a registry of in-flight calls that can
//! be cancelled by id or context, and a credential that is renewed at most
//! once at a time no matter how many calls notice it expiring.
//!
//! # Design
//! - The network sits behind the `Transport` trait. `ReqwestTransport` is the
//!   default (feature `http-transport`); tests script their own.
//! - Credential storage and durable caching are collaborators too
//!   (`CredentialStore`, `CacheTier`), with in-memory and file-backed impls.
//! - Time comes from an injected `Clock` so TTL and expiry logic is testable
//!   without sleeping.
//! - Classification of responses lives in `ResponseInterpreter` and nowhere
//!   else. The orchestrator only reacts to `Outcome` variants.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod interpret;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod request;
pub mod retry;
pub mod token;
pub mod transport;
pub mod types;

pub use cache::{CacheHit, CacheLayer, CacheTier, DurableTier, TierSelection, VolatileTier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ConfigError};
pub use error::{ErrorKind, Failure, RenewError, StoreError, TransportError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use interpret::ResponseInterpreter;
pub use metrics::MetricsSnapshot;
pub use orchestrator::{BuildError, OrchestratorBuilder, RequestOrchestrator};
pub use outcome::Outcome;
pub use registry::{RequestRegistry, TaskGuard};
pub use request::RequestDescriptor;
pub use retry::{RetryDecision, RetryPolicy};
pub use token::{CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenManager};
pub use transport::Transport;
#[cfg(feature = "http-transport")]
pub use transport::ReqwestTransport;
pub use types::{Credential, Envelope};
