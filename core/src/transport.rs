//! The transport collaborator.
//!
//! # Design
//! The host supplies the actual HTTP primitive. The layer only needs
//! `send(request) -> response | error` plus an abort handle per call, which
//! is the `CancellationToken` passed alongside the request. Implementations
//! should stop work and return `TransportError::Aborted` once it fires;
//! `send_abortable` also races the token so a transport that ignores it is
//! still abandoned promptly.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request`. Non-2xx responses are returned as data.
    async fn send(
        &self,
        request: HttpRequest,
        abort: CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

/// Run `send`, resolving to `Aborted` as soon as `abort` fires.
pub(crate) async fn send_abortable(
    transport: &dyn Transport,
    request: HttpRequest,
    abort: CancellationToken,
) -> Result<HttpResponse, TransportError> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => Err(TransportError::Aborted),
        result = transport.send(request, abort.clone()) => result,
    }
}

#[cfg(feature = "http-transport")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "http-transport")]
mod reqwest_transport {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::Transport;
    use crate::error::TransportError;
    use crate::http::{HttpMethod, HttpRequest, HttpResponse};

    /// reqwest-backed transport. The request timeout lives here; the
    /// orchestrator never times calls out itself.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(timeout: Duration) -> Result<Self, TransportError> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok(Self { client })
        }

        pub fn from_client(client: reqwest::Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(
            &self,
            request: HttpRequest,
            abort: CancellationToken,
        ) -> Result<HttpResponse, TransportError> {
            let method = match request.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
                HttpMethod::Put => reqwest::Method::PUT,
                HttpMethod::Patch => reqwest::Method::PATCH,
                HttpMethod::Delete => reqwest::Method::DELETE,
            };
            let mut builder = self.client.request(method, &request.path);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let exchange = async {
                let response = builder.send().await.map_err(map_error)?;
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect();
                let bytes = response.bytes().await.map_err(map_error)?;
                Ok(HttpResponse {
                    status,
                    headers,
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                })
            };

            tokio::select! {
                biased;
                _ = abort.cancelled() => Err(TransportError::Aborted),
                result = exchange => result,
            }
        }
    }

    fn map_error(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Io(err.to_string())
        }
    }
}
