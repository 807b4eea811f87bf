//! HTTP forwarding to hosted chains and peer nodes
//!
//! Requests are bounded by the configured RPC timeout. Connection failures
//! are retried with exponential backoff inside a short window; everything
//! else fails immediately.

use crate::chains::HostedChain;
use backoff::ExponentialBackoff;
use reqwest::{Client, Method};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use vipernet_core::{Relay, RelayPayload, RelayResponse};

/// Path peers serve relays on
pub const RELAY_PATH: &str = "/v1/client/relay";

/// Default retry window for connection failures
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid http method {0}")]
    InvalidMethod(String),
    #[error("chain {0} has no websocket endpoint")]
    NoWebsocket(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl UpstreamError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Http(err)
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Http(e) if e.is_connect())
    }
}

/// Join a base url and a relay path without doubling slashes.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Shared HTTP client for upstream chains and peer servicers
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    http: Client,
    timeout: Duration,
    retry_window: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        Self::with_retry_window(timeout, DEFAULT_RETRY_WINDOW)
    }

    pub fn with_retry_window(
        timeout: Duration,
        retry_window: Duration,
    ) -> Result<Self, UpstreamError> {
        let http = Client::builder().timeout(timeout).gzip(true).build()?;
        Ok(Self {
            http,
            timeout,
            retry_window,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(200),
            max_elapsed_time: Some(self.retry_window),
            ..Default::default()
        }
    }

    /// Forward a relay payload to a hosted chain and return the body.
    ///
    /// The method defaults to POST; headers and basic auth are applied as
    /// configured. gzip responses are decoded transparently.
    pub async fn execute(
        &self,
        chain: &HostedChain,
        payload: &RelayPayload,
    ) -> Result<String, UpstreamError> {
        let method = if payload.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(payload.method.to_uppercase().as_bytes())
                .map_err(|_| UpstreamError::InvalidMethod(payload.method.clone()))?
        };
        let url = join_url(&chain.url, &payload.path);

        let op = || async {
            let mut request = self.http.request(method.clone(), &url);
            let mut has_content_type = false;
            for (name, value) in &payload.headers {
                has_content_type |= name.eq_ignore_ascii_case("content-type");
                request = request.header(name.as_str(), value.as_str());
            }
            if !has_content_type {
                request = request.header("content-type", "application/json");
            }
            if let Some(auth) = &chain.basic_auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }
            if !payload.data.is_empty() {
                request = request.body(payload.data.clone());
            }
            self.read_body(request.send().await).await.map_err(classify)
        };

        let body = backoff::future::retry(self.backoff(), op).await.map_err(|e| {
            warn!(chain = %chain.id, url = %url, error = %e, "upstream request failed");
            e
        })?;
        debug!(chain = %chain.id, bytes = body.len(), "upstream response");
        Ok(body)
    }

    /// Send a relay to a peer servicer's RPC endpoint.
    pub async fn send_relay(
        &self,
        service_url: &str,
        relay: &Relay,
    ) -> Result<RelayResponse, UpstreamError> {
        let url = join_url(service_url, RELAY_PATH);
        let response = self
            .http
            .post(&url)
            .json(relay)
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<RelayResponse>()
            .await
            .map_err(UpstreamError::from_reqwest)
    }

    async fn read_body(
        &self,
        sent: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<String, UpstreamError> {
        let response = sent.map_err(UpstreamError::from_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(UpstreamError::from_reqwest)?;
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn classify(err: UpstreamError) -> backoff::Error<UpstreamError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::Router;
    use std::collections::BTreeMap;
    use vipernet_core::ChainId;

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route("/", post(|body: String| async move { format!("echo:{body}") }))
            .route(
                "/v1/status",
                get(|headers: HeaderMap| async move {
                    headers
                        .get("authorization")
                        .map(|v| v.to_str().unwrap_or_default().to_string())
                        .unwrap_or_else(|| "anonymous".to_string())
                }),
            )
            .route(
                "/slow",
                post(|| async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn chain(url: String) -> HostedChain {
        HostedChain {
            id: ChainId::new("0001").unwrap(),
            url,
            websocket_url: None,
            basic_auth: None,
        }
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a/", "/b"), "http://a/b");
        assert_eq!(join_url("http://a", "b"), "http://a/b");
        assert_eq!(join_url("http://a", ""), "http://a");
    }

    #[tokio::test]
    async fn test_execute_defaults_to_post() {
        let url = spawn_upstream().await;
        let client = UpstreamClient::new(Duration::from_secs(2)).unwrap();
        let payload = RelayPayload {
            data: "foo".into(),
            ..Default::default()
        };
        let body = client.execute(&chain(url), &payload).await.unwrap();
        assert_eq!(body, "echo:foo");
    }

    #[tokio::test]
    async fn test_execute_with_method_path_and_auth() {
        let url = spawn_upstream().await;
        let client = UpstreamClient::new(Duration::from_secs(2)).unwrap();
        let mut hosted = chain(url);
        hosted.basic_auth = Some(crate::chains::BasicAuth {
            username: "user".into(),
            password: "pass".into(),
        });
        let payload = RelayPayload {
            data: String::new(),
            method: "get".into(),
            path: "/v1/status".into(),
            headers: BTreeMap::new(),
        };
        let body = client.execute(&hosted, &payload).await.unwrap();
        assert!(body.starts_with("Basic "));
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let url = spawn_upstream().await;
        let client = UpstreamClient::new(Duration::from_millis(50)).unwrap();
        let payload = RelayPayload {
            data: "x".into(),
            path: "/slow".into(),
            ..Default::default()
        };
        let err = client.execute(&chain(url), &payload).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout));
    }

    #[tokio::test]
    async fn test_status_error_surfaces() {
        let url = spawn_upstream().await;
        let client = UpstreamClient::new(Duration::from_secs(2)).unwrap();
        let payload = RelayPayload {
            data: "x".into(),
            path: "/missing".into(),
            ..Default::default()
        };
        let err = client.execute(&chain(url), &payload).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        let client =
            UpstreamClient::with_retry_window(Duration::from_secs(1), Duration::from_millis(100))
                .unwrap();
        let payload = RelayPayload {
            data: "x".into(),
            ..Default::default()
        };
        let result = client
            .execute(&chain("http://127.0.0.1:1".into()), &payload)
            .await;
        assert!(matches!(result, Err(UpstreamError::Http(_))));
    }
}
