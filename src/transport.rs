//! Transport seam: one HTTP exchange as a Tower service
//!
//! The executor drives any `Service<ApiRequest, Response = ApiResponse,
//! Error = BoxError>`. Non-success statuses are ordinary responses here; only
//! connection-level failures are errors. [`HttpTransport`] is the `reqwest`
//! implementation; tests substitute `tower::service_fn` fakes.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Url};
use tower::{BoxError, Service};

/// A GET against the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiRequest {
    /// Path relative to the transport's base URL
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Bearer credential, attached by the executor on every attempt
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Status, retry directive and raw body of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Source of the opaque bearer credential. Refresh happens elsewhere; this is
/// read once per attempt.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> Option<String>;
}

/// Fixed credential.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// No credential; for unauthenticated endpoints and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

#[async_trait]
impl TokenSource for NoToken {
    async fn token(&self) -> Option<String> {
        None
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, BoxError> {
        Self::with_client(Client::builder().build()?, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, BoxError> {
        // A trailing slash makes `join` append instead of replacing the last segment.
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

impl Service<ApiRequest> for HttpTransport {
    type Response = ApiResponse;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let client = self.client.clone();
        let url = self.base_url.join(req.path.trim_start_matches('/'));
        Box::pin(async move {
            let mut builder = client.get(url?).query(&req.query);
            if let Some(token) = &req.bearer {
                builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await?;
            Ok(ApiResponse {
                status,
                retry_after,
                body,
            })
        })
    }
}
