//! Network fetching behind an injectable trait.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};

use crate::{NetError, Request, Response};

/// Resolves a request to a response over some transport.
///
/// Non-2xx statuses are returned as responses, not errors; callers decide
/// whether a status is acceptable.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("offline-worker/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by a `reqwest` client.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
        })
    }
}
