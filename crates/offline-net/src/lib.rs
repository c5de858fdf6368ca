//! # Offline Net
//!
//! Request and response types for the offline worker, plus the [`Fetcher`]
//! seam used to pull static resources off the network during install.
//!
//! ## Design Goals
//!
//! 1. **Owned, cloneable responses**: cached entries are replayed verbatim
//! 2. **Request modes**: navigation requests are distinguishable from subresources
//! 3. **Injectable network**: the worker never talks to `reqwest` directly

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::Url;

pub mod fetch;

pub use fetch::{Fetcher, HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the request was initiated, as seen by a fetch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Opaque cross-origin subresource.
    NoCors,
    /// Script-initiated fetch.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
        }
    }

    /// Create a navigation request for a top-level page.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Check if this is a navigation request.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Final URL, absent for synthetic responses.
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Create a response with no headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Synthetic 404 with an empty body.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, Bytes::new())
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}
