//! Download capability: the trait the crawl engine talks to, and the
//! reqwest-backed fast fetcher. The headless-browser fetcher is an
//! optional second implementation slot, selected per request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::request::{DownloaderKind, Request};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Invalid proxy endpoint: {0}")]
    Proxy(String),

    #[error("Unsupported HTTP method: {0}")]
    Method(String),

    #[error("No downloader registered for {0:?}")]
    NoDownloader(DownloaderKind),
}

impl FetchError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }
        if error.is_body() || error.is_decode() {
            return FetchError::Body(error.to_string());
        }
        FetchError::Network(error.to_string())
    }
}

/// Buffered download result. Header names are stored lower-cased.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, req: &Request) -> Result<Response, FetchError>;
}

/// The fast fetcher: plain HTTP with per-request timeouts, redirect
/// policy, proxy binding and in-place retries. Clients are cached per
/// (proxy, redirect, timeout) shape so connection pools get reused.
pub struct HttpDownloader {
    clients: dashmap::DashMap<String, reqwest::Client>,
}

impl HttpDownloader {
    pub fn new() -> Self {
        Self {
            clients: dashmap::DashMap::new(),
        }
    }

    fn client_for(&self, req: &Request) -> Result<reqwest::Client, FetchError> {
        let key = format!(
            "{}|{}|{}|{}",
            req.proxy, req.redirect_limit, req.dial_timeout_ms, req.conn_timeout_ms
        );
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let client = self.build_client(req)?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    fn build_client(&self, req: &Request) -> Result<reqwest::Client, FetchError> {
        let mut builder = reqwest::Client::builder();
        if let Some(dial) = req.dial_timeout() {
            builder = builder.connect_timeout(dial);
        }
        if let Some(conn) = req.conn_timeout() {
            builder = builder.timeout(conn);
        }
        builder = builder.redirect(redirect_policy(req.redirect_limit));
        if !req.proxy.is_empty() {
            let proxy = reqwest::Proxy::all(&req.proxy)
                .map_err(|_| FetchError::Proxy(req.proxy.clone()))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        req: &Request,
    ) -> Result<Response, FetchError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| FetchError::Method(req.method.clone()))?;

        let mut builder = client.request(method, &req.url);
        for (name, values) in &req.header {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if req.method == "POST" && !req.post_data.is_empty() {
            if !req.header.contains_key("Content-Type") {
                builder = builder.header("Content-Type", "application/x-www-form-urlencoded");
            }
            builder = builder.body(req.post_data.clone());
        }

        let resp = builder.send().await.map_err(FetchError::from_reqwest)?;
        let status = resp.status();
        let url = resp.url().to_string();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in resp.headers() {
            if let Ok(text) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_default()
                    .push(text.to_string());
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_vec();

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(Response {
            url,
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, req: &Request) -> Result<Response, FetchError> {
        let client = self.client_for(req)?;
        let attempts = req.try_times.max(1);
        let mut last = FetchError::Network("no attempt made".to_string());
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(req.retry_pause()).await;
            }
            match self.attempt(&client, req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => last = err,
            }
        }
        Err(last)
    }
}

fn redirect_policy(limit: i32) -> reqwest::redirect::Policy {
    match limit {
        0 => reqwest::redirect::Policy::custom(|attempt| attempt.follow()),
        n if n < 0 => reqwest::redirect::Policy::none(),
        n => reqwest::redirect::Policy::limited(n as usize),
    }
}

/// Fetcher registry: the fast client always exists, a headless fetcher
/// may be plugged in by the embedding application.
pub struct DownloaderSet {
    fast: Arc<dyn Downloader>,
    headless: Option<Arc<dyn Downloader>>,
}

impl DownloaderSet {
    pub fn new(fast: Arc<dyn Downloader>) -> Self {
        Self {
            fast,
            headless: None,
        }
    }

    pub fn with_headless(mut self, headless: Arc<dyn Downloader>) -> Self {
        self.headless = Some(headless);
        self
    }

    /// The fetcher for a request; headless requests fall back to the fast
    /// client when no headless fetcher is registered.
    pub fn select(&self, kind: DownloaderKind) -> &Arc<dyn Downloader> {
        match kind {
            DownloaderKind::Fast => &self.fast,
            DownloaderKind::Headless => self.headless.as_ref().unwrap_or(&self.fast),
        }
    }
}
