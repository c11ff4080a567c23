//! Crawl request model.
//!
//! A request is built by rule code (or deserialized from a failure record),
//! enqueued in its spider's matrix, dequeued once, and freed after parse.
//! Its identity for deduplication is `unique()`, a content hash over
//! spider, rule, URL and method that survives serialization.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default server dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(120);
/// Default whole-download timeout.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(120);
/// Default download attempts per dequeue.
pub const DEFAULT_TRY_TIMES: u32 = 3;
/// Default pause before an in-place download retry.
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Which fetcher handles this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloaderKind {
    /// Plain HTTP client: high concurrency, no script execution.
    #[default]
    Fast,
    /// Headless browser: slow, executes scripts. Interface only.
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    /// Owning spider name. Set by the context, not by rule code.
    pub spider: String,
    pub url: String,
    /// Rule node that parses the response.
    pub rule: String,
    /// GET, POST or HEAD. Normalized to upper case by `prepare`.
    pub method: String,
    pub header: HashMap<String, Vec<String>>,
    /// Inherited from the spider when queued through a context.
    pub enable_cookie: bool,
    pub post_data: String,
    /// Dial timeout in ms. 0 picks the default, negative means unlimited.
    pub dial_timeout_ms: i64,
    /// Download timeout in ms. 0 picks the default, negative means unlimited.
    pub conn_timeout_ms: i64,
    /// Download attempts per dequeue. 0 picks the default.
    pub try_times: u32,
    /// Pause between in-place retries, in ms.
    pub retry_pause_ms: u64,
    /// Redirect ceiling: 0 = unlimited, negative = redirects disabled.
    pub redirect_limit: i32,
    /// Opaque per-request scratch data; survives serialization.
    pub temp: HashMap<String, Value>,
    /// Scheduling priority; higher is served first.
    pub priority: u32,
    /// Reloadable requests bypass dedup and may be admitted repeatedly.
    pub reloadable: bool,
    pub downloader: DownloaderKind,
    /// Chosen proxy endpoint, attached just before download. Not persisted.
    #[serde(skip)]
    pub proxy: String,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            spider: String::new(),
            url: String::new(),
            rule: String::new(),
            method: String::new(),
            header: HashMap::new(),
            enable_cookie: false,
            post_data: String::new(),
            dial_timeout_ms: 0,
            conn_timeout_ms: 0,
            try_times: 0,
            retry_pause_ms: 0,
            redirect_limit: 0,
            temp: HashMap::new(),
            priority: 0,
            reloadable: false,
            downloader: DownloaderKind::Fast,
            proxy: String::new(),
        }
    }
}

impl Request {
    pub fn new(url: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            rule: rule.into(),
            ..Default::default()
        }
    }

    /// Validates the URL and fills defaults. Must run before a request is
    /// admitted to a matrix.
    pub fn prepare(&mut self) -> Result<(), url::ParseError> {
        let parsed = url::Url::parse(&self.url)?;
        self.url = parsed.to_string();

        if self.method.is_empty() {
            self.method = "GET".to_string();
        } else {
            self.method = self.method.to_uppercase();
        }

        if self.dial_timeout_ms == 0 {
            self.dial_timeout_ms = DEFAULT_DIAL_TIMEOUT.as_millis() as i64;
        }
        if self.conn_timeout_ms == 0 {
            self.conn_timeout_ms = DEFAULT_CONN_TIMEOUT.as_millis() as i64;
        }
        if self.try_times == 0 {
            self.try_times = DEFAULT_TRY_TIMES;
        }
        if self.retry_pause_ms == 0 {
            self.retry_pause_ms = DEFAULT_RETRY_PAUSE.as_millis() as u64;
        }
        Ok(())
    }

    /// Stable content-addressed identity: `md5(spider || rule || url || method)`.
    pub fn unique(&self) -> String {
        let digest = md5::compute(format!(
            "{}{}{}{}",
            self.spider, self.rule, self.url, self.method
        ));
        format!("{digest:x}")
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        match self.dial_timeout_ms {
            n if n < 0 => None,
            0 => Some(DEFAULT_DIAL_TIMEOUT),
            n => Some(Duration::from_millis(n as u64)),
        }
    }

    pub fn conn_timeout(&self) -> Option<Duration> {
        match self.conn_timeout_ms {
            n if n < 0 => None,
            0 => Some(DEFAULT_CONN_TIMEOUT),
            n => Some(Duration::from_millis(n as u64)),
        }
    }

    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn referer(&self) -> Option<&str> {
        self.header
            .get("Referer")
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn set_referer(&mut self, referer: impl Into<String>) -> &mut Self {
        self.header.insert("Referer".to_string(), vec![referer.into()]);
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.header.insert(key.into(), vec![value.into()]);
        self
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.header
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn temp_get(&self, key: &str) -> Option<&Value> {
        self.temp.get(key)
    }

    pub fn temp_set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.temp.insert(key.into(), value.into());
        self
    }

    /// Serializes the request for the failure record.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Rebuilds a request from a failure record. Proxy assignment is not
    /// carried over; it is re-chosen at the next pull.
    pub fn deserialize(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(url: &str, rule: &str, method: &str) -> Request {
        let mut req = Request::new(url, rule);
        req.spider = "demo".to_string();
        req.method = method.to_string();
        req.prepare().unwrap();
        req
    }

    #[test]
    fn prepare_applies_defaults() {
        let req = prepared("http://example.test/a", "list", "");
        assert_eq!(req.method, "GET");
        assert_eq!(req.try_times, DEFAULT_TRY_TIMES);
        assert_eq!(req.retry_pause(), DEFAULT_RETRY_PAUSE);
        assert_eq!(req.conn_timeout(), Some(DEFAULT_CONN_TIMEOUT));
    }

    #[test]
    fn prepare_rejects_bad_url() {
        let mut req = Request::new("not a url", "list");
        assert!(req.prepare().is_err());
    }

    #[test]
    fn unique_is_stable_md5() {
        let req = prepared("http://example.test/a", "p", "get");
        let want = format!("{:x}", md5::compute("demophttp://example.test/aGET"));
        assert_eq!(req.unique(), want);
        // identity ignores mutable extras
        let mut other = req.clone();
        other.priority = 9;
        other.temp_set("page", 3);
        assert_eq!(other.unique(), req.unique());
    }

    #[test]
    fn serde_round_trip() {
        let mut req = prepared("http://example.test/a?q=1&x=2", "list", "POST");
        req.post_data = "a=b".to_string();
        req.temp_set("depth", 2);
        req.set_referer("http://example.test/");
        req.proxy = "http://127.0.0.1:8888".to_string();

        let back = Request::deserialize(&req.serialize()).unwrap();
        assert_eq!(back.url, req.url);
        assert_eq!(back.method, "POST");
        assert_eq!(back.unique(), req.unique());
        assert_eq!(back.temp_get("depth"), Some(&Value::from(2)));
        assert_eq!(back.referer(), Some("http://example.test/"));
        // proxy is transient
        assert!(back.proxy.is_empty());
    }

    #[test]
    fn negative_timeout_means_unlimited() {
        let mut req = Request::new("http://example.test/", "r");
        req.dial_timeout_ms = -1;
        req.conn_timeout_ms = -1;
        req.prepare().unwrap();
        assert_eq!(req.dial_timeout(), None);
        assert_eq!(req.conn_timeout(), None);
    }
}
