//! Per-host proxy pool with latency ranking and tick-driven rotation.
//!
//! Candidates come from a free-form text file. Each candidate is
//! liveness-probed on refresh; the first request for a host triggers a
//! test-and-sort pass that measures HEAD latency through every live
//! candidate and keeps the responsive ones ordered fastest-first. A
//! rotation tick advances the per-host cursor; running off the end of the
//! list re-tests and re-sorts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Limits;

/// Reachability and latency probes, injectable for tests.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    /// One TCP reachability attempt against `endpoint` (`host:port`).
    async fn reachable(&self, endpoint: &str) -> bool;
    /// HEAD `origin` through `proxy`; latency only for a 200 response.
    async fn measure(&self, proxy: &str, origin: &str) -> Option<Duration>;
}

/// Default prober: TCP connect for liveness, reqwest HEAD for ranking.
pub struct NetProber;

#[async_trait]
impl ProxyProber for NetProber {
    async fn reachable(&self, endpoint: &str) -> bool {
        let timeout = Duration::from_secs(Limits::PROBE_TIMEOUT_SECS);
        matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(endpoint)).await,
            Ok(Ok(_))
        )
    }

    async fn measure(&self, proxy: &str, origin: &str) -> Option<Duration> {
        let timeout = Duration::from_secs(Limits::PROBE_TIMEOUT_SECS);
        let proxied = reqwest::Proxy::all(proxy).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxied)
            .timeout(timeout)
            .build()
            .ok()?;
        let started = Instant::now();
        let resp = client.head(origin).send().await.ok()?;
        if resp.status() == reqwest::StatusCode::OK {
            Some(started.elapsed())
        } else {
            None
        }
    }
}

struct Candidate {
    /// `host:port` used for the liveness probe.
    endpoint: String,
    alive: bool,
}

#[derive(Default)]
struct HostView {
    proxies: Vec<String>,
    latencies: Vec<Duration>,
    cursor: usize,
    /// Log the chosen proxy on its next use.
    announce: bool,
    /// Whether a test-and-sort pass has run for this host.
    tested: bool,
}

struct Rotation {
    period: Option<Duration>,
    last: Instant,
}

pub struct ProxyPool {
    path: PathBuf,
    ip_form: Regex,
    url_form: Regex,
    candidates: Mutex<HashMap<String, Candidate>>,
    online: AtomicUsize,
    views: Mutex<HashMap<String, HostView>>,
    rotation: Mutex<Rotation>,
    probe_limit: Arc<Semaphore>,
    prober: Arc<dyn ProxyProber>,
}

impl ProxyPool {
    pub fn new(path: PathBuf) -> Self {
        Self::with_prober(path, Arc::new(NetProber))
    }

    pub fn with_prober(path: PathBuf, prober: Arc<dyn ProxyProber>) -> Self {
        Self {
            path,
            ip_form: Regex::new(
                r"(?:https?|socks5)://(?:\w+:\w+@)?(?:\d{1,3}\.){3}\d{1,3}:\d{1,5}",
            )
            .expect("static regex"),
            url_form: Regex::new(
                r"(?:(?:https?|socks5)://)?(?:[\w.-]+:[\w.-]+@)?([A-Za-z][\w-]*(?:\.[\w-]+)+)(?::(\d{1,5}))?",
            )
            .expect("static regex"),
            candidates: Mutex::new(HashMap::new()),
            online: AtomicUsize::new(0),
            views: Mutex::new(HashMap::new()),
            rotation: Mutex::new(Rotation {
                period: None,
                last: Instant::now(),
            }),
            probe_limit: Arc::new(Semaphore::new(Limits::PROBE_PARALLELISM)),
            prober,
        }
    }

    /// Reloads the candidate file and re-runs the liveness probe.
    pub async fn refresh(&self) {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return,
        };

        let mut parsed: HashMap<String, String> = HashMap::new();
        for m in self.ip_form.find_iter(&text) {
            let raw = m.as_str();
            if let Some(endpoint) = raw
                .rsplit('@')
                .next()
                .and_then(|tail| tail.split("//").last())
            {
                parsed.insert(raw.to_string(), endpoint.to_string());
            }
        }
        for caps in self.url_form.captures_iter(&text) {
            let raw = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
            let host = match caps.get(1) {
                Some(h) => h.as_str().to_string(),
                None => continue,
            };
            let port = caps.get(2).map(|p| p.as_str()).unwrap_or("80");
            let normalized = if raw.contains("://") {
                raw
            } else {
                format!("http://{raw}")
            };
            parsed
                .entry(normalized)
                .or_insert_with(|| format!("{host}:{port}"));
        }

        info!(candidates = parsed.len(), "proxy candidates loaded");
        {
            let mut all = self.candidates.lock();
            for (proxy, endpoint) in parsed {
                all.entry(proxy).or_insert(Candidate {
                    endpoint,
                    alive: false,
                });
            }
        }

        self.probe_alive().await;
    }

    async fn probe_alive(&self) {
        let targets: Vec<(String, String)> = self
            .candidates
            .lock()
            .iter()
            .map(|(proxy, c)| (proxy.clone(), c.endpoint.clone()))
            .collect();

        let mut probes = JoinSet::new();
        for (proxy, endpoint) in targets {
            let limit = Arc::clone(&self.probe_limit);
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let mut alive = false;
                for _ in 0..Limits::PROBE_ATTEMPTS {
                    if prober.reachable(&endpoint).await {
                        alive = true;
                        break;
                    }
                }
                (proxy, alive)
            });
        }

        let mut online = 0usize;
        while let Some(joined) = probes.join_next().await {
            let Ok((proxy, alive)) = joined else { continue };
            if alive {
                online += 1;
            }
            if let Some(c) = self.candidates.lock().get_mut(&proxy) {
                c.alive = alive;
            }
        }
        self.online.store(online, Ordering::Relaxed);
        info!(online, "proxy liveness probe finished");
    }

    /// Number of candidates that answered the liveness probe.
    pub fn count(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    /// Configures the rotation period and schedules every known host view
    /// to advance on its next use.
    pub fn set_rotation(&self, minutes: u64) {
        self.set_rotation_period(Duration::from_secs(minutes * 60));
    }

    pub(crate) fn set_rotation_period(&self, period: Duration) {
        {
            let mut rotation = self.rotation.lock();
            rotation.period = Some(period);
            rotation.last = Instant::now();
        }
        let mut views = self.views.lock();
        for view in views.values_mut() {
            view.cursor += 1;
            view.announce = true;
        }
    }

    /// Picks the proxy to use for the next request to `target`'s host.
    /// Returns `None` when no candidate is usable for that host.
    pub async fn get_one(&self, target: &str) -> Option<String> {
        if self.count() == 0 {
            return None;
        }
        let parsed = url::Url::parse(target).ok()?;
        let host = parsed.host_str()?;
        let key = host_key(host);
        let origin = format!("{}://{}", parsed.scheme(), host);

        let ticked = {
            let mut rotation = self.rotation.lock();
            match rotation.period {
                Some(period) if rotation.last.elapsed() >= period => {
                    rotation.last = Instant::now();
                    true
                }
                _ => false,
            }
        };

        let needs_sort = {
            let mut views = self.views.lock();
            let view = views.entry(key.clone()).or_default();
            if ticked {
                view.cursor += 1;
                view.announce = true;
                !view.tested || view.cursor >= view.proxies.len()
            } else if !view.tested {
                view.announce = true;
                true
            } else if view.proxies.is_empty() {
                debug!(host = %key, "no usable proxy for host");
                return None;
            } else if view.cursor >= view.proxies.len() {
                view.announce = true;
                true
            } else {
                false
            }
        };

        if needs_sort && !self.test_and_sort(&key, &origin).await {
            debug!(host = %key, "no usable proxy for host");
            return None;
        }

        let mut views = self.views.lock();
        let view = views.get_mut(&key)?;
        if view.proxies.is_empty() {
            return None;
        }
        let chosen = view.proxies[view.cursor].clone();
        if view.announce {
            info!(
                proxy = %chosen,
                latency_ms = view.latencies[view.cursor].as_millis() as u64,
                host = %key,
                "proxy selected"
            );
            view.announce = false;
        }
        Some(chosen)
    }

    /// Measures every live candidate against `origin`, keeps those that
    /// answered 200, sorted ascending by latency, and resets the cursor.
    async fn test_and_sort(&self, key: &str, origin: &str) -> bool {
        let live: Vec<String> = self
            .candidates
            .lock()
            .iter()
            .filter(|(_, c)| c.alive)
            .map(|(proxy, _)| proxy.clone())
            .collect();

        let mut probes = JoinSet::new();
        for proxy in live {
            let limit = Arc::clone(&self.probe_limit);
            let prober = Arc::clone(&self.prober);
            let origin = origin.to_string();
            probes.spawn(async move {
                let _permit = limit.acquire_owned().await;
                let latency = prober.measure(&proxy, &origin).await;
                (proxy, latency)
            });
        }

        let mut ranked: Vec<(String, Duration)> = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok((proxy, Some(latency))) = joined {
                ranked.push((proxy, latency));
            }
        }
        ranked.sort_by_key(|(_, latency)| *latency);

        let usable = !ranked.is_empty();
        if usable {
            info!(host = %key, usable = ranked.len(), "proxy ranking refreshed");
        } else {
            warn!(host = %key, "proxy ranking found no usable candidates");
        }

        let mut views = self.views.lock();
        let view = views.entry(key.to_string()).or_default();
        view.proxies = ranked.iter().map(|(p, _)| p.clone()).collect();
        view.latencies = ranked.iter().map(|(_, l)| *l).collect();
        view.cursor = 0;
        view.tested = true;
        usable
    }
}

/// Hosts are grouped by their last two labels so `a.example.test` and
/// `b.example.test` share one ranked view.
fn host_key(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() > 2 {
        labels[labels.len() - 2..].join(".")
    } else {
        host.to_string()
    }
}
