use std::path::PathBuf;

use crate::status::Mode;

/// Crate-wide tuning constants.
pub struct Limits;

impl Limits {
    /// Upper bound on the crawler pool, regardless of queue length.
    pub const CRAWLER_POOL_CAP: usize = 50;
    /// Valid range for the global thread cap.
    pub const THREADS_MIN: usize = 1;
    pub const THREADS_MAX: usize = 99_999;
    /// Valid range for the output batch capacity.
    pub const BATCH_MIN: usize = 1;
    pub const BATCH_MAX: usize = 5_000_000;
    /// Smallest accepted pause reference, in milliseconds.
    pub const PAUSE_MIN_MS: u64 = 100;
    /// Spiders bundled into one dispatch task.
    pub const SPIDERS_PER_TASK: usize = 10;
    /// Proxy probe timeout and attempts.
    pub const PROBE_TIMEOUT_SECS: u64 = 4;
    pub const PROBE_ATTEMPTS: usize = 3;
    /// Concurrent proxy probes.
    pub const PROBE_PARALLELISM: usize = 1000;
}

/// Runtime configuration for one run. Distributed as part of a dispatch
/// task, so every field a worker needs to reproduce the run lives here.
#[derive(Debug, Clone)]
pub struct AppConf {
    pub mode: Mode,
    pub port: u16,
    pub master: String,
    /// Global concurrency cap (permit pool size).
    pub thread_num: usize,
    /// Pause reference in ms; actual sleep is uniform in [p/2, 2p].
    pub pause_ms: u64,
    /// Output sink name (`csv`, `jsonl`, ...).
    pub out_type: String,
    /// Output batch capacity: the pipeline flushes every `docker_cap` cells.
    pub docker_cap: usize,
    /// Crawl limit. 0 = unlimited; positive for spiders that declared a
    /// custom limit; otherwise applied as a request-count ceiling.
    pub limit: i64,
    /// Proxy rotation period in minutes. 0 disables proxies.
    pub proxy_minute: u64,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    /// Raw keyword input; multi-token values wrap each token in `<...>`.
    pub keywords: String,

    pub history_dir: PathBuf,
    pub text_dir: PathBuf,
    pub file_dir: PathBuf,
    pub proxy_file: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for AppConf {
    fn default() -> Self {
        Self {
            mode: Mode::Standalone,
            port: 0,
            master: String::new(),
            thread_num: 20,
            pause_ms: 300,
            out_type: "csv".to_string(),
            docker_cap: 10_000,
            limit: 0,
            proxy_minute: 0,
            success_inherit: true,
            failure_inherit: true,
            keywords: String::new(),
            history_dir: PathBuf::from("data/history"),
            text_dir: PathBuf::from("data/text"),
            file_dir: PathBuf::from("data/file"),
            proxy_file: PathBuf::from("data/proxy.lib"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConf {
    pub fn set_thread_num(&mut self, n: usize) -> &mut Self {
        self.thread_num = n.clamp(Limits::THREADS_MIN, Limits::THREADS_MAX);
        self
    }

    pub fn set_pause_ms(&mut self, ms: u64) -> &mut Self {
        self.pause_ms = ms.max(Limits::PAUSE_MIN_MS);
        self
    }

    pub fn set_docker_cap(&mut self, cap: usize) -> &mut Self {
        self.docker_cap = cap.clamp(Limits::BATCH_MIN, Limits::BATCH_MAX);
        self
    }

    pub fn set_limit(&mut self, limit: i64) -> &mut Self {
        self.limit = limit.max(0);
        self
    }

    pub fn set_out_type(&mut self, out: &str) -> &mut Self {
        self.out_type = out.to_string();
        self
    }
}
