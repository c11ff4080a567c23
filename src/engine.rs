//! Engine facade: lifecycle, mode routing and config distribution.
//!
//! Standalone runs execute the prepared spider queue locally. A master
//! prepares the same queue, chunks it into dispatch tasks and serves them
//! to workers. A worker pulls tasks, overwrites its runtime config from
//! each task, rebuilds its spider queue and runs the standalone flow.

use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::{AppConf, Limits};
use crate::counters::{PageStats, Report};
use crate::crawler::CrawlerSeed;
use crate::crawler_pool::CrawlerPool;
use crate::dispatch::{
    master_api, worker_api, Dispatcher, Task, TaskJar, TaskSpider,
};
use crate::downloader::{DownloaderSet, HttpDownloader};
use crate::output::{CsvSink, JsonLinesSink, SinkFactory};
use crate::pipeline::PipelineSettings;
use crate::proxy::ProxyPool;
use crate::scheduler::Scheduler;
use crate::spider::{Spider, CUSTOM_LIMIT};
use crate::spider_queue::SpiderQueue;
use crate::status::{Mode, RunState};

const PAUSE_POLL: Duration = Duration::from_secs(1);
const TASK_POLL: Duration = Duration::from_millis(200);

/// Cloneable control surface for a running engine: pause, resume and
/// stop from another task while `Engine::run` holds the engine itself.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<RwLock<RunState>>,
    scheduler: Arc<Scheduler>,
    pool: Arc<CrawlerPool>,
    active: Arc<parking_lot::Mutex<Vec<Arc<Spider>>>>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl EngineHandle {
    /// Toggles between running and paused.
    pub fn pause_recover(&self) {
        {
            let mut state = self.state.write();
            *state = match *state {
                RunState::Running => RunState::Paused,
                RunState::Paused => RunState::Running,
                other => other,
            };
        }
        self.scheduler.pause_recover();
    }

    /// Signals stop everywhere and waits until the run loop lands in
    /// `Stopped`. Safe to call more than once.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopping;
        }
        self.scheduler.stop();
        self.pool.stop();
        for spider in self.active.lock().iter() {
            spider.stop();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.close();
        }
        while *self.state.read() != RunState::Stopped {
            sleep(PAUSE_POLL).await;
        }
    }
}

pub struct Engine {
    conf: AppConf,
    library: Vec<Arc<Spider>>,
    queue: SpiderQueue,
    pool: Arc<CrawlerPool>,
    scheduler: Arc<Scheduler>,
    stats: Arc<PageStats>,
    jar: Arc<TaskJar>,
    dispatcher: Option<Arc<Dispatcher>>,
    report_tx: flume::Sender<Report>,
    report_rx: flume::Receiver<Report>,
    state: Arc<RwLock<RunState>>,
    /// Spiders of the current run, for the stop path.
    active: Arc<parking_lot::Mutex<Vec<Arc<Spider>>>>,
    downloaders: Arc<DownloaderSet>,
    sink_factory: Option<SinkFactory>,
    /// Lines to forward to the master when running as a worker.
    log_lines: Option<flume::Receiver<String>>,
}

impl Engine {
    pub fn new(conf: AppConf) -> Self {
        let (report_tx, report_rx) = flume::unbounded();
        let scheduler = Scheduler::new(ProxyPool::new(conf.proxy_file.clone()));
        Self {
            conf,
            library: Vec::new(),
            queue: SpiderQueue::new(),
            pool: Arc::new(CrawlerPool::new()),
            scheduler,
            stats: Arc::new(PageStats::new()),
            jar: Arc::new(TaskJar::new()),
            dispatcher: None,
            report_tx,
            report_rx,
            state: Arc::new(RwLock::new(RunState::Stopped)),
            active: Arc::new(parking_lot::Mutex::new(Vec::new())),
            downloaders: Arc::new(DownloaderSet::new(Arc::new(HttpDownloader::new()))),
            sink_factory: None,
            log_lines: None,
        }
    }

    /// Registers a base spider in the library.
    pub fn register(&mut self, spider: Spider) -> &mut Self {
        self.library.push(Arc::new(spider));
        self
    }

    pub fn library(&self) -> &[Arc<Spider>] {
        &self.library
    }

    pub fn conf(&self) -> &AppConf {
        &self.conf
    }

    pub fn conf_mut(&mut self) -> &mut AppConf {
        &mut self.conf
    }

    pub fn stats(&self) -> &Arc<PageStats> {
        &self.stats
    }

    /// Replaces the fetcher set (tests and embedders).
    pub fn set_downloaders(&mut self, downloaders: Arc<DownloaderSet>) -> &mut Self {
        self.downloaders = downloaders;
        self
    }

    /// Replaces the sink factory (tests and embedders).
    pub fn set_sink_factory(&mut self, factory: SinkFactory) -> &mut Self {
        self.sink_factory = Some(factory);
        self
    }

    /// Feeds formatted log lines for forwarding in worker mode.
    pub fn set_log_lines(&mut self, rx: flume::Receiver<String>) -> &mut Self {
        self.log_lines = Some(rx);
        self
    }

    /// Brings up the dispatch endpoint for the configured mode. Must run
    /// before `run` in master or worker mode.
    pub async fn init(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        match self.conf.mode {
            Mode::Standalone => {}
            Mode::Master => {
                if self.conf.port == 0 {
                    return Err("master mode requires a port".into());
                }
                let dispatcher = Dispatcher::master(master_api(Arc::clone(&self.jar)));
                dispatcher.serve(self.conf.port).await?;
                self.dispatcher = Some(dispatcher);
            }
            Mode::Worker => {
                if self.conf.master.is_empty() || self.conf.port == 0 {
                    return Err("worker mode requires a master address and port".into());
                }
                let uid = format!("worker-{}", std::process::id());
                let dispatcher = Dispatcher::worker(uid, worker_api(Arc::clone(&self.jar)));
                dispatcher.connect(self.conf.master.clone(), self.conf.port);
                self.spawn_log_forwarding(&dispatcher);
                self.dispatcher = Some(dispatcher);
            }
        }
        Ok(())
    }

    /// Builds the run queue from `selection` (base-library spiders):
    /// fresh copies, pause and limit from the global config, then the
    /// keyword cross-product.
    pub fn spider_prepare(&mut self, selection: &[Arc<Spider>]) -> &mut Self {
        self.queue.reset();
        for base in selection {
            let copy = base.copy();
            copy.set_pause_reference(self.conf.pause_ms, false);
            if copy.limit() == CUSTOM_LIMIT {
                copy.set_limit(self.conf.limit);
            } else {
                copy.set_limit(-self.conf.limit);
            }
            self.queue.add(copy);
        }
        let keywords = self.conf.keywords.clone();
        self.queue.add_keywords(&keywords);
        self
    }

    /// Resolves a CLI spider selection: `*` for all, otherwise
    /// comma-separated indices into the library.
    pub fn select(&self, selector: &str) -> Vec<Arc<Spider>> {
        let selector = selector.trim();
        if selector == "*" {
            return self.library.clone();
        }
        selector
            .split(',')
            .filter_map(|tok| tok.trim().parse::<usize>().ok())
            .filter_map(|idx| self.library.get(idx).cloned())
            .collect()
    }

    /// Runs to completion for the configured mode. Master mode returns
    /// after queueing tasks; worker mode loops until stopped.
    pub async fn run(&mut self) {
        if self.conf.mode != Mode::Worker && self.queue.is_empty() {
            warn!("spider queue is empty, nothing to run");
            return;
        }
        *self.state.write() = RunState::Running;
        match self.conf.mode {
            Mode::Standalone => self.exec().await,
            Mode::Master => self.master_run(),
            Mode::Worker => self.worker_run().await,
        }
        *self.state.write() = RunState::Stopped;
    }

    pub fn is_running(&self) -> bool {
        *self.state.read() == RunState::Running
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.read() == RunState::Stopped
    }

    /// Control surface usable while `run` borrows the engine.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            state: Arc::clone(&self.state),
            scheduler: Arc::clone(&self.scheduler),
            pool: Arc::clone(&self.pool),
            active: Arc::clone(&self.active),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Pauses or resumes the crawl (standalone mode).
    pub fn pause_recover(&self) {
        self.handle().pause_recover();
    }

    /// Stops the run: scheduler first, then the worker pool, then every
    /// active spider. Blocks until the run loop observes it.
    pub async fn stop(&self) {
        self.handle().stop().await;
    }

    // --- standalone ---

    async fn exec(&mut self) {
        let count = self.queue.len();
        self.stats.reset();
        self.scheduler.init(&self.conf).await;
        *self.active.lock() = self.queue.all().to_vec();

        let run_start = Instant::now();
        let run_stamp = Local::now().format("%Y-%m-%d %H%M%S").to_string();
        let seed = CrawlerSeed {
            scheduler: Arc::clone(&self.scheduler),
            downloaders: Arc::clone(&self.downloaders),
            sink_factory: self.make_sink_factory(&run_stamp),
            stats: Arc::clone(&self.stats),
            report_tx: self.report_tx.clone(),
            pipeline_settings: PipelineSettings {
                docker_cap: self.conf.docker_cap,
                file_dir: self.conf.file_dir.clone(),
                run_stamp,
                run_start,
            },
            default_pause_ms: self.conf.pause_ms,
        };
        let pool_cap = self.pool.reset(count, seed);

        info!(
            spiders = count,
            pool = pool_cap,
            threads = self.conf.thread_num,
            pause_ms = self.conf.pause_ms,
            "crawl starting"
        );

        let mut launched = 0usize;
        for i in 0..count {
            if *self.state.read() == RunState::Stopping {
                break;
            }
            while *self.state.read() == RunState::Paused {
                sleep(PAUSE_POLL).await;
            }
            let Some(mut crawler) = self.pool.use_one().await else {
                break;
            };
            let Some(spider) = self.queue.get(i) else {
                self.pool.free(crawler);
                continue;
            };
            crawler.init(spider);
            launched += 1;

            let pool = Arc::clone(&self.pool);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                crawler.run().await;
                if *state.read() != RunState::Stopping {
                    pool.free(crawler);
                }
            });
        }

        let mut data_total = 0u64;
        let mut file_total = 0u64;
        for _ in 0..launched {
            let Ok(report) = self.report_rx.recv_async().await else {
                break;
            };
            if report.data_count == 0 && report.file_count == 0 {
                info!(
                    spider = %report.spider_name,
                    keyword = %report.keyword,
                    elapsed = ?report.elapsed,
                    "no results"
                );
            } else {
                info!(
                    spider = %report.spider_name,
                    keyword = %report.keyword,
                    records = report.data_count,
                    files = report.file_count,
                    elapsed = ?report.elapsed,
                    "spider done"
                );
            }
            data_total += report.data_count;
            file_total += report.file_count;
        }

        info!(
            records = data_total,
            files = file_total,
            pages_ok = self.stats.successes(),
            pages_failed = self.stats.failures(),
            pages_total = self.stats.total(),
            elapsed = ?run_start.elapsed(),
            "crawl finished"
        );
    }

    fn make_sink_factory(&self, run_stamp: &str) -> SinkFactory {
        if let Some(factory) = &self.sink_factory {
            return Arc::clone(factory);
        }
        let out_type = self.conf.out_type.clone();
        let dir = self.conf.text_dir.clone();
        let stamp = run_stamp.to_string();
        Arc::new(move |spider| match out_type.as_str() {
            "jsonl" => Box::new(JsonLinesSink::new(
                Arc::clone(spider),
                dir.clone(),
                stamp.clone(),
            )),
            _ => Box::new(CsvSink::new(Arc::clone(spider), dir.clone(), stamp.clone())),
        })
    }

    // --- master ---

    /// Chunks the prepared queue into tasks of at most
    /// `Limits::SPIDERS_PER_TASK` spiders and queues them for workers.
    fn master_run(&mut self) {
        let mut task = Task::from_conf(&self.conf);
        let mut task_count = 0usize;
        let mut spider_count = 0usize;

        for spider in self.queue.all() {
            task.spiders.push(TaskSpider {
                name: spider.name.clone(),
                keyword: spider.keyword(),
            });
            spider_count += 1;
            if task.spiders.len() >= Limits::SPIDERS_PER_TASK {
                self.jar.push(task.clone());
                task.spiders.clear();
                task_count += 1;
            }
        }
        if !task.spiders.is_empty() {
            self.jar.push(task.clone());
            task_count += 1;
        }
        info!(tasks = task_count, spiders = spider_count, "tasks queued for dispatch");
    }

    // --- worker ---

    async fn worker_run(&mut self) {
        loop {
            let Some(task) = self.down_task().await else {
                return;
            };
            task.apply_to(&mut self.conf);

            self.queue.reset();
            for entry in &task.spiders {
                let Some(base) = self.library.iter().find(|s| s.name == entry.name) else {
                    warn!(spider = %entry.name, "task names an unknown spider");
                    continue;
                };
                let copy = base.copy();
                copy.set_pause_reference(task.pause_ms, false);
                if copy.limit() == CUSTOM_LIMIT {
                    copy.set_limit(task.limit);
                } else {
                    copy.set_limit(-task.limit);
                }
                if !entry.keyword.is_empty() {
                    copy.set_keyword(&entry.keyword);
                }
                self.queue.add(copy);
            }
            if self.queue.is_empty() {
                continue;
            }
            self.exec().await;
        }
    }

    /// Pulls the next task from the local jar, requesting one from the
    /// master when the jar is empty. `None` once stopping.
    async fn down_task(&self) -> Option<Task> {
        loop {
            if *self.state.read() == RunState::Stopping {
                return None;
            }
            if let Some(task) = self.jar.try_next() {
                return Some(task);
            }
            let dispatcher = self.dispatcher.as_ref()?;
            if dispatcher.count_nodes() == 0 {
                sleep(TASK_POLL).await;
                continue;
            }
            dispatcher.request(Value::Null, "task", "").await;
            while self.jar.is_empty() {
                if *self.state.read() == RunState::Stopping {
                    return None;
                }
                if dispatcher.count_nodes() == 0 {
                    break;
                }
                sleep(TASK_POLL).await;
            }
        }
    }

    fn spawn_log_forwarding(&mut self, dispatcher: &Arc<Dispatcher>) {
        let Some(lines) = self.log_lines.take() else {
            return;
        };
        let dispatcher = Arc::clone(dispatcher);
        tokio::spawn(async move {
            while let Ok(line) = lines.recv_async().await {
                if dispatcher.count_nodes() == 0 {
                    continue;
                }
                dispatcher.request(Value::String(line), "log", "").await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::spider::ParseFn;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    fn engine_with_library() -> Engine {
        let mut engine = Engine::new(AppConf::default());
        engine.register(Spider::new("alpha", noop()));
        engine.register(Spider::new("beta", noop()).custom_limit());
        engine
    }

    #[test]
    fn select_by_index_and_star() {
        let engine = engine_with_library();
        let all = engine.select("*");
        assert_eq!(all.len(), 2);
        let one = engine.select("1");
        assert_eq!(one[0].name, "beta");
        let none = engine.select("7,bogus");
        assert!(none.is_empty());
    }

    #[test]
    fn prepare_maps_limits() {
        let mut engine = engine_with_library();
        engine.conf_mut().limit = 5;
        let selection = engine.select("*");
        engine.spider_prepare(&selection);

        let alpha = engine.queue.get_by_name("alpha").unwrap();
        let beta = engine.queue.get_by_name("beta").unwrap();
        // plain spiders get a request-count ceiling
        assert_eq!(alpha.limit(), -5);
        // custom-limit spiders keep a positive rule-driven counter
        assert_eq!(beta.limit(), 5);
    }

    #[test]
    fn master_chunks_tasks_of_ten() {
        let mut engine = Engine::new(AppConf::default());
        for i in 0..25 {
            engine.register(Spider::new(format!("spider-{i}"), noop()));
        }
        let selection = engine.select("*");
        engine.spider_prepare(&selection);
        engine.master_run();

        let mut sizes = Vec::new();
        while let Some(task) = engine.jar.try_next() {
            sizes.push(task.spiders.len());
        }
        assert_eq!(sizes, [10, 10, 5]);
    }
}
