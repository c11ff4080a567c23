//! Fixed-capacity pool of reusable crawler workers. Capacity follows the
//! spider queue length up to a hard ceiling; callers block when every
//! worker is out.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Limits;
use crate::crawler::{Crawler, CrawlerSeed};

const POOL_WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct CrawlerPool {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    capacity: usize,
    count: usize,
    usable: VecDeque<Crawler>,
    stopped: bool,
    seed: Option<CrawlerSeed>,
}

impl CrawlerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the pool for a run: min(spider count, ceiling), at least 1.
    /// Returns the chosen capacity.
    pub fn reset(&self, spider_count: usize, seed: CrawlerSeed) -> usize {
        let capacity = spider_count.min(Limits::CRAWLER_POOL_CAP).max(1);
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        inner.count = 0;
        inner.usable.clear();
        inner.stopped = false;
        inner.seed = Some(seed);
        capacity
    }

    /// Checks out a worker: a free one if available, a fresh one while
    /// under capacity, otherwise waits. `None` once the pool stops.
    pub async fn use_one(&self) -> Option<Crawler> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.stopped {
                    return None;
                }
                if let Some(crawler) = inner.usable.pop_front() {
                    return Some(crawler);
                }
                if inner.count < inner.capacity {
                    let seed = inner.seed.clone()?;
                    let id = inner.count;
                    inner.count += 1;
                    return Some(Crawler::new(id, seed));
                }
            }
            tokio::time::sleep(POOL_WAIT).await;
        }
    }

    /// Returns a worker, unless the pool is stopping.
    pub fn free(&self, crawler: Crawler) {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return;
        }
        inner.usable.push_back(crawler);
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        inner.usable.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::PageStats;
    use crate::downloader::{DownloaderSet, HttpDownloader};
    use crate::output::MemorySink;
    use crate::pipeline::PipelineSettings;
    use crate::proxy::ProxyPool;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    fn seed(dir: &TempDir) -> CrawlerSeed {
        let (report_tx, _report_rx) = flume::unbounded();
        CrawlerSeed {
            scheduler: Scheduler::new(ProxyPool::new(dir.path().join("p.lib"))),
            downloaders: Arc::new(DownloaderSet::new(Arc::new(HttpDownloader::new()))),
            sink_factory: Arc::new(|_spider| Box::new(MemorySink::new())),
            stats: Arc::new(PageStats::new()),
            report_tx,
            pipeline_settings: PipelineSettings {
                docker_cap: 16,
                file_dir: dir.path().to_path_buf(),
                run_stamp: "run".to_string(),
                run_start: Instant::now(),
            },
            default_pause_ms: 100,
        }
    }

    #[tokio::test]
    async fn capacity_follows_queue_length() {
        let dir = TempDir::new().unwrap();
        let pool = CrawlerPool::new();
        assert_eq!(pool.reset(3, seed(&dir)), 3);
        assert_eq!(pool.reset(0, seed(&dir)), 1);
        assert_eq!(pool.reset(10_000, seed(&dir)), Limits::CRAWLER_POOL_CAP);
    }

    #[tokio::test]
    async fn checkout_blocks_at_capacity_until_freed() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(CrawlerPool::new());
        pool.reset(1, seed(&dir));

        let held = pool.use_one().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.use_one().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.free(held);
        let got = waiter.await.unwrap();
        assert_eq!(got, Some(0));
    }

    #[tokio::test]
    async fn stop_releases_waiters() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(CrawlerPool::new());
        pool.reset(1, seed(&dir));
        let _held = pool.use_one().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.use_one().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop();
        assert!(waiter.await.unwrap());
    }
}
