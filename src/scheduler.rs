//! Global crawl scheduler: the permit pool shared by every spider, the
//! matrix registry, the run/pause/stop tri-state and the proxy pool.
//!
//! One `Scheduler` value is created by the engine and handed down to each
//! matrix; there is no process-global state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConf;
use crate::matrix::Matrix;
use crate::proxy::ProxyPool;
use crate::status::{Mode, RunState};

/// Run-scoped configuration the matrices need.
#[derive(Clone)]
pub(crate) struct RunSnapshot {
    pub mode: Mode,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    pub history_dir: PathBuf,
}

impl Default for RunSnapshot {
    fn default() -> Self {
        Self {
            mode: Mode::Standalone,
            success_inherit: true,
            failure_inherit: true,
            history_dir: PathBuf::from("data/history"),
        }
    }
}

pub struct Scheduler {
    state: RwLock<RunState>,
    permits: RwLock<Arc<Semaphore>>,
    thread_cap: AtomicUsize,
    matrices: Mutex<Vec<Arc<Matrix>>>,
    stop_token: RwLock<CancellationToken>,
    proxy: ProxyPool,
    use_proxy: AtomicBool,
    snapshot: RwLock<RunSnapshot>,
}

impl Scheduler {
    pub fn new(proxy: ProxyPool) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RunState::Running),
            permits: RwLock::new(Arc::new(Semaphore::new(1))),
            thread_cap: AtomicUsize::new(1),
            matrices: Mutex::new(Vec::new()),
            stop_token: RwLock::new(CancellationToken::new()),
            proxy,
            use_proxy: AtomicBool::new(false),
            snapshot: RwLock::new(RunSnapshot::default()),
        })
    }

    /// Prepares the scheduler for a run: fresh permit pool sized to the
    /// thread cap, empty matrix registry, proxy rotation per config.
    pub async fn init(&self, conf: &AppConf) {
        *self.permits.write() = Arc::new(Semaphore::new(conf.thread_num));
        self.thread_cap.store(conf.thread_num, Ordering::Relaxed);
        self.matrices.lock().clear();
        *self.stop_token.write() = CancellationToken::new();
        *self.snapshot.write() = RunSnapshot {
            mode: conf.mode,
            success_inherit: conf.success_inherit,
            failure_inherit: conf.failure_inherit,
            history_dir: conf.history_dir.clone(),
        };

        if conf.proxy_minute > 0 {
            self.proxy.refresh().await;
            if self.proxy.count() > 0 {
                self.use_proxy.store(true, Ordering::Relaxed);
                self.proxy.set_rotation(conf.proxy_minute);
                info!(minutes = conf.proxy_minute, "proxy rotation enabled");
            } else {
                self.use_proxy.store(false, Ordering::Relaxed);
                info!("proxy list empty, crawling without proxies");
            }
        } else {
            self.use_proxy.store(false, Ordering::Relaxed);
        }

        *self.state.write() = RunState::Running;
    }

    /// Registers a request matrix for one spider instance.
    pub fn add_matrix(
        self: &Arc<Self>,
        spider_name: &str,
        sub_key: &str,
        budget: i64,
    ) -> Arc<Matrix> {
        let snapshot = self.snapshot.read().clone();
        let matrix = Matrix::new(spider_name, sub_key, budget, Arc::clone(self), &snapshot);
        self.matrices.lock().push(Arc::clone(&matrix));
        matrix
    }

    /// Average permit share per registered matrix, at least one.
    pub fn avg_slots(&self) -> i32 {
        let count = self.matrices.lock().len().max(1);
        ((self.thread_cap.load(Ordering::Relaxed) / count) as i32).max(1)
    }

    /// Blocks for a global permit; `None` once a stop is signaled.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let permits = self.permits.read().clone();
        let token = self.stop_token.read().clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            acquired = permits.acquire_owned() => acquired.ok(),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.state.read() == RunState::Running
    }

    pub fn is_paused(&self) -> bool {
        *self.state.read() == RunState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        *self.state.read() == RunState::Stopping
    }

    /// Toggles between running and paused.
    pub fn pause_recover(&self) {
        let mut state = self.state.write();
        *state = match *state {
            RunState::Running => RunState::Paused,
            RunState::Paused => RunState::Running,
            other => other,
        };
    }

    /// Signals stop: blocked permit waiters wake, matrices drop out of
    /// their wait loops within one granularity step.
    pub fn stop(&self) {
        *self.state.write() = RunState::Stopping;
        self.stop_token.read().cancel();
        self.permits.read().close();
        self.matrices.lock().clear();
    }

    pub fn proxy_enabled(&self) -> bool {
        self.use_proxy.load(Ordering::Relaxed)
    }

    pub fn proxy(&self) -> &ProxyPool {
        &self.proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_scheduler(dir: &TempDir) -> Arc<Scheduler> {
        Scheduler::new(ProxyPool::new(dir.path().join("proxy.lib")))
    }

    #[tokio::test]
    async fn init_sizes_permit_pool() {
        let dir = TempDir::new().unwrap();
        let scheduler = test_scheduler(&dir);
        let mut conf = AppConf::default();
        conf.thread_num = 3;
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        let a = scheduler.acquire().await.unwrap();
        let b = scheduler.acquire().await.unwrap();
        let c = scheduler.acquire().await.unwrap();
        drop(a);
        let d = scheduler.acquire().await;
        assert!(d.is_some());
        drop((b, c, d));
    }

    #[tokio::test]
    async fn stop_wakes_blocked_acquirers() {
        let dir = TempDir::new().unwrap();
        let scheduler = test_scheduler(&dir);
        let mut conf = AppConf::default();
        conf.thread_num = 1;
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        let held = scheduler.acquire().await.unwrap();
        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.acquire().await.is_none() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scheduler.stop();
        assert!(waiter.await.unwrap());
        drop(held);
    }

    #[tokio::test]
    async fn avg_slots_has_floor_of_one() {
        let dir = TempDir::new().unwrap();
        let scheduler = test_scheduler(&dir);
        let mut conf = AppConf::default();
        conf.thread_num = 2;
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        scheduler.add_matrix("a", "", i64::MIN);
        scheduler.add_matrix("b", "", i64::MIN);
        scheduler.add_matrix("c", "", i64::MIN);
        assert_eq!(scheduler.avg_slots(), 1);
    }

    #[tokio::test]
    async fn pause_recover_toggles() {
        let dir = TempDir::new().unwrap();
        let scheduler = test_scheduler(&dir);
        let mut conf = AppConf::default();
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        assert!(scheduler.is_running());
        scheduler.pause_recover();
        assert!(scheduler.is_paused());
        scheduler.pause_recover();
        assert!(scheduler.is_running());
    }
}
