//! Per-spider request matrix: priority queue, admission control, history
//! dedup, failure tracking and the crawl budget.
//!
//! Admission rules for a non-reloadable request: it is queued at most once
//! while live (in the queue or in flight) or present in the success
//! history. A failed non-reloadable request is parked in the failure map
//! on first failure, replayed exactly once when the matrix drains, and
//! persisted into the failure history on its second failure.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info};

use crate::history::History;
use crate::request::Request;
use crate::scheduler::{RunSnapshot, Scheduler};
use crate::status::Mode;

const PAUSE_POLL: Duration = Duration::from_secs(1);
const HEADROOM_POLL: Duration = Duration::from_millis(100);
const DRAIN_POLL: Duration = Duration::from_millis(500);

pub struct Matrix {
    spider_name: String,
    /// Crawl budget. Negative values count toward zero, one per admitted
    /// request; at or above zero the budget is exhausted.
    budget: AtomicI64,
    in_flight: AtomicI32,
    /// Priority -> FIFO bucket. Iteration order gives ascending priority.
    queue: Mutex<BTreeMap<u32, VecDeque<Request>>>,
    /// Uniques currently queued or being processed.
    live: RwLock<HashSet<String>>,
    /// First failures keep the request for one replay; `None` marks a
    /// record already replayed, whose next failure is persisted.
    failures: Mutex<HashMap<String, Option<Request>>>,
    history: History,
    scheduler: Arc<Scheduler>,
    flush_enabled: bool,
    success_inherit: bool,
    failure_inherit: bool,
}

/// One unit of in-flight work: a global permit plus this matrix's
/// in-flight count. Dropping it releases both, so history recording must
/// happen before the slot goes out of scope.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
    matrix: Arc<Matrix>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.matrix.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Matrix {
    pub(crate) fn new(
        spider_name: &str,
        sub_key: &str,
        budget: i64,
        scheduler: Arc<Scheduler>,
        snapshot: &RunSnapshot,
    ) -> Arc<Self> {
        let history = History::new(spider_name, sub_key, &snapshot.history_dir);
        let matrix = Arc::new(Self {
            spider_name: spider_name.to_string(),
            budget: AtomicI64::new(budget),
            in_flight: AtomicI32::new(0),
            queue: Mutex::new(BTreeMap::new()),
            live: RwLock::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            history,
            scheduler,
            flush_enabled: snapshot.mode != Mode::Master,
            success_inherit: snapshot.success_inherit,
            failure_inherit: snapshot.failure_inherit,
        });

        // A master only describes work; it never replays history itself.
        if snapshot.mode != Mode::Master {
            matrix.history.load_success(matrix.success_inherit);
            matrix.history.load_failure(matrix.failure_inherit);
            let inherited = matrix.history.pull_failures();
            if !inherited.is_empty() {
                info!(
                    spider = %matrix.spider_name,
                    count = inherited.len(),
                    "inherited failed requests"
                );
                let mut failures = matrix.failures.lock();
                for (unique, req) in inherited {
                    failures.insert(unique, Some(req));
                }
            }
        }
        matrix
    }

    /// Admits a request. Blocks while the scheduler is paused and while
    /// this matrix exceeds its permit share; a stop observed at any step
    /// discards the request.
    pub async fn push(&self, req: Request) {
        if self.scheduler.is_stopped() {
            return;
        }
        if self.budget.load(Ordering::Relaxed) >= 0 {
            return;
        }
        while self.scheduler.is_paused() {
            tokio::time::sleep(PAUSE_POLL).await;
            if self.scheduler.is_stopped() {
                return;
            }
        }
        while self.in_flight.load(Ordering::SeqCst) > self.scheduler.avg_slots() {
            tokio::time::sleep(HEADROOM_POLL).await;
            if self.scheduler.is_stopped() {
                return;
            }
        }
        if self.scheduler.is_stopped() {
            return;
        }

        if !req.reloadable {
            let unique = req.unique();
            if self.history.has_success(&unique) {
                return;
            }
            let mut live = self.live.write();
            if !live.insert(unique) {
                return;
            }
        }

        self.queue
            .lock()
            .entry(req.priority)
            .or_default()
            .push_back(req);
        self.budget.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the next request, highest priority first, FIFO within a
    /// priority. Attaches a proxy when enabled and none is set yet.
    pub async fn pull(&self) -> Option<Request> {
        if !self.scheduler.is_running() {
            return None;
        }
        let mut req = {
            let mut queue = self.queue.lock();
            let priority = queue
                .iter()
                .rev()
                .find(|(_, bucket)| !bucket.is_empty())
                .map(|(p, _)| *p)?;
            let bucket = queue.get_mut(&priority)?;
            let req = bucket.pop_front()?;
            if bucket.is_empty() {
                queue.remove(&priority);
            }
            req
        };

        if req.proxy.is_empty() && self.scheduler.proxy_enabled() {
            if let Some(proxy) = self.scheduler.proxy().get_one(&req.url).await {
                req.proxy = proxy;
            }
        }
        Some(req)
    }

    /// Acquires one unit of global concurrency for this matrix. `None`
    /// once the scheduler is stopping.
    pub async fn occupy(self: &Arc<Self>) -> Option<Slot> {
        let permit = self.scheduler.acquire().await?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Slot {
            _permit: permit,
            matrix: Arc::clone(self),
        })
    }

    /// Records the terminal outcome of a dequeued request. Returns true
    /// when a failed request was parked for one replay; false otherwise
    /// (including second failures, which go to the failure history).
    pub fn do_history(&self, req: &Request, ok: bool) -> bool {
        if !req.reloadable {
            let unique = req.unique();
            self.live.write().remove(&unique);
            if ok {
                self.history.add_success(&unique);
                return false;
            }
        }
        if ok {
            return false;
        }

        let mut failures = self.failures.lock();
        let unique = req.unique();
        if let std::collections::hash_map::Entry::Vacant(slot) = failures.entry(unique) {
            slot.insert(Some(req.clone()));
            info!(spider = %self.spider_name, url = %req.url, "request failed, queued for replay");
            return true;
        }
        self.history.upsert_failure(req);
        false
    }

    /// True when this matrix has nothing left to do: stopped globally,
    /// budget exhausted, or drained with no in-flight work. A drain with
    /// parked failures replays them (each at most once) and reports false
    /// so the worker keeps going.
    pub async fn can_stop(&self) -> bool {
        if self.scheduler.is_stopped() {
            return true;
        }
        if self.budget.load(Ordering::Relaxed) >= 0 {
            return true;
        }
        if self.in_flight.load(Ordering::SeqCst) != 0 {
            return false;
        }
        if self.len() > 0 {
            return false;
        }

        let replays: Vec<Request> = {
            let mut failures = self.failures.lock();
            failures
                .iter_mut()
                .filter_map(|(_, slot)| slot.take())
                .collect()
        };
        if !replays.is_empty() {
            for req in replays {
                debug!(spider = %self.spider_name, url = %req.url, "replaying failed request");
                self.push(req).await;
            }
            return false;
        }
        true
    }

    /// Blocks until in-flight work reaches zero, or the scheduler stops.
    pub async fn wait(&self) {
        while !self.scheduler.is_stopped() && self.in_flight.load(Ordering::SeqCst) != 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_flush_success(&self) {
        if self.flush_enabled && self.success_inherit {
            if let Err(err) = self.history.flush_success() {
                error!(spider = %self.spider_name, %err, "success history flush failed");
            }
        }
    }

    pub fn try_flush_failure(&self) {
        if self.flush_enabled && self.failure_inherit {
            if let Err(err) = self.history.flush_failure() {
                error!(spider = %self.spider_name, %err, "failure history flush failed");
            }
        }
    }

    pub fn history(&self) -> &History {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConf;
    use crate::proxy::ProxyPool;
    use tempfile::TempDir;

    async fn harness(thread_num: usize) -> (TempDir, Arc<Scheduler>) {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(ProxyPool::new(dir.path().join("proxy.lib")));
        let mut conf = AppConf::default();
        conf.thread_num = thread_num;
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;
        (dir, scheduler)
    }

    fn request(url: &str, priority: u32) -> Request {
        let mut req = Request::new(url, "list");
        req.spider = "demo".to_string();
        req.priority = priority;
        req.prepare().unwrap();
        req
    }

    #[tokio::test]
    async fn pull_orders_by_priority_then_fifo() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);

        matrix.push(request("http://example.test/a", 5)).await;
        matrix.push(request("http://example.test/b", 1)).await;
        matrix.push(request("http://example.test/c", 5)).await;

        let urls: Vec<String> = [
            matrix.pull().await.unwrap(),
            matrix.pull().await.unwrap(),
            matrix.pull().await.unwrap(),
        ]
        .into_iter()
        .map(|r| r.url)
        .collect();
        assert_eq!(
            urls,
            [
                "http://example.test/a",
                "http://example.test/c",
                "http://example.test/b"
            ]
        );
        assert!(matrix.pull().await.is_none());
    }

    #[tokio::test]
    async fn non_reloadable_requests_admit_once() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);

        matrix.push(request("http://example.test/a", 0)).await;
        matrix.push(request("http://example.test/a", 0)).await;
        assert_eq!(matrix.len(), 1);

        // reloadable requests bypass dedup
        let mut reload = request("http://example.test/a", 0);
        reload.reloadable = true;
        matrix.push(reload.clone()).await;
        matrix.push(reload).await;
        assert_eq!(matrix.len(), 3);
    }

    #[tokio::test]
    async fn success_history_blocks_readmission() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);

        let req = request("http://example.test/a", 0);
        matrix.push(req.clone()).await;
        let pulled = matrix.pull().await.unwrap();
        assert!(!matrix.do_history(&pulled, true));

        matrix.push(req).await;
        assert_eq!(matrix.len(), 0);
    }

    #[tokio::test]
    async fn failure_is_replayed_once_then_persisted() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);

        let req = request("http://example.test/a", 0);
        matrix.push(req.clone()).await;
        let first = matrix.pull().await.unwrap();

        // first failure parks the request and asks for a replay
        assert!(matrix.do_history(&first, false));
        assert!(!matrix.can_stop().await);
        assert_eq!(matrix.len(), 1);

        // second failure is persisted, not replayed
        let second = matrix.pull().await.unwrap();
        assert!(!matrix.do_history(&second, false));
        assert!(matrix.can_stop().await);
        let persisted = matrix.history().pull_failures();
        assert_eq!(persisted.len(), 1);
        assert!(persisted.contains_key(&req.unique()));
    }

    #[tokio::test]
    async fn budget_caps_admission() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", -2);

        matrix.push(request("http://example.test/a", 0)).await;
        matrix.push(request("http://example.test/b", 0)).await;
        matrix.push(request("http://example.test/c", 0)).await;
        assert_eq!(matrix.len(), 2);
        assert!(matrix.can_stop().await);
    }

    #[tokio::test]
    async fn stop_discards_pushes_immediately() {
        let (_dir, scheduler) = harness(8).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);
        scheduler.stop();
        matrix.push(request("http://example.test/a", 0)).await;
        assert_eq!(matrix.len(), 0);
        assert!(matrix.can_stop().await);
    }

    #[tokio::test]
    async fn slot_tracks_in_flight() {
        let (_dir, scheduler) = harness(2).await;
        let matrix = scheduler.add_matrix("demo", "", i64::MIN);

        let slot = matrix.occupy().await.unwrap();
        assert!(!matrix.can_stop().await);
        drop(slot);
        assert!(matrix.can_stop().await);
    }
}
