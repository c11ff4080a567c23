//! Spider definitions: a root entrypoint plus named rule nodes, and the
//! per-run state that binds a spider to its request matrix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::warn;

use crate::context::Context;
use crate::matrix::Matrix;
use crate::scheduler::Scheduler;
use crate::timer::{Bell, TimerTable};

/// Sentinel for spiders whose rules drive the limit counter themselves.
/// Everything else treats the configured limit as a request-count ceiling.
pub const CUSTOM_LIMIT: i64 = i64::MAX;

/// Parse callback. Runs synchronously on a blocking thread; queued
/// requests and output items are buffered on the context and drained by
/// the caller.
pub type ParseFn = Arc<dyn Fn(&mut Context) + Send + Sync>;
/// Auxiliary callback, invocable by name from rule code.
pub type AidFn = Arc<dyn Fn(&mut Context, HashMap<String, Value>) -> Option<Value> + Send + Sync>;

/// A named rule node: ordered output field names plus callbacks.
pub struct Rule {
    fields: RwLock<Vec<String>>,
    pub parse: Option<ParseFn>,
    pub aid: Option<AidFn>,
}

impl Rule {
    pub fn new(fields: &[&str], parse: ParseFn) -> Self {
        Self {
            fields: RwLock::new(fields.iter().map(|f| f.to_string()).collect()),
            parse: Some(parse),
            aid: None,
        }
    }

    pub fn with_aid(mut self, aid: AidFn) -> Self {
        self.aid = Some(aid);
        self
    }

    /// Ordered output field names.
    pub fn fields(&self) -> Vec<String> {
        self.fields.read().clone()
    }

    pub fn field_at(&self, index: usize) -> Option<String> {
        self.fields.read().get(index).cloned()
    }

    /// Appends the field unless present; returns its index either way.
    pub fn upsert_field(&self, field: &str) -> usize {
        let mut fields = self.fields.write();
        if let Some(idx) = fields.iter().position(|f| f == field) {
            return idx;
        }
        fields.push(field.to_string());
        fields.len() - 1
    }
}

impl Clone for Rule {
    fn clone(&self) -> Self {
        Self {
            fields: RwLock::new(self.fields()),
            parse: self.parse.clone(),
            aid: self.aid.clone(),
        }
    }
}

/// Root entrypoint plus the named rule map.
#[derive(Clone)]
pub struct RuleTree {
    pub root: ParseFn,
    pub rules: HashMap<String, Rule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpiderState {
    /// Root has not run yet.
    Ready,
    Running,
    Stopping,
}

pub struct Spider {
    pub name: String,
    pub description: String,
    /// Pause reference in ms; actual inter-dispatch sleep is uniform in
    /// [p/2, 2p].
    pause_ms: AtomicU64,
    /// Positive: rule-driven counter. Negative: request-count ceiling.
    /// Zero: unlimited.
    limit: AtomicI64,
    keyword: RwLock<String>,
    /// Whether the keyword cross-product may clone this spider.
    pub accepts_keyword: bool,
    pub enable_cookie: bool,
    /// Suppress the default URL/parent-URL/time output columns.
    pub omit_default_fields: bool,
    pub tree: RuleTree,
    id: AtomicUsize,
    sub_key: OnceCell<String>,
    matrix: OnceCell<Arc<Matrix>>,
    state: RwLock<SpiderState>,
    timers: Mutex<Option<Arc<TimerTable>>>,
}

impl Spider {
    pub fn new(name: impl Into<String>, root: ParseFn) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            pause_ms: AtomicU64::new(0),
            limit: AtomicI64::new(0),
            keyword: RwLock::new(String::new()),
            accepts_keyword: false,
            enable_cookie: false,
            omit_default_fields: false,
            tree: RuleTree {
                root,
                rules: HashMap::new(),
            },
            id: AtomicUsize::new(0),
            sub_key: OnceCell::new(),
            matrix: OnceCell::new(),
            state: RwLock::new(SpiderState::Ready),
            timers: Mutex::new(None),
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn rule(mut self, name: impl Into<String>, rule: Rule) -> Self {
        self.tree.rules.insert(name.into(), rule);
        self
    }

    pub fn custom_limit(self) -> Self {
        self.limit.store(CUSTOM_LIMIT, Ordering::Relaxed);
        self
    }

    pub fn keyword_capable(mut self) -> Self {
        self.accepts_keyword = true;
        self
    }

    pub fn with_cookies(mut self) -> Self {
        self.enable_cookie = true;
        self
    }

    pub fn without_default_fields(mut self) -> Self {
        self.omit_default_fields = true;
        self
    }

    pub fn with_pause(self, ms: u64) -> Self {
        self.pause_ms.store(ms, Ordering::Relaxed);
        self
    }

    /// Fresh per-run copy: shared callbacks, deep-copied field lists,
    /// reset run state.
    pub fn copy(&self) -> Spider {
        let tree = RuleTree {
            root: self.tree.root.clone(),
            rules: self
                .tree
                .rules
                .iter()
                .map(|(name, rule)| (name.clone(), rule.clone()))
                .collect(),
        };
        Spider {
            name: self.name.clone(),
            description: self.description.clone(),
            pause_ms: AtomicU64::new(self.pause_ms.load(Ordering::Relaxed)),
            limit: AtomicI64::new(self.limit.load(Ordering::Relaxed)),
            keyword: RwLock::new(self.keyword.read().clone()),
            accepts_keyword: self.accepts_keyword,
            enable_cookie: self.enable_cookie,
            omit_default_fields: self.omit_default_fields,
            tree,
            id: AtomicUsize::new(0),
            sub_key: OnceCell::new(),
            matrix: OnceCell::new(),
            state: RwLock::new(SpiderState::Ready),
            timers: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: usize) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn keyword(&self) -> String {
        self.keyword.read().clone()
    }

    pub fn set_keyword(&self, keyword: &str) {
        *self.keyword.write() = keyword.to_string();
    }

    /// Identifier that partitions history namespaces per keyword clone.
    /// Derived once; empty when the spider has no keyword.
    pub fn sub_key(&self) -> &str {
        self.sub_key.get_or_init(|| {
            let keyword = self.keyword.read();
            if keyword.is_empty() {
                String::new()
            } else {
                format!("{:x}", md5::compute(keyword.as_bytes()))
            }
        })
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn pause_reference(&self) -> u64 {
        self.pause_ms.load(Ordering::Relaxed)
    }

    /// Sets the pause reference. An existing nonzero value is only
    /// overwritten when `force` is set (rule-declared pauses win over the
    /// global config).
    pub fn set_pause_reference(&self, ms: u64, force: bool) {
        if self.pause_ms.load(Ordering::Relaxed) == 0 || force {
            self.pause_ms.store(ms, Ordering::Relaxed);
        }
    }

    pub fn get_rule(&self, name: &str) -> Option<&Rule> {
        self.tree.rules.get(name)
    }

    /// Binds this spider to a fresh request matrix. A negative limit
    /// becomes the matrix's crawl budget; otherwise the budget is
    /// unbounded and the rule-driven counter stays on the spider.
    pub fn matrix_init(&self, scheduler: &Arc<Scheduler>) {
        let limit = self.limit();
        let matrix = if limit < 0 {
            self.set_limit(0);
            scheduler.add_matrix(&self.name, self.sub_key(), limit)
        } else {
            scheduler.add_matrix(&self.name, self.sub_key(), i64::MIN)
        };
        if self.matrix.set(matrix).is_err() {
            warn!(spider = %self.name, "matrix already bound");
        }
    }

    /// The bound matrix. Panics if `matrix_init` has not run; the crawler
    /// binds before any rule code can execute.
    pub fn matrix(&self) -> &Arc<Matrix> {
        self.matrix.get().expect("spider not bound to a matrix")
    }

    pub fn is_bound(&self) -> bool {
        self.matrix.get().is_some()
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.write();
        if *state == SpiderState::Ready {
            *state = SpiderState::Running;
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == SpiderState::Stopping {
                return;
            }
            *state = SpiderState::Stopping;
        }
        if let Some(timers) = self.timers.lock().take() {
            timers.drop_all();
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.state.read() == SpiderState::Stopping
    }

    /// Whether the spider-local run can wind down: the root has executed
    /// and the matrix reports no pending work.
    pub async fn can_stop(&self) -> bool {
        if *self.state.read() == SpiderState::Ready {
            return false;
        }
        self.matrix().can_stop().await
    }

    /// Registers a named clock on this spider's timer table.
    pub fn set_timer(&self, id: &str, tol: Duration, bell: Option<Bell>) -> bool {
        let table = {
            let mut timers = self.timers.lock();
            Arc::clone(timers.get_or_insert_with(|| Arc::new(TimerTable::new())))
        };
        table.set(id, tol, bell)
    }

    /// Sleeps on a named clock; false when the clock is gone or the
    /// spider stopped while sleeping.
    pub fn run_timer(&self, id: &str) -> bool {
        let table = match self.timers.lock().as_ref() {
            Some(t) => Arc::clone(t),
            None => return false,
        };
        table.sleep(id)
    }

    /// End-of-run cleanup: cancel timers, wait out in-flight work, flush
    /// the failure record.
    pub async fn finish(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.drop_all();
        }
        let matrix = self.matrix();
        matrix.wait().await;
        matrix.try_flush_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConf;
    use crate::proxy::ProxyPool;
    use tempfile::TempDir;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    fn demo_spider() -> Spider {
        Spider::new("demo", noop())
            .description("test spider")
            .rule("list", Rule::new(&["title", "link"], noop()))
    }

    #[test]
    fn copy_resets_run_state_and_deep_copies_fields() {
        let base = demo_spider();
        base.get_rule("list").unwrap().upsert_field("extra");

        let clone = base.copy();
        assert_eq!(clone.get_rule("list").unwrap().fields().len(), 3);

        clone.get_rule("list").unwrap().upsert_field("only_in_clone");
        assert_eq!(base.get_rule("list").unwrap().fields().len(), 3);
        assert!(!clone.is_bound());
    }

    #[test]
    fn upsert_field_is_idempotent() {
        let spider = demo_spider();
        let rule = spider.get_rule("list").unwrap();
        assert_eq!(rule.upsert_field("title"), 0);
        assert_eq!(rule.upsert_field("price"), 2);
        assert_eq!(rule.upsert_field("price"), 2);
    }

    #[test]
    fn sub_key_tracks_keyword() {
        let plain = demo_spider();
        assert_eq!(plain.sub_key(), "");

        let keyed = demo_spider();
        keyed.set_keyword("rust");
        assert_eq!(keyed.sub_key(), format!("{:x}", md5::compute("rust")));
        // derived once: later keyword changes do not move the namespace
        keyed.set_keyword("other");
        assert_eq!(keyed.sub_key(), format!("{:x}", md5::compute("rust")));
    }

    #[test]
    fn rule_declared_pause_wins_unless_forced() {
        let spider = demo_spider().with_pause(500);
        spider.set_pause_reference(300, false);
        assert_eq!(spider.pause_reference(), 500);
        spider.set_pause_reference(300, true);
        assert_eq!(spider.pause_reference(), 300);
    }

    #[tokio::test]
    async fn matrix_init_translates_limits() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(ProxyPool::new(dir.path().join("p.lib")));
        let mut conf = AppConf::default();
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        // negative limit becomes the matrix budget and zeroes the spider's
        let spider = demo_spider();
        spider.set_limit(-2);
        spider.matrix_init(&scheduler);
        assert_eq!(spider.limit(), 0);

        let mut req = crate::request::Request::new("http://example.test/a", "list");
        req.spider = "demo".to_string();
        req.prepare().unwrap();
        spider.matrix().push(req.clone()).await;
        let mut second = crate::request::Request::new("http://example.test/b", "list");
        second.spider = "demo".to_string();
        second.prepare().unwrap();
        spider.matrix().push(second).await;
        let mut third = crate::request::Request::new("http://example.test/c", "list");
        third.spider = "demo".to_string();
        third.prepare().unwrap();
        spider.matrix().push(third).await;
        assert_eq!(spider.matrix().len(), 2);
    }

    #[tokio::test]
    async fn ready_spider_cannot_stop() {
        let dir = TempDir::new().unwrap();
        let scheduler = Scheduler::new(ProxyPool::new(dir.path().join("p.lib")));
        let mut conf = AppConf::default();
        conf.history_dir = dir.path().to_path_buf();
        scheduler.init(&conf).await;

        let spider = demo_spider();
        spider.matrix_init(&scheduler);
        assert!(!spider.can_stop().await);
        spider.mark_running();
        assert!(spider.can_stop().await);
    }
}
