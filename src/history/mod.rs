//! Persistent crawl history: a success set used for dedup and a failure
//! queue used for at-least-once retry.
//!
//! Records are partitioned per (spider, sub-key) so keyword clones of the
//! same spider keep separate namespaces. The fallback backend is a pair of
//! JSON files; each flush writes one complete JSON object.

mod failure;
mod success;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::request::Request;

pub(crate) use failure::Failures;
pub(crate) use success::Successes;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// Carries the number of records that were pending when the write failed.
    #[error("history write failed ({count} records pending): {source}")]
    Write {
        count: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("history encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Success set plus failure queue for one spider instance.
pub struct History {
    successes: Successes,
    failures: Failures,
}

impl History {
    /// `sub_key` partitions records for keyword clones; empty means none.
    pub fn new(spider_name: &str, sub_key: &str, dir: &Path) -> Self {
        let success_path = record_path(dir, "success", spider_name, sub_key);
        let failure_path = record_path(dir, "failure", spider_name, sub_key);
        Self {
            successes: Successes::new(success_path),
            failures: Failures::new(failure_path),
        }
    }

    /// Loads the persisted success set. With `inherit` false the in-memory
    /// sets are cleared and the next flush starts a fresh file; with
    /// `inherit` true records are reloaded unless the previous load already
    /// inherited.
    pub fn load_success(&self, inherit: bool) {
        self.successes.load(inherit);
    }

    pub fn has_success(&self, id: &str) -> bool {
        self.successes.contains(id)
    }

    /// Returns false when the id was already present in old ∪ new.
    pub fn add_success(&self, id: &str) -> bool {
        self.successes.add(id)
    }

    pub fn drop_success(&self, id: &str) {
        self.successes.remove(id);
    }

    /// Writes the success set to the backend. New records are merged into
    /// the old set only after the write succeeds, so a failed flush can be
    /// retried. A flush with nothing new is a no-op.
    pub fn flush_success(&self) -> Result<usize, HistoryError> {
        self.successes.flush()
    }

    pub fn load_failure(&self, inherit: bool) {
        self.failures.load(inherit);
    }

    /// Drains the failure map, handing the records to the caller.
    pub fn pull_failures(&self) -> HashMap<String, Request> {
        self.failures.pull()
    }

    /// Returns false when a record with the same unique already exists.
    pub fn upsert_failure(&self, req: &Request) -> bool {
        self.failures.upsert(req)
    }

    pub fn drop_failure(&self, req: &Request) {
        self.failures.remove(req);
    }

    /// Overwrites the failure record with the current map. A zero-length
    /// flush still removes the stale file.
    pub fn flush_failure(&self) -> Result<usize, HistoryError> {
        self.failures.flush()
    }

    /// Clears all in-memory records without touching the backend.
    pub fn reset(&self) {
        self.successes.clear();
        self.failures.clear();
    }
}

fn record_path(dir: &Path, kind: &str, spider_name: &str, sub_key: &str) -> PathBuf {
    let mut name = format!("{kind}__{}", sanitize(spider_name));
    if !sub_key.is_empty() {
        name.push_str("__");
        name.push_str(&sanitize(sub_key));
    }
    name.push_str(".json");
    dir.join(name)
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(url: &str) -> Request {
        let mut req = Request::new(url, "list");
        req.spider = "demo".to_string();
        req.prepare().unwrap();
        req
    }

    #[test]
    fn add_success_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let history = History::new("demo", "", dir.path());

        assert!(history.add_success("u1"));
        assert!(!history.add_success("u1"));
        assert!(history.has_success("u1"));
    }

    #[test]
    fn success_survives_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        {
            let history = History::new("demo", "", dir.path());
            history.add_success("u1");
            history.add_success("u2");
            assert_eq!(history.flush_success().unwrap(), 2);
            // nothing new: no-op
            assert_eq!(history.flush_success().unwrap(), 0);
        }

        let history = History::new("demo", "", dir.path());
        history.load_success(true);
        assert!(history.has_success("u1"));
        assert!(history.has_success("u2"));
        // flushed ids count as present, so re-adding reports duplicate
        assert!(!history.add_success("u1"));
    }

    #[test]
    fn no_inherit_discards_previous_records() {
        let dir = TempDir::new().unwrap();
        {
            let history = History::new("demo", "", dir.path());
            history.add_success("u1");
            history.flush_success().unwrap();
        }

        let history = History::new("demo", "", dir.path());
        history.load_success(false);
        assert!(!history.has_success("u1"));
    }

    #[test]
    fn failure_overwrite_semantics() {
        let dir = TempDir::new().unwrap();
        let req_a = request("http://example.test/a");
        let req_b = request("http://example.test/b");

        {
            let history = History::new("demo", "", dir.path());
            assert!(history.upsert_failure(&req_a));
            assert!(!history.upsert_failure(&req_a));
            assert!(history.upsert_failure(&req_b));
            assert_eq!(history.flush_failure().unwrap(), 2);
        }

        let history = History::new("demo", "", dir.path());
        history.load_failure(true);
        let pulled = history.pull_failures();
        assert_eq!(pulled.len(), 2);
        assert!(pulled.contains_key(&req_a.unique()));
        // pull drained the map
        assert!(history.pull_failures().is_empty());

        // an empty flush truncates stale state
        assert_eq!(history.flush_failure().unwrap(), 0);
        let history = History::new("demo", "", dir.path());
        history.load_failure(true);
        assert!(history.pull_failures().is_empty());
    }

    #[test]
    fn corrupt_failure_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = record_path(dir.path(), "failure", "demo", "");
        let good = request("http://example.test/ok");
        let body = format!(
            "{{\"{}\":{},\"bad\":\"not a request\"}}",
            good.unique(),
            serde_json::to_string(&good.serialize()).unwrap()
        );
        std::fs::write(&path, body).unwrap();

        let history = History::new("demo", "", dir.path());
        history.load_failure(true);
        let pulled = history.pull_failures();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[&good.unique()].url, "http://example.test/ok");
    }

    #[test]
    fn missing_files_load_empty() {
        let dir = TempDir::new().unwrap();
        let history = History::new("demo", "kw", dir.path());
        history.load_success(true);
        history.load_failure(true);
        assert!(!history.has_success("u1"));
        assert!(history.pull_failures().is_empty());
    }

    #[test]
    fn sub_key_partitions_files() {
        let dir = TempDir::new().unwrap();
        let a = History::new("demo", "k1", dir.path());
        let b = History::new("demo", "k2", dir.path());
        a.add_success("u1");
        a.flush_success().unwrap();
        b.load_success(true);
        assert!(!b.has_success("u1"));
    }
}
