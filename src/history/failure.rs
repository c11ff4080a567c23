use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::warn;

use super::HistoryError;
use crate::request::Request;

/// Failure records: unique -> full serialized request, replayed at the
/// start of the next inheriting run.
pub(crate) struct Failures {
    path: PathBuf,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    list: HashMap<String, Request>,
    inheritable: bool,
}

impl Failures {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(State::default()),
        }
    }

    pub(crate) fn load(&self, inherit: bool) {
        let mut state = self.state.write();

        if !inherit {
            state.list.clear();
            state.inheritable = false;
            return;
        }
        if state.inheritable {
            return;
        }
        state.list.clear();
        state.inheritable = true;

        let bytes = match fs::read(&self.path) {
            Ok(b) if !b.is_empty() => b,
            _ => return,
        };
        let records: HashMap<String, String> = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "unreadable failure record");
                return;
            }
        };
        for (id, serialized) in records {
            match Request::deserialize(&serialized) {
                Ok(req) => {
                    state.list.insert(id, req);
                }
                Err(err) => warn!(%id, %err, "skipping corrupt failure record"),
            }
        }
    }

    pub(crate) fn pull(&self) -> HashMap<String, Request> {
        std::mem::take(&mut self.state.write().list)
    }

    pub(crate) fn upsert(&self, req: &Request) -> bool {
        let mut state = self.state.write();
        let id = req.unique();
        if state.list.contains_key(&id) {
            return false;
        }
        state.list.insert(id, req.clone());
        true
    }

    pub(crate) fn remove(&self, req: &Request) {
        self.state.write().list.remove(&req.unique());
    }

    /// Overwrite flush: the stale file is removed first, then the current
    /// map is written whole. Zero records still clears the old file.
    pub(crate) fn flush(&self) -> Result<usize, HistoryError> {
        let state = self.state.read();
        let count = state.list.len();

        let _ = fs::remove_file(&self.path);
        if count == 0 {
            return Ok(0);
        }

        let mut records: HashMap<&String, String> = HashMap::with_capacity(count);
        for (id, req) in state.list.iter() {
            records.insert(id, req.serialize());
        }
        let body = serde_json::to_vec(&records)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| HistoryError::Write { count, source })?;
        }
        fs::write(&self.path, body).map_err(|source| HistoryError::Write { count, source })?;
        Ok(count)
    }

    pub(crate) fn clear(&self) {
        self.state.write().list.clear();
    }
}
