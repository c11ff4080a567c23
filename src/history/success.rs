use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use tracing::warn;

use super::HistoryError;

/// Success records: the set loaded from the backend (`old`) plus the ids
/// added this run (`new`). Membership is the union of both.
pub(crate) struct Successes {
    path: PathBuf,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    old: HashSet<String>,
    new: HashSet<String>,
    inheritable: bool,
}

impl Successes {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(State::default()),
        }
    }

    pub(crate) fn load(&self, inherit: bool) {
        let mut state = self.state.write();

        if !inherit {
            state.old.clear();
            state.new.clear();
            state.inheritable = false;
            return;
        }
        if state.inheritable {
            // previous load already inherited; keep the old set untouched
            return;
        }
        state.old.clear();
        state.new.clear();
        state.inheritable = true;

        let bytes = match fs::read(&self.path) {
            Ok(b) if !b.is_empty() => b,
            _ => return,
        };
        match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
            Ok(records) => {
                state.old.extend(records.into_keys());
            }
            Err(err) => warn!(path = %self.path.display(), %err, "unreadable success record"),
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        let state = self.state.read();
        state.old.contains(id) || state.new.contains(id)
    }

    pub(crate) fn add(&self, id: &str) -> bool {
        let mut state = self.state.write();
        if state.old.contains(id) || state.new.contains(id) {
            return false;
        }
        state.new.insert(id.to_string());
        true
    }

    pub(crate) fn remove(&self, id: &str) {
        self.state.write().new.remove(id);
    }

    /// Writes the full success set as one JSON object. The merge of `new`
    /// into `old` happens only after the write succeeds so in-memory state
    /// survives backend outages.
    pub(crate) fn flush(&self) -> Result<usize, HistoryError> {
        let mut state = self.state.write();
        let count = state.new.len();
        if count == 0 {
            return Ok(0);
        }

        let mut records: HashMap<&str, &str> =
            HashMap::with_capacity(state.old.len() + state.new.len());
        for id in state.old.iter().chain(state.new.iter()) {
            records.insert(id, "1");
        }
        let body = serde_json::to_vec(&records)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| HistoryError::Write { count, source })?;
        }
        fs::write(&self.path, body).map_err(|source| HistoryError::Write { count, source })?;

        let added: Vec<String> = state.new.drain().collect();
        state.old.extend(added);
        Ok(count)
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        state.old.clear();
        state.new.clear();
    }
}
