//! Master-side operation handlers: task hand-out and worker log intake.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use super::frame::NetData;
use super::task::TaskJar;
use super::{Api, ApiHandler};

/// Handlers the master installs: `task` serves the next queued task,
/// `log` surfaces a worker's log line tagged with its UID.
pub fn master_api(jar: Arc<TaskJar>) -> Api {
    let mut api: Api = Api::new();
    api.insert("task".to_string(), Arc::new(TaskHandout { jar }));
    api.insert("log".to_string(), Arc::new(LogIntake));
    api
}

struct TaskHandout {
    jar: Arc<TaskJar>,
}

#[async_trait]
impl ApiHandler for TaskHandout {
    async fn handle(&self, data: NetData) -> Option<NetData> {
        // blocks until the engine queues a task
        let task = self.jar.next().await?;
        let body = match serde_json::to_value(&task) {
            Ok(v) => v,
            Err(err) => {
                error!(%err, "task encode failed");
                return None;
            }
        };
        info!(task = task.id, worker = %data.from, "task dispatched");
        Some(NetData::new("", "", "task", "", body))
    }
}

struct LogIntake;

#[async_trait]
impl ApiHandler for LogIntake {
    async fn handle(&self, data: NetData) -> Option<NetData> {
        let line = match &data.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        info!(worker = %data.from, "{line}");
        None
    }
}
