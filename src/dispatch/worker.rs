//! Worker-side operation handlers: received tasks land in the local jar.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info};

use super::frame::NetData;
use super::task::{Task, TaskJar};
use super::{Api, ApiHandler};

pub fn worker_api(jar: Arc<TaskJar>) -> Api {
    let mut api: Api = Api::new();
    api.insert("task".to_string(), Arc::new(TaskIntake { jar }));
    api
}

struct TaskIntake {
    jar: Arc<TaskJar>,
}

#[async_trait]
impl ApiHandler for TaskIntake {
    async fn handle(&self, data: NetData) -> Option<NetData> {
        let parsed: Result<Task, _> = match data.body {
            // tolerate both a JSON object and a JSON-encoded string body
            Value::String(ref s) => serde_json::from_str(s),
            ref other => serde_json::from_value(other.clone()),
        };
        match parsed {
            Ok(task) => {
                info!(task = task.id, spiders = task.spiders.len(), "task received");
                self.jar.receive(task);
            }
            Err(err) => error!(%err, "undecodable task frame"),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TaskSpider;
    use serde_json::json;

    #[tokio::test]
    async fn task_frames_fill_the_jar() {
        let jar = Arc::new(TaskJar::new());
        let api = worker_api(Arc::clone(&jar));
        let handler = api.get("task").unwrap();

        let mut task = Task::default();
        task.spiders.push(TaskSpider {
            name: "demo".to_string(),
            keyword: "rust".to_string(),
        });
        let frame = NetData::new(
            "master",
            "worker-1",
            "task",
            "",
            serde_json::to_value(&task).unwrap(),
        );
        assert!(handler.handle(frame).await.is_none());
        assert_eq!(jar.len(), 1);

        // string-encoded bodies decode too
        let frame = NetData::new(
            "master",
            "worker-1",
            "task",
            "",
            json!(serde_json::to_string(&task).unwrap()),
        );
        handler.handle(frame).await;
        assert_eq!(jar.len(), 2);
    }
}
