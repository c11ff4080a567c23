//! Dispatch tasks: a bundle of (spider name, keyword) pairs plus the
//! runtime config snapshot a worker needs to reproduce the run.

use serde::{Deserialize, Serialize};

use crate::config::AppConf;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TaskSpider {
    pub name: String,
    pub keyword: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Task {
    pub id: usize,
    pub spiders: Vec<TaskSpider>,
    pub thread_num: usize,
    pub pause_ms: u64,
    pub out_type: String,
    pub docker_cap: usize,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    pub limit: i64,
    pub proxy_minute: u64,
    pub keywords: String,
}

impl Task {
    /// Config snapshot without spiders; the master chunks spiders in.
    pub fn from_conf(conf: &AppConf) -> Self {
        Self {
            id: 0,
            spiders: Vec::new(),
            thread_num: conf.thread_num,
            pause_ms: conf.pause_ms,
            out_type: conf.out_type.clone(),
            docker_cap: conf.docker_cap,
            success_inherit: conf.success_inherit,
            failure_inherit: conf.failure_inherit,
            limit: conf.limit,
            proxy_minute: conf.proxy_minute,
            keywords: conf.keywords.clone(),
        }
    }

    /// Overwrites the worker's runtime config from this task.
    pub fn apply_to(&self, conf: &mut AppConf) {
        conf.thread_num = self.thread_num;
        conf.pause_ms = self.pause_ms;
        conf.out_type = self.out_type.clone();
        conf.docker_cap = self.docker_cap;
        conf.success_inherit = self.success_inherit;
        conf.failure_inherit = self.failure_inherit;
        conf.limit = self.limit;
        conf.proxy_minute = self.proxy_minute;
        conf.keywords = self.keywords.clone();
    }
}

/// Task store shared between the dispatch endpoint and the engine. The
/// master fills it from its prepared queue; a worker fills it from
/// received frames and drains it in its run loop.
pub struct TaskJar {
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
}

impl TaskJar {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1024);
        Self { tx, rx }
    }

    /// Master side: queue a generated task, stamped with its position.
    pub fn push(&self, mut task: Task) {
        task.id = self.len();
        let _ = self.tx.send(task);
    }

    /// Worker side: store a task received from the master.
    pub fn receive(&self, task: Task) {
        let _ = self.tx.send(task);
    }

    /// Blocking dequeue; `None` once the jar is closed.
    pub async fn next(&self) -> Option<Task> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Option<Task> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for TaskJar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conf_round_trips_through_task() {
        let mut conf = AppConf::default();
        conf.thread_num = 7;
        conf.limit = 42;
        conf.out_type = "jsonl".to_string();

        let task = Task::from_conf(&conf);
        let mut other = AppConf::default();
        task.apply_to(&mut other);
        assert_eq!(other.thread_num, 7);
        assert_eq!(other.limit, 42);
        assert_eq!(other.out_type, "jsonl");
    }

    #[tokio::test]
    async fn jar_orders_and_stamps_tasks() {
        let jar = TaskJar::new();
        jar.push(Task::default());
        jar.push(Task::default());
        assert_eq!(jar.len(), 2);

        let first = jar.next().await.unwrap();
        let second = jar.next().await.unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert!(jar.is_empty());
    }
}
