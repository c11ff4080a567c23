//! Segmented output pipeline: a bounded data lane that batches text
//! records up to the configured capacity, and a file lane that writes
//! artifacts as they arrive. Both drain on dedicated writer threads; the
//! run report is emitted once both lanes are dry.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::counters::Report;
use crate::output::{DataCell, FileCell, OutputSink};
use crate::spider::Spider;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The sink side shut down; the caller should stop draining its
    /// current context.
    #[error("output pipeline closed")]
    Closed,
}

#[derive(Clone)]
pub struct PipelineSettings {
    /// Batch capacity: a full buffer triggers a sink write.
    pub docker_cap: usize,
    pub file_dir: PathBuf,
    /// Folder stamp shared by all artifacts of this run.
    pub run_stamp: String,
    /// Run start, for the report's elapsed time.
    pub run_start: Instant,
}

pub struct Pipeline {
    spider: Arc<Spider>,
    settings: PipelineSettings,
    data_tx: Mutex<Option<flume::Sender<DataCell>>>,
    file_tx: Mutex<Option<flume::Sender<FileCell>>>,
    data_rx: Mutex<Option<flume::Receiver<DataCell>>>,
    file_rx: Mutex<Option<flume::Receiver<FileCell>>>,
    sink: Mutex<Option<Box<dyn OutputSink>>>,
    report_tx: flume::Sender<Report>,
    data_sum: Arc<AtomicU64>,
    file_sum: Arc<AtomicU64>,
}

impl Pipeline {
    pub fn new(
        spider: Arc<Spider>,
        settings: PipelineSettings,
        sink: Box<dyn OutputSink>,
        report_tx: flume::Sender<Report>,
    ) -> Self {
        let cap = settings.docker_cap.max(1);
        let (data_tx, data_rx) = flume::bounded(cap);
        let (file_tx, file_rx) = flume::bounded(cap);
        Self {
            spider,
            settings,
            data_tx: Mutex::new(Some(data_tx)),
            file_tx: Mutex::new(Some(file_tx)),
            data_rx: Mutex::new(Some(data_rx)),
            file_rx: Mutex::new(Some(file_rx)),
            sink: Mutex::new(Some(sink)),
            report_tx,
            data_sum: Arc::new(AtomicU64::new(0)),
            file_sum: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns the writer threads. Call once per run.
    pub fn start(&self) {
        let Some(data_rx) = self.data_rx.lock().take() else {
            return;
        };
        let Some(file_rx) = self.file_rx.lock().take() else {
            return;
        };
        let Some(sink) = self.sink.lock().take() else {
            return;
        };

        let data_thread = {
            let spider = Arc::clone(&self.spider);
            let data_sum = Arc::clone(&self.data_sum);
            let cap = self.settings.docker_cap.max(1);
            thread::spawn(move || Self::drain_data(spider, data_rx, sink, cap, data_sum))
        };
        let file_thread = {
            let spider = Arc::clone(&self.spider);
            let file_sum = Arc::clone(&self.file_sum);
            let dir = self.settings.file_dir.clone();
            let stamp = self.settings.run_stamp.clone();
            thread::spawn(move || Self::drain_files(spider, file_rx, dir, stamp, file_sum))
        };

        // supervisor: wait for both lanes, then report
        let spider = Arc::clone(&self.spider);
        let report_tx = self.report_tx.clone();
        let data_sum = Arc::clone(&self.data_sum);
        let file_sum = Arc::clone(&self.file_sum);
        let run_start = self.settings.run_start;
        thread::spawn(move || {
            let _ = data_thread.join();
            let _ = file_thread.join();
            let _ = report_tx.send(Report {
                spider_name: spider.name.clone(),
                keyword: spider.keyword(),
                data_count: data_sum.load(Ordering::Relaxed),
                file_count: file_sum.load(Ordering::Relaxed),
                elapsed: run_start.elapsed(),
            });
        });
    }

    /// Hands a text record to the data lane. Blocks while the lane is
    /// full; errors once the pipeline has been stopped.
    pub async fn collect_data(&self, cell: DataCell) -> Result<(), PipelineError> {
        let tx = self.data_tx.lock().clone().ok_or(PipelineError::Closed)?;
        tx.send_async(cell).await.map_err(|_| PipelineError::Closed)
    }

    /// Hands a file artifact to the file lane.
    pub async fn collect_file(&self, cell: FileCell) -> Result<(), PipelineError> {
        let tx = self.file_tx.lock().clone().ok_or(PipelineError::Closed)?;
        tx.send_async(cell).await.map_err(|_| PipelineError::Closed)
    }

    /// Closes both lanes. The writer threads flush what they hold and the
    /// supervisor emits the run report.
    pub fn stop(&self) {
        self.data_tx.lock().take();
        self.file_tx.lock().take();
    }

    fn drain_data(
        spider: Arc<Spider>,
        data_rx: flume::Receiver<DataCell>,
        mut sink: Box<dyn OutputSink>,
        cap: usize,
        data_sum: Arc<AtomicU64>,
    ) {
        let mut buffer: Vec<DataCell> = Vec::with_capacity(cap);
        let mut batch_seq = 0u64;
        loop {
            match data_rx.recv() {
                Ok(cell) => {
                    buffer.push(cell);
                    if buffer.len() >= cap {
                        batch_seq += 1;
                        Self::flush(&spider, &mut sink, batch_seq, &mut buffer, &data_sum);
                    }
                }
                Err(_) => {
                    batch_seq += 1;
                    Self::flush(&spider, &mut sink, batch_seq, &mut buffer, &data_sum);
                    break;
                }
            }
        }
    }

    fn flush(
        spider: &Arc<Spider>,
        sink: &mut Box<dyn OutputSink>,
        batch_seq: u64,
        buffer: &mut Vec<DataCell>,
        data_sum: &AtomicU64,
    ) {
        if buffer.is_empty() {
            return;
        }
        let count = buffer.len() as u64;
        match sink.write_batch(batch_seq, buffer) {
            Ok(()) => {
                data_sum.fetch_add(count, Ordering::Relaxed);
                info!(
                    spider = %spider.name,
                    batch = batch_seq,
                    records = count,
                    "batch written"
                );
                if spider.is_bound() {
                    spider.matrix().try_flush_success();
                }
            }
            Err(err) => {
                error!(
                    spider = %spider.name,
                    batch = batch_seq,
                    records = count,
                    %err,
                    "batch write failed"
                );
            }
        }
        buffer.clear();
    }

    fn drain_files(
        spider: Arc<Spider>,
        file_rx: flume::Receiver<FileCell>,
        dir: PathBuf,
        stamp: String,
        file_sum: Arc<AtomicU64>,
    ) {
        let namespace = crate::output::namespace(&spider);
        let mut writers = Vec::new();
        while let Ok(cell) = file_rx.recv() {
            let folder = dir.join(&stamp).join(&namespace).join(&cell.rule);
            writers.push(thread::spawn(move || {
                if let Err(err) = std::fs::create_dir_all(&folder) {
                    error!(%err, "file output dir failed");
                    return false;
                }
                let path = folder.join(&cell.name);
                match std::fs::write(&path, &cell.bytes) {
                    Ok(()) => {
                        info!(path = %path.display(), size = cell.bytes.len(), "file written");
                        true
                    }
                    Err(err) => {
                        error!(path = %path.display(), %err, "file write failed");
                        false
                    }
                }
            }));
        }
        for writer in writers {
            if writer.join().unwrap_or(false) {
                file_sum.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::output::MemorySink;
    use crate::spider::ParseFn;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    fn cell(rule: &str, key: &str) -> DataCell {
        DataCell {
            rule: rule.to_string(),
            data: HashMap::from([(key.to_string(), serde_json::json!("v"))]),
            url: String::new(),
            parent_url: String::new(),
            download_time: String::new(),
        }
    }

    fn settings(dir: &TempDir, cap: usize) -> PipelineSettings {
        PipelineSettings {
            docker_cap: cap,
            file_dir: dir.path().to_path_buf(),
            run_stamp: "run".to_string(),
            run_start: Instant::now(),
        }
    }

    #[tokio::test]
    async fn batches_flush_on_capacity_and_close() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let batches = sink.handle();
        let (report_tx, report_rx) = flume::unbounded();
        let spider = Arc::new(Spider::new("demo", noop()));

        let pipeline = Pipeline::new(
            Arc::clone(&spider),
            settings(&dir, 2),
            Box::new(sink),
            report_tx,
        );
        pipeline.start();

        for i in 0..5 {
            pipeline.collect_data(cell("list", &format!("k{i}"))).await.unwrap();
        }
        pipeline.stop();

        let report = report_rx.recv_async().await.unwrap();
        assert_eq!(report.data_count, 5);
        assert_eq!(report.spider_name, "demo");

        let captured = batches.lock();
        // two full batches plus the remainder
        assert_eq!(captured.len(), 3);
        assert_eq!(captured[0].len(), 2);
        assert_eq!(captured[2].len(), 1);
    }

    #[tokio::test]
    async fn collect_after_stop_errors() {
        let dir = TempDir::new().unwrap();
        let (report_tx, _report_rx) = flume::unbounded();
        let spider = Arc::new(Spider::new("demo", noop()));
        let pipeline = Pipeline::new(
            spider,
            settings(&dir, 2),
            Box::new(MemorySink::new()),
            report_tx,
        );
        pipeline.start();
        pipeline.stop();

        let err = pipeline.collect_data(cell("list", "k")).await;
        assert!(matches!(err, Err(PipelineError::Closed)));
    }

    #[tokio::test]
    async fn files_are_written_and_counted() {
        let dir = TempDir::new().unwrap();
        let (report_tx, report_rx) = flume::unbounded();
        let spider = Arc::new(Spider::new("demo", noop()));
        let pipeline = Pipeline::new(
            Arc::clone(&spider),
            settings(&dir, 4),
            Box::new(MemorySink::new()),
            report_tx,
        );
        pipeline.start();

        pipeline
            .collect_file(FileCell {
                rule: "list".to_string(),
                name: "page.html".to_string(),
                bytes: b"<html/>".to_vec(),
            })
            .await
            .unwrap();
        pipeline.stop();

        let report = report_rx.recv_async().await.unwrap();
        assert_eq!(report.file_count, 1);
        let path = dir.path().join("run/demo/list/page.html");
        assert_eq!(std::fs::read(path).unwrap(), b"<html/>");
    }
}
