//! JSON-lines backend: one append-mode file per namespace, one record
//! per line.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use super::{DataCell, OutputSink, SinkError};
use crate::spider::Spider;

pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(spider: Arc<Spider>, dir: PathBuf, run_stamp: String) -> Self {
        let path = dir
            .join(run_stamp)
            .join(format!("{}.jsonl", super::namespace(&spider)));
        Self { path }
    }
}

impl OutputSink for JsonLinesSink {
    fn write_batch(&mut self, _batch_seq: u64, cells: &[DataCell]) -> Result<(), SinkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        for cell in cells {
            let line = json!({
                "rule": cell.rule,
                "data": cell.data,
                "url": cell.url,
                "parent_url": cell.parent_url,
                "download_time": cell.download_time,
            });
            let encoded =
                serde_json::to_string(&line).map_err(|e| SinkError::Encode(e.to_string()))?;
            writeln!(file, "{encoded}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::spider::ParseFn;
    use std::collections::HashMap;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    #[test]
    fn appends_one_line_per_cell() {
        let dir = tempfile::TempDir::new().unwrap();
        let spider = Arc::new(Spider::new("demo", noop()));
        let mut sink = JsonLinesSink::new(spider, dir.path().to_path_buf(), "run".to_string());

        let cell = DataCell {
            rule: "list".to_string(),
            data: HashMap::from([("k".to_string(), serde_json::json!("v"))]),
            url: "http://example.test/a".to_string(),
            parent_url: String::new(),
            download_time: String::new(),
        };
        sink.write_batch(1, std::slice::from_ref(&cell)).unwrap();
        sink.write_batch(2, &[cell]).unwrap();

        let text = fs::read_to_string(dir.path().join("run/demo.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
        let parsed: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["data"]["k"], "v");
    }
}
