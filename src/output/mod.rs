//! Output capability: the cells produced by rule code and the sinks that
//! persist them. Text cells travel through the batched pipeline; file
//! cells are streamed to disk as they arrive.

mod csv;
mod jsonl;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::spider::Spider;

pub use csv::CsvSink;
pub use jsonl::JsonLinesSink;

/// One text record emitted by a rule.
#[derive(Debug, Clone)]
pub struct DataCell {
    /// Rule that produced the record; selects the column set.
    pub rule: String,
    pub data: HashMap<String, Value>,
    /// Default columns; empty when the spider suppresses them.
    pub url: String,
    pub parent_url: String,
    pub download_time: String,
}

/// One file artifact emitted by a rule.
#[derive(Debug, Clone)]
pub struct FileCell {
    pub rule: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink encode error: {0}")]
    Encode(String),
}

/// A text-output backend. Runs on the pipeline's writer thread, so
/// implementations are synchronous. Schema-bearing backends create their
/// per-(namespace, rule) artifacts lazily on first write.
pub trait OutputSink: Send {
    fn write_batch(&mut self, batch_seq: u64, cells: &[DataCell]) -> Result<(), SinkError>;
}

/// Builds the sink for one spider run.
pub type SinkFactory = Arc<dyn Fn(&Arc<Spider>) -> Box<dyn OutputSink> + Send + Sync>;

/// Text-output backends selectable by name.
pub const OUTPUT_KINDS: &[&str] = &["csv", "jsonl"];

/// Output namespace for a spider run: the spider name, extended by its
/// keyword when one is set.
pub fn namespace(spider: &Spider) -> String {
    let keyword = spider.keyword();
    if keyword.is_empty() {
        spider.name.clone()
    } else {
        format!("{}__{}", spider.name, keyword)
    }
}

/// A sink that keeps every batch in memory. Used by tests and by
/// embedders that post-process records themselves.
#[derive(Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<DataCell>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the captured batches.
    pub fn handle(&self) -> Arc<Mutex<Vec<Vec<DataCell>>>> {
        Arc::clone(&self.batches)
    }
}

impl OutputSink for MemorySink {
    fn write_batch(&mut self, _batch_seq: u64, cells: &[DataCell]) -> Result<(), SinkError> {
        self.batches.lock().push(cells.to_vec());
        Ok(())
    }
}

/// JSON-friendly rendering of a cell value for tabular backends.
pub(crate) fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::spider::ParseFn;

    fn noop() -> ParseFn {
        Arc::new(|_ctx: &mut Context| {})
    }

    #[test]
    fn namespace_includes_keyword() {
        let spider = Spider::new("demo", noop());
        assert_eq!(namespace(&spider), "demo");
        spider.set_keyword("rust");
        assert_eq!(namespace(&spider), "demo__rust");
    }

    #[test]
    fn render_flattens_values() {
        assert_eq!(render(None), "");
        assert_eq!(render(Some(&Value::String("x".into()))), "x");
        assert_eq!(render(Some(&Value::from(3))), "3");
        assert_eq!(render(Some(&serde_json::json!(["a", "b"]))), r#"["a","b"]"#);
    }

    #[test]
    fn memory_sink_captures_batches() {
        let sink_handle;
        {
            let mut sink = MemorySink::new();
            sink_handle = sink.handle();
            let cell = DataCell {
                rule: "list".to_string(),
                data: HashMap::new(),
                url: "http://example.test/".to_string(),
                parent_url: String::new(),
                download_time: String::new(),
            };
            sink.write_batch(1, &[cell]).unwrap();
        }
        assert_eq!(sink_handle.lock().len(), 1);
    }
}
