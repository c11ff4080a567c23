//! CSV backend: one file per (namespace, rule) per batch, UTF-8 BOM,
//! header row from the rule's ordered fields.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use super::{render, DataCell, OutputSink, SinkError};
use crate::spider::Spider;

const DEFAULT_COLUMNS: [&str; 3] = ["url", "parent_url", "download_time"];

pub struct CsvSink {
    dir: PathBuf,
    namespace: String,
    spider: Arc<Spider>,
    /// Timestamp folder shared by every file of the run.
    run_stamp: String,
}

impl CsvSink {
    pub fn new(spider: Arc<Spider>, dir: PathBuf, run_stamp: String) -> Self {
        Self {
            namespace: super::namespace(&spider),
            dir,
            spider,
            run_stamp,
        }
    }
}

impl OutputSink for CsvSink {
    fn write_batch(&mut self, batch_seq: u64, cells: &[DataCell]) -> Result<(), SinkError> {
        let mut by_rule: HashMap<&str, Vec<&DataCell>> = HashMap::new();
        for cell in cells {
            by_rule.entry(cell.rule.as_str()).or_default().push(cell);
        }

        for (rule_name, group) in by_rule {
            let Some(rule) = self.spider.get_rule(rule_name) else {
                warn!(rule = rule_name, "dropping cells for unknown rule");
                continue;
            };
            let fields = rule.fields();

            let folder = self
                .dir
                .join(&self.run_stamp)
                .join(&self.namespace)
                .join(rule_name);
            fs::create_dir_all(&folder)?;
            let path = folder.join(format!("batch-{batch_seq}.csv"));

            let mut file = fs::File::create(&path)?;
            // BOM so spreadsheet tools pick up UTF-8
            file.write_all(b"\xEF\xBB\xBF")?;
            let mut writer = csv::Writer::from_writer(file);

            let mut header: Vec<&str> = fields.iter().map(String::as_str).collect();
            if !self.spider.omit_default_fields {
                header.extend(DEFAULT_COLUMNS);
            }
            writer
                .write_record(&header)
                .map_err(|e| SinkError::Encode(e.to_string()))?;

            for cell in group {
                let mut row: Vec<String> = fields
                    .iter()
                    .map(|f| render(cell.data.get(f)))
                    .collect();
                if !self.spider.omit_default_fields {
                    row.push(cell.url.clone());
                    row.push(cell.parent_url.clone());
                    row.push(cell.download_time.clone());
                }
                writer
                    .write_record(&row)
                    .map_err(|e| SinkError::Encode(e.to_string()))?;
            }
            writer
                .flush()
                .map_err(|e| SinkError::Encode(e.to_string()))?;
        }
        Ok(())
    }
}
