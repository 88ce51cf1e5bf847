//! Newline-delimited JSON output.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::pipeline::{RecordFilter, Sink};
use crate::record::Record;

/// Writes one JSON object per record per line.
///
/// Keys appear in the record's insertion order; timestamps are formatted
/// as ISO-8601 with nine-digit fractional seconds and a numeric offset.
/// Output is buffered and flushed when the pipeline shuts down.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
    path: PathBuf,
    filter: Option<RecordFilter>,
}

impl JsonLinesSink {
    /// Create (or truncate) the output file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<JsonLinesSink> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(JsonLinesSink {
            writer: BufWriter::new(File::create(&path)?),
            path,
            filter: None,
        })
    }

    /// Only write records passing `filter`.
    pub fn with_filter(mut self, filter: RecordFilter) -> JsonLinesSink {
        self.filter = Some(filter);
        self
    }

    /// Where this sink writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for JsonLinesSink {
    fn accepts(&self, record: &Record) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(record))
    }

    fn write(&mut self, record: &Record) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::keys;

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        {
            let mut sink = JsonLinesSink::create(&path).unwrap();
            for n in 0..5_i64 {
                sink.write(&Record::new().with("n", n).with("tag", "x")).unwrap();
            }
            sink.flush().unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        for (n, line) in lines.iter().enumerate() {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["n"], serde_json::json!(n));
        }
        assert!(!contents.ends_with(" \n"));
    }

    #[test]
    fn filter_applies() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::create(dir.path().join("out.json"))
            .unwrap()
            .with_filter(RecordFilter {
                categories: Some(vec!["profile".to_owned()]),
                ..RecordFilter::default()
            });
        assert!(sink.accepts(&Record::new().with(keys::CATEGORY, "profile")));
        assert!(!sink.accepts(&Record::new().with(keys::CATEGORY, "trace")));
    }
}
