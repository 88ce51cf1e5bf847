//! Synchronized standard-stream output.

use std::io::{self, Write};

use crate::pipeline::{RecordFilter, Sink};
use crate::record::Record;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StreamTarget {
    Stdout,
    Stderr,
}

/// Writes JSON lines to standard output or standard error.
///
/// Each write serializes the whole line first and emits it under the
/// stream's lock, so records from concurrent pipelines or host prints
/// never interleave mid-line.
pub struct StreamSink {
    target: StreamTarget,
    filter: Option<RecordFilter>,
}

impl StreamSink {
    /// A sink over standard output.
    pub fn stdout() -> StreamSink {
        StreamSink {
            target: StreamTarget::Stdout,
            filter: None,
        }
    }

    /// A sink over standard error.
    pub fn stderr() -> StreamSink {
        StreamSink {
            target: StreamTarget::Stderr,
            filter: None,
        }
    }

    /// Only write records passing `filter`.
    pub fn with_filter(mut self, filter: RecordFilter) -> StreamSink {
        self.filter = Some(filter);
        self
    }
}

impl Sink for StreamSink {
    fn accepts(&self, record: &Record) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(record))
    }

    fn write(&mut self, record: &Record) -> io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        match self.target {
            StreamTarget::Stdout => io::stdout().lock().write_all(line.as_bytes()),
            StreamTarget::Stderr => io::stderr().lock().write_all(line.as_bytes()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target {
            StreamTarget::Stdout => io::stdout().lock().flush(),
            StreamTarget::Stderr => io::stderr().lock().flush(),
        }
    }
}
