//! Fan-out of records to asynchronous sink writers.
//!
//! The pipeline owns any number of [`Sink`]s, each served by its own
//! writer task fed over an unbounded channel. Submitting a record is a
//! channel send per sink; the writes themselves happen off the
//! instrumentation path and hold no library lock. Dropping or shutting
//! down the pipeline closes every channel and then joins every writer, so
//! all outstanding writes are drained before the call returns.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use serde::Deserialize;

use crate::output::{generated_file_name, OutputTarget};
use crate::record::{keys, Record};
use crate::sinks::JsonLinesSink;

/// A destination for records.
///
/// `write` is called from a dedicated task that shares no state with
/// other sinks; a sink holding mutable state (a file handle, say) needs no
/// synchronization of its own beyond that. Filtering happens on the same
/// task via [`accepts`](Sink::accepts), which must stay a pure predicate
/// over the record and never block.
pub trait Sink: Send {
    /// Whether this sink wants `record` at all.
    fn accepts(&self, record: &Record) -> bool {
        let _ = record;
        true
    }

    /// Write one record.
    fn write(&mut self, record: &Record) -> io::Result<()>;

    /// Flush buffered output; called once when the pipeline shuts down.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Declarative record filtering for the built-in sinks.
///
/// The host assembles one of these from its own configuration surface
/// (command line, environment, config file) and attaches it to a sink. A
/// `None` field matches everything; a listed field requires the record to
/// carry one of the listed values under the corresponding key.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RecordFilter {
    /// Allowed `category` values.
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    /// Allowed `subsystem` values.
    #[serde(default)]
    pub subsystems: Option<Vec<String>>,
    /// Allowed `client` values.
    #[serde(default)]
    pub clients: Option<Vec<String>>,
    /// Allowed `request` values.
    #[serde(default)]
    pub requests: Option<Vec<String>>,
}

impl RecordFilter {
    /// Pure predicate: does `record` pass this filter?
    pub fn matches(&self, record: &Record) -> bool {
        let field_matches = |allowed: &Option<Vec<String>>, key: &str| match allowed {
            None => true,
            Some(values) => record
                .get_str(key)
                .map(|v| values.iter().any(|allowed| allowed == v))
                .unwrap_or(false),
        };
        field_matches(&self.categories, keys::CATEGORY)
            && field_matches(&self.subsystems, keys::SUBSYSTEM)
            && field_matches(&self.clients, keys::CLIENT)
            && field_matches(&self.requests, keys::REQUEST)
    }
}

struct SinkWorker {
    sender: Sender<Arc<Record>>,
    thread: thread::JoinHandle<u64>,
}

/// Fan-out of records to every registered sink.
///
/// If nothing has been registered by the time of the first submission, a
/// default newline-delimited JSON sink writing to a process-specific file
/// under the temp directory is installed, exactly once.
#[derive(Default)]
pub struct SinkPipeline {
    workers: Vec<SinkWorker>,
    defaulted: bool,
}

impl SinkPipeline {
    /// Construct a pipeline with no sinks.
    pub fn new() -> SinkPipeline {
        SinkPipeline::default()
    }

    /// Number of live sinks.
    pub fn sink_count(&self) -> usize {
        self.workers.len()
    }

    /// Register a sink and start its writer task.
    pub fn install(&mut self, sink: Box<dyn Sink>) {
        let (sender, receiver) = unbounded::<Arc<Record>>();
        let spawned = thread::Builder::new()
            .name("scopeprof-sink".to_owned())
            .spawn(move || {
                let mut sink = sink;
                let mut failures = 0_u64;
                for record in receiver {
                    if !sink.accepts(&record) {
                        continue;
                    }
                    if let Err(err) = sink.write(&record) {
                        if failures == 0 {
                            log::warn!("sink write failed: {err}");
                        }
                        failures += 1;
                    }
                }
                if let Err(err) = sink.flush() {
                    log::warn!("sink flush failed: {err}");
                    failures += 1;
                }
                failures
            });
        match spawned {
            Ok(thread) => self.workers.push(SinkWorker { sender, thread }),
            Err(err) => log::error!("could not start sink task, sink discarded: {err}"),
        }
    }

    /// Dispatch `record` to every sink.
    ///
    /// The record is shared read-only between the writer tasks; this call
    /// only enqueues and never waits for a write.
    pub fn submit(&mut self, record: Record) {
        if self.workers.is_empty() {
            if self.defaulted {
                return;
            }
            self.defaulted = true;
            self.install_default_sink();
        }
        let shared = Arc::new(record);
        // A send only fails when a writer task died; drop such sinks.
        self.workers
            .retain(|worker| worker.sender.send(Arc::clone(&shared)).is_ok());
    }

    fn install_default_sink(&mut self) {
        let path = std::env::temp_dir().join(generated_file_name("json"));
        match JsonLinesSink::create(&path) {
            Ok(sink) => {
                log::debug!("no sink registered, defaulting to {}", path.display());
                self.install(Box::new(sink));
            }
            Err(err) => {
                log::warn!(
                    "could not create default sink at {}: {err}",
                    path.display()
                );
            }
        }
    }

    /// Open a JSON-lines sink at a resolved [`OutputTarget`] and register
    /// it.
    pub fn install_json_target(&mut self, target: &OutputTarget) -> io::Result<()> {
        match target {
            OutputTarget::File(path) => {
                self.install(Box::new(JsonLinesSink::create(path)?));
            }
            OutputTarget::Stdout => {
                self.install(Box::new(crate::sinks::StreamSink::stdout()));
            }
            OutputTarget::Stderr => {
                self.install(Box::new(crate::sinks::StreamSink::stderr()));
            }
        }
        Ok(())
    }

    /// Close every channel and wait for every outstanding write.
    ///
    /// Returns the total number of failed writes across all sinks.
    pub fn shutdown(&mut self) -> u64 {
        let mut failures = 0;
        for worker in self.workers.drain(..) {
            drop(worker.sender);
            match worker.thread.join() {
                Ok(sink_failures) => failures += sink_failures,
                Err(_) => {
                    log::warn!("sink task panicked during shutdown");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            log::warn!("{failures} record writes failed");
        }
        failures
    }
}

impl Drop for SinkPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects every accepted record into shared storage.
    pub(crate) struct CaptureSink {
        pub records: Arc<Mutex<Vec<Record>>>,
        pub filter: Option<RecordFilter>,
    }

    impl Sink for CaptureSink {
        fn accepts(&self, record: &Record) -> bool {
            self.filter.as_ref().map_or(true, |f| f.matches(record))
        }

        fn write(&mut self, record: &Record) -> io::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn fan_out_reaches_every_sink() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = SinkPipeline::new();
        pipeline.install(Box::new(CaptureSink {
            records: Arc::clone(&first),
            filter: None,
        }));
        pipeline.install(Box::new(CaptureSink {
            records: Arc::clone(&second),
            filter: None,
        }));

        for n in 0..100_i64 {
            pipeline.submit(Record::new().with("n", n));
        }
        pipeline.shutdown();

        assert_eq!(first.lock().unwrap().len(), 100);
        assert_eq!(second.lock().unwrap().len(), 100);
    }

    #[test]
    fn filters_are_applied_per_sink() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = SinkPipeline::new();
        pipeline.install(Box::new(CaptureSink {
            records: Arc::clone(&records),
            filter: Some(RecordFilter {
                categories: Some(vec!["contract".to_owned()]),
                ..RecordFilter::default()
            }),
        }));

        pipeline.submit(Record::new().with(keys::CATEGORY, "contract"));
        pipeline.submit(Record::new().with(keys::CATEGORY, "trace"));
        pipeline.submit(Record::new()); // no category key at all
        pipeline.shutdown();

        let seen = records.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get_str(keys::CATEGORY), Some("contract"));
    }

    #[test]
    fn shutdown_drains_slow_writes() {
        struct SlowSink {
            written: Arc<Mutex<u64>>,
        }
        impl Sink for SlowSink {
            fn write(&mut self, _record: &Record) -> io::Result<()> {
                std::thread::sleep(std::time::Duration::from_micros(50));
                *self.written.lock().unwrap() += 1;
                Ok(())
            }
        }

        let written = Arc::new(Mutex::new(0));
        let mut pipeline = SinkPipeline::new();
        pipeline.install(Box::new(SlowSink {
            written: Arc::clone(&written),
        }));
        for n in 0..1_000_i64 {
            pipeline.submit(Record::new().with("n", n));
        }
        drop(pipeline);
        assert_eq!(*written.lock().unwrap(), 1_000);
    }

    #[test]
    fn filter_deserializes_from_host_config() {
        let filter: RecordFilter = serde_json::from_str(
            r#"{"categories": ["profile"], "subsystems": ["render"]}"#,
        )
        .unwrap();
        let hit = Record::new()
            .with(keys::CATEGORY, "profile")
            .with(keys::SUBSYSTEM, "render");
        let miss = Record::new().with(keys::CATEGORY, "profile");
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }
}
