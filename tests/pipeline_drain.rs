//! Pipeline shutdown must drain every outstanding write.

use scopeprof::sinks::JsonLinesSink;
use scopeprof::{Record, SinkPipeline};

#[test]
fn every_submitted_record_reaches_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.json");

    let mut pipeline = SinkPipeline::new();
    pipeline.install(Box::new(JsonLinesSink::create(&path).unwrap()));
    for n in 0..10_000_i64 {
        pipeline.submit(Record::new().with("n", n).with("payload", "x".repeat(64)));
    }
    // Dropping the pipeline joins the writer; nothing may be truncated.
    drop(pipeline);

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 10_000);
    let last: serde_json::Value = serde_json::from_str(lines.last().unwrap()).unwrap();
    assert_eq!(last["n"], serde_json::json!(9_999));
}

#[test]
fn shutdown_reports_sink_failures() {
    use std::io;

    struct FailingSink;
    impl scopeprof::Sink for FailingSink {
        fn write(&mut self, _record: &Record) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    let mut pipeline = SinkPipeline::new();
    pipeline.install(Box::new(FailingSink));
    for _ in 0..25 {
        pipeline.submit(Record::new().with("k", 1_i64));
    }
    assert_eq!(pipeline.shutdown(), 25);
}
