//! End-to-end scope aggregation, checked through emitted records.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use scopeprof::{keys, CounterKind, ProfileScope, Record, RecordValue, ScopeOptions, Sink};

struct CaptureSink(Arc<Mutex<Vec<Record>>>);

impl Sink for CaptureSink {
    fn write(&mut self, record: &Record) -> io::Result<()> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

fn profile_record<'a>(records: &'a [Record], function: &str) -> &'a Record {
    records
        .iter()
        .find(|r| {
            r.get_str(keys::CATEGORY) == Some("profile")
                && r.get_str(keys::FUNCTION) == Some(function)
        })
        .unwrap_or_else(|| panic!("no profile record for {function}"))
}

fn integer(record: &Record, key: &str) -> i64 {
    match record.get(key) {
        Some(RecordValue::Integer(v)) => *v,
        other => panic!("{key} should be an integer, got {other:?}"),
    }
}

fn real(record: &Record, key: &str) -> f64 {
    match record.get(key) {
        Some(RecordValue::Real(v)) => *v,
        other => panic!("{key} should be a real, got {other:?}"),
    }
}

fn burn_cycles(rounds: u64) -> u64 {
    let mut acc = 1_u64;
    for n in 0..rounds {
        acc = acc.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(n);
    }
    acc
}

#[test]
fn aggregates_scopes_across_threads() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    scopeprof::add_sink(Box::new(CaptureSink(Arc::clone(&captured))));
    let lifecycle = scopeprof::install();

    // A single leaf scope with an explicit subsystem and workload.
    {
        let _scope = ProfileScope::enter(
            "foo",
            ScopeOptions::new().subsystem("s").workload(2.0),
        );
        std::hint::black_box(burn_cycles(10_000));
    }

    // Parent/child attribution, with ad-hoc messages from inside the
    // scope.
    {
        let _outer = ProfileScope::function("outer");
        std::hint::black_box(burn_cycles(50_000));
        scopeprof::message("audit", "checkpoint reached");
        scopeprof::message!("audit", "run {} complete", 7);
        {
            let _inner = ProfileScope::function("inner");
            std::hint::black_box(burn_cycles(50_000));
        }
    }

    // The same scope from four threads.
    let workers: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                for _ in 0..500 {
                    let _scope = ProfileScope::function("work");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    drop(lifecycle); // emits aggregates and drains the capture sink
    let records = captured.lock().unwrap();

    let foo = profile_record(&records, "foo");
    assert_eq!(integer(foo, "prof.calls"), 1);
    assert_eq!(real(foo, "prof.workload"), 2.0);
    assert_eq!(foo.get_str(keys::PARENT_FUNCTION), Some(""));
    // A leaf scope's exclusive measurements equal its inclusive ones.
    for kind in CounterKind::ALL {
        let total = integer(foo, &format!("prof.{}.total", kind.name()));
        let own = integer(foo, &format!("prof.{}.self", kind.name()));
        assert_eq!(own, total, "leaf self != total for {}", kind.name());
    }

    let outer = profile_record(&records, "outer");
    let inner = profile_record(&records, "inner");
    assert_eq!(integer(outer, "prof.calls"), 1);
    assert_eq!(integer(inner, "prof.calls"), 1);
    assert_eq!(inner.get_str(keys::PARENT_FUNCTION), Some("outer"));
    for kind in CounterKind::ALL {
        let total_key = format!("prof.{}.total", kind.name());
        let self_key = format!("prof.{}.self", kind.name());
        // Exclusive never exceeds inclusive, anywhere.
        assert!(integer(outer, &self_key) <= integer(outer, &total_key));
        // The child is a leaf.
        assert_eq!(integer(inner, &self_key), integer(inner, &total_key));
    }
    // The child's inclusive wall time fits inside the parent's.
    assert!(integer(inner, "prof.wall_clock.total") <= integer(outer, "prof.wall_clock.total"));

    // Ad-hoc messages carry the caller-supplied category and the scope
    // they were emitted from.
    let audits: Vec<&Record> = records
        .iter()
        .filter(|r| r.get_str(keys::CATEGORY) == Some("audit"))
        .collect();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].get_str(keys::MESSAGE), Some("checkpoint reached"));
    assert_eq!(audits[1].get_str(keys::MESSAGE), Some("run 7 complete"));
    for audit in &audits {
        assert_eq!(audit.get_str(keys::EVENT), Some("message"));
        assert_eq!(audit.get_str(keys::FUNCTION), Some("outer"));
        let file = audit.get_str(keys::FILE).unwrap();
        assert!(file.ends_with("aggregation.rs"), "wrong file: {file}");
    }

    let work = profile_record(&records, "work");
    assert_eq!(integer(work, "prof.calls"), 2_000);
    assert_eq!(real(work, "prof.workload"), 2_000.0);
    assert_eq!(work.get_str(keys::PARENT_FUNCTION), Some(""));

    // Standard identity keys are stamped on every aggregate.
    for record in [foo, outer, inner, work] {
        assert!(record.get_str(keys::PROCESS_NAME).is_some());
        assert!(record.get(keys::PROCESS_ID).is_some());
        assert!(record.get(keys::TIMESTAMP).is_some());
        assert_eq!(record.get_str(keys::BUILD_MODE), Some("development"));
    }
}
