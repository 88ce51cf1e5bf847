//! Contract violations emit a record before they propagate.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use scopeprof::contract::{ContractKind, ContractViolation};
use scopeprof::{keys, Record, Sink};

struct CaptureSink(Arc<Mutex<Vec<Record>>>);

impl Sink for CaptureSink {
    fn write(&mut self, record: &Record) -> io::Result<()> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[test]
fn violation_is_recorded_then_propagates() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    scopeprof::add_sink(Box::new(CaptureSink(Arc::clone(&captured))));
    let lifecycle = scopeprof::install();

    let result = catch_unwind(|| scopeprof::expect!(1 + 1 == 3));
    let payload = result.expect_err("the violation should propagate");
    let violation = payload
        .downcast_ref::<ContractViolation>()
        .expect("payload should be a ContractViolation");
    assert_eq!(violation.kind, ContractKind::Expect);
    assert_eq!(violation.message, "1 + 1 == 3");

    // A release-time check failing during an unwind is recorded but must
    // not replace the primary panic.
    let result = catch_unwind(AssertUnwindSafe(|| {
        let _post = scopeprof::ensure!(false);
        panic!("primary failure");
    }));
    assert_eq!(
        result.unwrap_err().downcast_ref::<&str>(),
        Some(&"primary failure")
    );

    drop(lifecycle); // drains the capture sink
    let records = captured.lock().unwrap();

    let expect_record = records
        .iter()
        .find(|r| {
            r.get_str(keys::CATEGORY) == Some("contract")
                && r.get_str(keys::SUBCATEGORY) == Some("expect")
        })
        .expect("no contract record for the expect violation");
    assert_eq!(expect_record.get_str(keys::MESSAGE), Some("1 + 1 == 3"));
    let file = expect_record.get_str(keys::FILE).unwrap();
    assert!(file.ends_with("contract_records.rs"), "wrong file: {file}");
    assert!(matches!(
        expect_record.get(keys::LINE),
        Some(scopeprof::RecordValue::Integer(line)) if *line > 0
    ));

    let ensure_record = records
        .iter()
        .find(|r| r.get_str(keys::SUBCATEGORY) == Some("ensure"))
        .expect("no contract record for the swallowed ensure violation");
    assert_eq!(ensure_record.get_str(keys::CATEGORY), Some("contract"));
}
