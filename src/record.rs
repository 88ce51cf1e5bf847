//! Structured event records.
//!
//! A [`Record`] is an insertion-order-preserving map from string keys to
//! tagged [`RecordValue`]s. Every instrumentation point (aggregate
//! emission, contract violations, ad-hoc messages) builds a `Record` and
//! hands it to the sink pipeline, which shares it immutably across sink
//! tasks. Key order is preserved all the way to the wire so that table
//! sinks render columns the way the author wrote them.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Local};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Wire format for [`RecordValue::Timestamp`]: ISO-8601 with nine-digit
/// fractional seconds and a numeric timezone offset.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f%z";

/// Well-known record keys.
///
/// Instrumentation points use these constants when the corresponding
/// concept applies, so that sinks and downstream tooling can rely on one
/// vocabulary. Counter and derived-metric keys are emitted under a `prof.`
/// prefix with `.total`/`.self` suffixes for scope-scoped values.
pub mod keys {
    #![allow(missing_docs)]

    pub const PROCESS_NAME: &str = "process.name";
    pub const PROCESS_ID: &str = "process.id";
    pub const THREAD_ID: &str = "thread.id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const BUILD_MODE: &str = "build_mode";
    pub const EVENT: &str = "event";
    pub const CATEGORY: &str = "category";
    pub const SUBCATEGORY: &str = "subcategory";
    pub const SUBSYSTEM: &str = "subsystem";
    pub const CLIENT: &str = "client";
    pub const REQUEST: &str = "request";
    pub const FILE: &str = "file";
    pub const LINE: &str = "line";
    pub const COLUMN: &str = "column";
    pub const FUNCTION: &str = "function";
    pub const PARENT_FUNCTION: &str = "parent_function";
    pub const MESSAGE: &str = "message";
}

/// A single record field: a tagged union over the five value shapes a
/// record can carry.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordValue {
    /// A boolean flag.
    Bool(bool),
    /// A signed 64-bit integer. Counter values are stored here.
    Integer(i64),
    /// A double-precision real.
    Real(f64),
    /// An owned string.
    Text(String),
    /// A local wall-clock timestamp, serialized per [`TIMESTAMP_FORMAT`].
    Timestamp(DateTime<Local>),
}

impl RecordValue {
    /// Render the value the way the delimited-text sink writes it, without
    /// quoting.
    pub fn to_plain_string(&self) -> String {
        match self {
            RecordValue::Bool(v) => v.to_string(),
            RecordValue::Integer(v) => v.to_string(),
            RecordValue::Real(v) => v.to_string(),
            RecordValue::Text(v) => v.clone(),
            RecordValue::Timestamp(v) => v.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    /// True for the [`RecordValue::Text`] and [`RecordValue::Timestamp`]
    /// cases, which table sinks surround with their quote character.
    pub fn is_textual(&self) -> bool {
        matches!(self, RecordValue::Text(_) | RecordValue::Timestamp(_))
    }
}

impl From<bool> for RecordValue {
    fn from(v: bool) -> RecordValue {
        RecordValue::Bool(v)
    }
}

impl From<i64> for RecordValue {
    fn from(v: i64) -> RecordValue {
        RecordValue::Integer(v)
    }
}

impl From<u64> for RecordValue {
    fn from(v: u64) -> RecordValue {
        RecordValue::Integer(v as i64)
    }
}

impl From<u32> for RecordValue {
    fn from(v: u32) -> RecordValue {
        RecordValue::Integer(i64::from(v))
    }
}

impl From<f64> for RecordValue {
    fn from(v: f64) -> RecordValue {
        RecordValue::Real(v)
    }
}

impl From<&str> for RecordValue {
    fn from(v: &str) -> RecordValue {
        RecordValue::Text(v.to_owned())
    }
}

impl From<String> for RecordValue {
    fn from(v: String) -> RecordValue {
        RecordValue::Text(v)
    }
}

impl From<DateTime<Local>> for RecordValue {
    fn from(v: DateTime<Local>) -> RecordValue {
        RecordValue::Timestamp(v)
    }
}

impl Serialize for RecordValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RecordValue::Bool(v) => serializer.serialize_bool(*v),
            // JSON has no representation for non-finite numbers; they
            // become null rather than failing the whole record.
            RecordValue::Real(v) if !v.is_finite() => serializer.serialize_none(),
            RecordValue::Real(v) => serializer.serialize_f64(*v),
            RecordValue::Integer(v) => serializer.serialize_i64(*v),
            RecordValue::Text(v) => serializer.serialize_str(v),
            RecordValue::Timestamp(v) => {
                serializer.collect_str(&v.format(TIMESTAMP_FORMAT))
            }
        }
    }
}

/// An insertion-order-preserving map from string keys to [`RecordValue`]s.
///
/// Records are small (a few dozen keys), so the map is a flat vector with
/// linear lookup; iteration and serialization walk it in insertion order.
/// Once a record has been submitted to the pipeline it is shared read-only
/// between sink tasks and never mutated again.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    entries: Vec<(Cow<'static, str>, RecordValue)>,
}

impl Record {
    /// Construct an empty record.
    pub fn new() -> Record {
        Record::default()
    }

    /// Insert `value` under `key`. If the key is already present its value
    /// is replaced in place, keeping the key's original position.
    pub fn set(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<RecordValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`set`](Record::set).
    pub fn with(
        mut self,
        key: impl Into<Cow<'static, str>>,
        value: impl Into<RecordValue>,
    ) -> Record {
        self.set(key, value);
        self
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// The value of a key as a string slice, if it is textual.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(RecordValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the record holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v))
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key.as_ref(), value)?;
        }
        map.end()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{}={}", key, value.to_plain_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn set_replaces_in_place() {
        let mut record = Record::new();
        record.set("a", 1_i64);
        record.set("b", 2_i64);
        record.set("a", 3_i64);
        let keys: Vec<&str> = record.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(record.get("a"), Some(&RecordValue::Integer(3)));
    }

    #[test]
    fn serializes_in_insertion_order() {
        let record = Record::new()
            .with("zeta", "z")
            .with("alpha", true)
            .with("mid", 1.5_f64);
        let json = serde_json::to_string(&record).unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        let alpha = json.find("\"alpha\"").unwrap();
        let mid = json.find("\"mid\"").unwrap();
        assert!(zeta < alpha && alpha < mid, "key order lost: {json}");
    }

    #[test]
    fn round_trips_through_json() {
        let record = Record::new()
            .with("flag", true)
            .with("count", 42_i64)
            .with("ratio", 0.25_f64)
            .with("name", "widget \"a\"\n");
        let json = serde_json::to_string(&record).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["flag"], serde_json::json!(true));
        assert_eq!(parsed["count"], serde_json::json!(42));
        assert_eq!(parsed["ratio"], serde_json::json!(0.25));
        assert_eq!(parsed["name"], serde_json::json!("widget \"a\"\n"));
    }

    #[test]
    fn non_finite_reals_become_null() {
        let record = Record::new().with("cpi", f64::NAN);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, "{\"cpi\":null}");
    }

    #[test]
    fn timestamp_wire_format() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap();
        let formatted = RecordValue::Timestamp(ts).to_plain_string();
        // 2024-03-09T12:30:05.000000000±HHMM
        assert_eq!(formatted.len(), "2024-03-09T12:30:05.000000000+0000".len());
        let fractional = &formatted[20..29];
        assert!(fractional.chars().all(|c| c.is_ascii_digit()));
        assert!(formatted[29..].starts_with('+') || formatted[29..].starts_with('-'));
    }
}
