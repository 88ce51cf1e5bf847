//! Built-in record sinks.
//!
//! Three writers cover the common destinations:
//!
//! -   [`JsonLinesSink`] writes one JSON object per record per line to a
//!     file, keys in insertion order.
//!
//! -   [`DelimitedTextSink`] writes a fixed projection of keys as
//!     separator-delimited rows, for spreadsheet-style consumption.
//!
//! -   [`StreamSink`] writes JSON lines to standard output or standard
//!     error, serializing concurrent writes through the stream's lock.
//!
//! Anything else implements [`Sink`](crate::Sink) directly.

mod json;
mod stream;
mod table;

pub use json::JsonLinesSink;
pub use stream::StreamSink;
pub use table::DelimitedTextSink;
