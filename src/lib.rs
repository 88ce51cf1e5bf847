//! In-process instrumentation for native programs.
//!
//! Annotate functions, blocks, and logical scopes; the library records
//! wall/task time and Linux hardware and software performance counters
//! per scope, aggregates `total` (inclusive) and `self` (exclusive)
//! deltas per `(caller, function)` pair, enforces design-by-contract
//! assertions, and streams structured records to pluggable sinks.
//!
//! ```no_run
//! use scopeprof::{profile_block, profile_function};
//!
//! fn transcode(frames: &[u8]) {
//!     profile_function!(subsystem = "codec", workload = frames.len() as f64);
//!     decode(frames);
//!     {
//!         profile_block!("encode");
//!         // ... the expensive part, measured separately ...
//!     }
//! }
//! # fn decode(_: &[u8]) {}
//!
//! fn main() {
//!     // The guard's drop emits the per-scope aggregates and drains the
//!     // sinks; without it nothing is written.
//!     let _instrumentation = scopeprof::install();
//!     scopeprof::add_json_sink("<temp>/transcode-profile.json").unwrap();
//!
//!     transcode(&[0; 1024]);
//! }
//! ```
//!
//! Counters are opened per thread through the Linux
//! [`perf_event_open`][man] system call, grouped so that related hardware
//! events share a scheduling quantum, and rescaled when the kernel
//! multiplexes them. On hosts without the syscall (or when the kernel
//! refuses it) every measurement degrades to zero-with-unavailable-flag
//! and the rest of the library keeps working.
//!
//! The `off` cargo feature elides the whole API: the macros expand to
//! nothing and no instrumentation code is generated. The other mode
//! features (`development`, `test`, `profile`, `qa`, `production`) select
//! which record categories are emitted and whether contract violations
//! propagate; see [`BuildMode`].
//!
//! [man]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html

#![deny(missing_docs)]

pub mod contract;
mod counters;
mod error;
mod histogram;
mod lifecycle;
mod mode;
mod output;
#[cfg(target_os = "linux")]
mod perf;
mod pipeline;
mod record;
pub mod sinks;
mod snapshot;
mod tracker;

pub use crate::counters::{
    CounterGroup, CounterKind, CounterProvider, CounterSource, CounterUnit, COUNTER_KINDS,
    GROUP_COUNT,
};
pub use crate::error::Error;
pub use crate::histogram::{Histogram, MAX_BUCKETS};
pub use crate::lifecycle::{add_json_sink, add_sink, install, message, shutdown, Lifecycle};
pub use crate::mode::BuildMode;
pub use crate::output::{resolve_sink_path, OutputTarget};
#[cfg(target_os = "linux")]
pub use crate::perf::PerfCounters;
pub use crate::pipeline::{RecordFilter, Sink, SinkPipeline};
pub use crate::record::{keys, Record, RecordValue, TIMESTAMP_FORMAT};
pub use crate::snapshot::{Available, CounterSnapshot, DerivedMetric, GroupTiming};
pub use crate::tracker::{ProfileAggregate, ProfileKey, ProfileScope, ScopeOptions};

/// Expands to the fully qualified signature of the enclosing function.
///
/// The scope macros use this to name what they measure; it is exported so
/// custom instrumentation can use the same signatures and land in the
/// same aggregates.
#[macro_export]
macro_rules! function_signature {
    () => {{
        fn marker() {}
        fn name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = name_of(marker);
        &name[..name.len() - "::marker".len()]
    }};
}

/// Profile the enclosing function until the end of the current block.
///
/// Optional arguments are forwarded to [`ScopeOptions`] builder methods:
///
/// ```no_run
/// # fn work(items: &[u32]) {
/// scopeprof::profile_function!(subsystem = "ingest", workload = items.len() as f64);
/// # }
/// ```
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! profile_function {
    ($($option:ident = $value:expr),* $(,)?) => {
        let _profile_scope = $crate::ProfileScope::enter(
            $crate::function_signature!(),
            $crate::ScopeOptions::new()$(.$option($value))*,
        );
    };
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! profile_function {
    ($($option:ident = $value:expr),* $(,)?) => {};
}

/// Profile a named block until the end of the current block.
///
/// The block's signature is the enclosing function's signature with
/// `name` appended, so equally named blocks in different functions stay
/// distinct.
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! profile_block {
    ($name:expr $(, $option:ident = $value:expr)* $(,)?) => {
        let _profile_scope = $crate::ProfileScope::enter(
            format!("{}::{}", $crate::function_signature!(), $name),
            $crate::ScopeOptions::new()$(.$option($value))*,
        );
    };
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! profile_block {
    ($name:expr $(, $option:ident = $value:expr)* $(,)?) => {};
}

/// Emit an ad-hoc record under the given category, with `format!`-style
/// message arguments:
///
/// ```no_run
/// # let batch = 7;
/// scopeprof::message!("trace", "batch {batch} drained");
/// ```
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! message {
    ($category:expr, $($arg:tt)+) => {
        $crate::message($category, &format!($($arg)+))
    };
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! message {
    ($($anything:tt)*) => {};
}

/// Check a precondition over this function's inputs; see
/// [`contract`](crate::contract).
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! argument {
    ($condition:expr) => {
        $crate::contract::argument($condition, stringify!($condition))
    };
    ($condition:expr, $($message:tt)+) => {
        $crate::contract::argument($condition, &format!($($message)+))
    };
}

/// Check a precondition over collaborator state; see
/// [`contract`](crate::contract).
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! expect {
    ($condition:expr) => {
        $crate::contract::expect($condition, stringify!($condition))
    };
    ($condition:expr, $($message:tt)+) => {
        $crate::contract::expect($condition, &format!($($message)+))
    };
}

/// Check an assertion mid-body; see [`contract`](crate::contract).
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! confirm {
    ($condition:expr) => {
        $crate::contract::confirm($condition, stringify!($condition))
    };
    ($condition:expr, $($message:tt)+) => {
        $crate::contract::confirm($condition, &format!($($message)+))
    };
}

/// Guard a predicate that must hold here and again at scope exit. Bind
/// the result: `let _inv = scopeprof::invariant!(...)`.
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! invariant {
    ($predicate:expr) => {
        $crate::contract::Invariant::new(|| $predicate, stringify!($predicate))
    };
}

/// Guard a predicate that must hold at scope exit. Bind the result:
/// `let _post = scopeprof::ensure!(...)`.
#[cfg(not(feature = "off"))]
#[macro_export]
macro_rules! ensure {
    ($predicate:expr) => {
        $crate::contract::Ensure::new(|| $predicate, stringify!($predicate))
    };
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! argument {
    ($($anything:tt)*) => {};
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! expect {
    ($($anything:tt)*) => {};
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! confirm {
    ($($anything:tt)*) => {};
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! invariant {
    ($($anything:tt)*) => {
        ()
    };
}

/// Elided: the `off` build mode generates no instrumentation.
#[cfg(feature = "off")]
#[macro_export]
macro_rules! ensure {
    ($($anything:tt)*) => {
        ()
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn function_signature_names_the_function() {
        let signature: &str = crate::function_signature!();
        assert!(
            signature.ends_with("function_signature_names_the_function"),
            "unexpected signature: {signature}"
        );
    }

    #[test]
    fn scope_macros_compile_with_options() {
        crate::profile_function!(subsystem = "tests", workload = 2.0);
        {
            crate::profile_block!("inner", session = "s-1");
        }
    }
}
