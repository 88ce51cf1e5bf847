use std::io;

use thiserror::Error;

/// Failures that can arise inside the instrumentation library.
///
/// These never propagate out of the scope entry/exit path into the host
/// application: internal failures degrade to missing-data flags on the
/// emitted records. The only condition that escapes to the host is a
/// contract violation in a non-production build mode, which travels as a
/// [`ContractViolation`] panic payload rather than through this type.
///
/// [`ContractViolation`]: crate::contract::ContractViolation
#[derive(Debug, Error)]
pub enum Error {
    /// A kernel performance event could not be opened or read.
    #[error("performance counter unavailable")]
    CounterUnavailable(#[source] io::Error),

    /// Subtracting two counter snapshots would produce a negative value,
    /// meaning the operands were taken out of order.
    #[error("counter snapshots subtracted out of order")]
    SnapshotSkew,

    /// A histogram bucket count would exceed its 24-bit field. Compaction
    /// keeps this unreachable in practice.
    #[error("histogram bucket count overflow")]
    HistogramOverflow,

    /// One of the five contract checks failed.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A sink's write returned failure. Counted per sink by the pipeline;
    /// never fails the instrumentation path.
    #[error("sink write failed")]
    SinkWrite(#[source] io::Error),

    /// A scope exit was observed without a matching entry, or the process
    /// shut down while instrumented threads were still registered.
    #[error("instrumentation lifecycle misuse: {0}")]
    LifecycleMisuse(&'static str),
}

impl From<crate::contract::ContractViolation> for Error {
    fn from(violation: crate::contract::ContractViolation) -> Error {
        Error::ContractViolation(violation.to_string())
    }
}
