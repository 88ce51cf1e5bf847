//! Design-by-contract checks.
//!
//! Five check kinds cover the usual places a contract lives: [`argument`]
//! (precondition on inputs), [`expect`] (precondition on collaborator
//! state), [`confirm`] (assertion mid-body), and the scoped guards
//! [`Invariant`] (checked on scope entry and exit) and [`Ensure`]
//! (checked on exit only).
//!
//! Every violation first emits a `category:"contract"` record through the
//! sink pipeline, then propagates as a recoverable condition carrying a
//! [`ContractViolation`] payload. Two exceptions: in the production build
//! mode the violation is recorded and execution continues, and during
//! unwinding, where raising again would abort the process, the violation
//! is recorded and swallowed.
//!
//! The usual way in is through the crate-level macros, which stringify
//! the checked expression for the report:
//!
//! ```should_panic
//! fn scale(values: &mut [f64], factor: f64) {
//!     scopeprof::argument!(factor.is_finite());
//!     for v in values.iter_mut() {
//!         *v *= factor;
//!     }
//! }
//!
//! scale(&mut [1.0], f64::NAN);
//! ```

use std::fmt;
use std::panic::Location;

use crate::lifecycle;
use crate::mode::BuildMode;
use crate::record::keys;
use crate::tracker;

/// The kind of contract a violation broke.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContractKind {
    /// Precondition over a function's inputs.
    Argument,
    /// Precondition over collaborator state.
    Expect,
    /// Mid-body assertion.
    Confirm,
    /// Condition holding on scope entry and exit.
    Invariant,
    /// Condition holding on scope exit.
    Ensure,
}

impl ContractKind {
    /// Canonical lowercase name, written into the `subcategory` record
    /// key.
    pub const fn name(self) -> &'static str {
        match self {
            ContractKind::Argument => "argument",
            ContractKind::Expect => "expect",
            ContractKind::Confirm => "confirm",
            ContractKind::Invariant => "invariant",
            ContractKind::Ensure => "ensure",
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The payload a propagating contract violation carries.
///
/// In non-production build modes this travels as a panic payload, so a
/// host that wants to recover can catch the unwind and downcast to it.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind} contract violated at {file}:{line}:{column}: {message}")]
pub struct ContractViolation {
    /// Which check failed.
    pub kind: ContractKind,
    /// The failed condition, or the caller's formatted message.
    pub message: String,
    /// Source file of the check.
    pub file: &'static str,
    /// Source line of the check.
    pub line: u32,
    /// Source column of the check.
    pub column: u32,
}

/// Check a precondition over a function's inputs.
#[track_caller]
pub fn argument(condition: bool, what: &str) {
    check(ContractKind::Argument, condition, what);
}

/// Check a precondition over collaborator state.
#[track_caller]
pub fn expect(condition: bool, what: &str) {
    check(ContractKind::Expect, condition, what);
}

/// Check an assertion mid-body.
#[track_caller]
pub fn confirm(condition: bool, what: &str) {
    check(ContractKind::Confirm, condition, what);
}

#[track_caller]
fn check(kind: ContractKind, condition: bool, what: &str) {
    if condition || BuildMode::ACTIVE == BuildMode::Off {
        return;
    }
    fail(kind, what, Location::caller());
}

/// Record the violation, then raise it unless policy says otherwise.
fn fail(kind: ContractKind, what: &str, location: &Location<'static>) {
    let violation = ContractViolation {
        kind,
        message: what.to_owned(),
        file: location.file(),
        line: location.line(),
        column: location.column(),
    };

    let mut record = lifecycle::standard_record("contract", "violation");
    record.set(keys::SUBCATEGORY, kind.name());
    record.set(keys::MESSAGE, violation.message.clone());
    record.set(keys::FILE, violation.file);
    record.set(keys::LINE, violation.line);
    record.set(keys::COLUMN, violation.column);
    if let Some(function) = tracker::current_function() {
        record.set(keys::FUNCTION, function);
    }
    lifecycle::submit(record);

    if !BuildMode::ACTIVE.contracts_propagate() {
        log::error!("{violation}");
    } else if std::thread::panicking() {
        // Raising during unwind would abort; the record above is the
        // report.
        log::error!("swallowed during unwind: {violation}");
    } else {
        std::panic::panic_any(violation);
    }
}

/// A predicate that must hold on scope entry and on every scope exit.
///
/// The predicate is evaluated when the guard is constructed and again
/// when it is dropped, so it also runs on early returns and during
/// unwinding.
///
/// Usually constructed via [`invariant!`](crate::invariant).
pub struct Invariant<'a> {
    predicate: Box<dyn Fn() -> bool + 'a>,
    what: &'static str,
    location: &'static Location<'static>,
}

impl<'a> Invariant<'a> {
    /// Check `predicate` now, and again when the guard is dropped.
    #[track_caller]
    pub fn new(predicate: impl Fn() -> bool + 'a, what: &'static str) -> Invariant<'a> {
        let location = Location::caller();
        if BuildMode::ACTIVE != BuildMode::Off && !predicate() {
            fail(ContractKind::Invariant, what, location);
        }
        Invariant {
            predicate: Box::new(predicate),
            what,
            location,
        }
    }
}

impl Drop for Invariant<'_> {
    fn drop(&mut self) {
        if BuildMode::ACTIVE != BuildMode::Off && !(self.predicate)() {
            fail(ContractKind::Invariant, self.what, self.location);
        }
    }
}

/// A predicate that must hold on scope exit.
///
/// Like [`Invariant`] but without the entry-time check: a postcondition.
///
/// Usually constructed via [`ensure!`](crate::ensure).
pub struct Ensure<'a> {
    predicate: Box<dyn Fn() -> bool + 'a>,
    what: &'static str,
    location: &'static Location<'static>,
}

impl<'a> Ensure<'a> {
    /// Check `predicate` when the guard is dropped.
    #[track_caller]
    pub fn new(predicate: impl Fn() -> bool + 'a, what: &'static str) -> Ensure<'a> {
        Ensure {
            predicate: Box::new(predicate),
            what,
            location: Location::caller(),
        }
    }
}

impl Drop for Ensure<'_> {
    fn drop(&mut self) {
        if BuildMode::ACTIVE != BuildMode::Off && !(self.predicate)() {
            fail(ContractKind::Ensure, self.what, self.location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn passing_checks_are_silent() {
        argument(true, "always");
        expect(true, "always");
        confirm(true, "always");
        let _inv = Invariant::new(|| true, "always");
        let _post = Ensure::new(|| true, "always");
    }

    #[test]
    fn failing_check_carries_its_location() {
        let result = catch_unwind(|| expect(false, "collaborator ready"));
        let payload = result.unwrap_err();
        let violation = payload
            .downcast_ref::<ContractViolation>()
            .expect("payload should be a ContractViolation");
        assert_eq!(violation.kind, ContractKind::Expect);
        assert_eq!(violation.message, "collaborator ready");
        assert!(violation.file.ends_with("contract.rs"));
        assert!(violation.line > 0);
    }

    #[test]
    fn ensure_fires_only_on_exit() {
        use std::cell::Cell;

        let flag = Cell::new(true);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _post = Ensure::new(|| flag.get(), "flag stays raised");
            // Constructing the guard must not evaluate the predicate as a
            // failure; only the drop at scope exit sees the lowered flag.
            flag.set(false);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn invariant_checks_on_entry() {
        let result = catch_unwind(|| {
            let _inv = Invariant::new(|| false, "broken on entry");
        });
        assert!(result.is_err());
    }

    #[test]
    fn violation_during_unwind_is_swallowed() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _post = Ensure::new(|| false, "will fail during unwind");
            panic!("primary failure");
        }));
        // The primary panic survives; the guard's violation did not abort
        // or replace it.
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"primary failure"));
    }
}
