//! Nested-scope tracking and profile aggregation.
//!
//! Each thread keeps a LIFO stack of active scopes. Entering a scope
//! snapshots the thread's counters and pushes a frame; the guard's drop
//! takes a second snapshot, attributes the inclusive delta to the
//! `(parent, function)` aggregate, and feeds the delta into the parent
//! frame so the parent's eventual exclusive share comes out right. The
//! guard runs on every exit path, including unwinding, so the stack
//! discipline holds as long as the guard stays on the stack frame that
//! created it.

use std::marker::PhantomData;
use std::panic::Location;

use crate::histogram::Histogram;
use crate::lifecycle;
use crate::mode::BuildMode;
use crate::snapshot::CounterSnapshot;

/// Identifies one profiled call relationship: a function together with
/// the function it was called from.
///
/// Equality and hashing are over the string content; the outermost scope
/// of a thread has an empty parent signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    /// Signature of the enclosing profiled scope, or empty.
    pub parent: String,
    /// Signature of the profiled scope itself.
    pub function: String,
}

/// Everything aggregated for one [`ProfileKey`], process-wide.
#[derive(Clone, Debug)]
pub struct ProfileAggregate {
    /// Number of completed scope executions.
    pub call_count: u64,
    /// Sum of the caller-supplied workload weights.
    pub workload_sum: f64,
    /// Componentwise sum of inclusive deltas.
    pub inclusive_total: CounterSnapshot,
    /// Componentwise sum of exclusive deltas. Never exceeds
    /// `inclusive_total` on any field.
    pub exclusive_self: CounterSnapshot,
    /// Distribution of per-call inclusive wall time.
    pub wall_durations: Histogram,
    /// Distribution of per-call inclusive task-clock time.
    pub cpu_durations: Histogram,
    /// Source location of the first observed entry.
    pub location: Option<(&'static str, u32)>,
}

impl Default for ProfileAggregate {
    fn default() -> ProfileAggregate {
        ProfileAggregate {
            call_count: 0,
            workload_sum: 0.0,
            inclusive_total: CounterSnapshot::zero(),
            exclusive_self: CounterSnapshot::zero(),
            wall_durations: Histogram::new(),
            cpu_durations: Histogram::new(),
            location: None,
        }
    }
}

impl ProfileAggregate {
    pub(crate) fn observe(
        &mut self,
        workload: f64,
        location: (&'static str, u32),
        inclusive: &CounterSnapshot,
        exclusive: &CounterSnapshot,
    ) {
        self.call_count += 1;
        self.workload_sum += workload;
        self.inclusive_total.accumulate(inclusive);
        self.exclusive_self.accumulate(exclusive);
        self.wall_durations.add(inclusive.wall_ns());
        self.cpu_durations.add(inclusive.cpu_ns());
        self.location.get_or_insert(location);
    }
}

/// One active scope on a thread's stack.
pub(crate) struct Frame {
    pub signature: String,
    pub parent: String,
    pub workload: f64,
    pub file: &'static str,
    pub line: u32,
    /// Counter reading taken at entry.
    pub entry: CounterSnapshot,
    /// Sum of the inclusive deltas of directly nested scopes that have
    /// already exited.
    pub children: CounterSnapshot,
}

/// Tags and weight attached to a profiled scope.
///
/// `subsystem` and `session` override the thread's current tags for the
/// duration of the scope; nested overrides restore on exit. `workload`
/// defaults to 1, so `workload_sum` counts calls unless the caller
/// weights them.
#[derive(Clone, Debug)]
pub struct ScopeOptions {
    subsystem: Option<String>,
    session: Option<String>,
    workload: f64,
}

impl Default for ScopeOptions {
    fn default() -> ScopeOptions {
        ScopeOptions {
            subsystem: None,
            session: None,
            workload: 1.0,
        }
    }
}

impl ScopeOptions {
    /// Options with no tags and a workload weight of 1.
    pub fn new() -> ScopeOptions {
        ScopeOptions::default()
    }

    /// Tag the scope (and everything nested in it) with a subsystem name.
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> ScopeOptions {
        self.subsystem = Some(subsystem.into());
        self
    }

    /// Tag the scope with a session identifier.
    pub fn session(mut self, session: impl Into<String>) -> ScopeOptions {
        self.session = Some(session.into());
        self
    }

    /// Weight this execution by `workload` instead of 1.
    pub fn workload(mut self, workload: f64) -> ScopeOptions {
        self.workload = workload;
        self
    }
}

/// RAII guard for a profiled scope.
///
/// Entering takes a counter snapshot and pushes a frame on the calling
/// thread's stack; dropping pops the frame and folds the measured deltas
/// into the process-wide aggregation map. Guards are thread-bound and
/// must be dropped in the reverse of their creation order, which holding
/// them as locals guarantees.
///
/// Usually constructed via [`profile_function!`](crate::profile_function)
/// or [`profile_block!`](crate::profile_block).
pub struct ProfileScope {
    active: bool,
    pushed_subsystem: bool,
    pushed_session: bool,
    // Frames belong to the thread that pushed them.
    _thread_bound: PhantomData<*const ()>,
}

impl ProfileScope {
    /// Enter a scope named `signature` with default options.
    #[track_caller]
    pub fn function(signature: impl Into<String>) -> ProfileScope {
        ProfileScope::enter(signature, ScopeOptions::default())
    }

    /// Enter a scope named `signature`.
    #[track_caller]
    pub fn enter(signature: impl Into<String>, options: ScopeOptions) -> ProfileScope {
        let inert = ProfileScope {
            active: false,
            pushed_subsystem: false,
            pushed_session: false,
            _thread_bound: PhantomData,
        };
        if BuildMode::ACTIVE == BuildMode::Off {
            return inert;
        }

        let location = Location::caller();
        let signature = signature.into();
        let pushed_subsystem = options.subsystem.is_some();
        let pushed_session = options.session.is_some();

        let entered = lifecycle::with_thread(|thread| {
            let entry = thread.provider.snapshot();
            let parent = thread
                .frames
                .last()
                .map(|frame| frame.signature.clone())
                .unwrap_or_default();
            thread.frames.push(Frame {
                signature,
                parent,
                workload: options.workload,
                file: location.file(),
                line: location.line(),
                entry,
                children: CounterSnapshot::zero(),
            });
            if let Some(subsystem) = options.subsystem {
                thread.subsystems.push(subsystem);
            }
            if let Some(session) = options.session {
                thread.sessions.push(session);
            }
        })
        .is_some();

        if !entered {
            return inert;
        }
        ProfileScope {
            active: true,
            pushed_subsystem,
            pushed_session,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let pushed_subsystem = self.pushed_subsystem;
        let pushed_session = self.pushed_session;

        let observation = lifecycle::with_thread(|thread| {
            let exit = thread.provider.snapshot();
            let frame = match thread.frames.pop() {
                Some(frame) => frame,
                None => {
                    // An exit with no matching entry: the guard was moved
                    // somewhere it shouldn't be. Best effort, keep going.
                    lifecycle::report_misuse("scope exit without a matching entry");
                    return None;
                }
            };
            if pushed_subsystem {
                thread.subsystems.pop();
            }
            if pushed_session {
                thread.sessions.pop();
            }

            let inclusive = exit.delta_since(&frame.entry);
            let exclusive = inclusive.exclusive_of(&frame.children);
            if let Some(parent) = thread.frames.last_mut() {
                parent.children.accumulate(&inclusive);
            }
            Some((frame, inclusive, exclusive))
        })
        .flatten();

        // The aggregation-map lock is taken outside the thread-state
        // borrow and held only for the entry update.
        if let Some((frame, inclusive, exclusive)) = observation {
            lifecycle::record_observation(
                ProfileKey {
                    parent: frame.parent,
                    function: frame.signature,
                },
                frame.workload,
                (frame.file, frame.line),
                inclusive,
                exclusive,
            );
        }
    }
}

/// Signature of the innermost profiled scope on this thread, if any.
pub(crate) fn current_function() -> Option<String> {
    lifecycle::peek_thread(|thread| {
        thread.frames.last().map(|frame| frame.signature.clone())
    })
    .flatten()
}

/// The thread's current subsystem tag, if any scope set one.
pub(crate) fn current_subsystem() -> Option<String> {
    lifecycle::peek_thread(|thread| thread.subsystems.last().cloned()).flatten()
}

/// The thread's current session tag, if any scope set one.
pub(crate) fn current_session() -> Option<String> {
    lifecycle::peek_thread(|thread| thread.sessions.last().cloned()).flatten()
}
