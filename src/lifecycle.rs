//! Process and thread lifecycles.
//!
//! The process side is an explicit [`install`]/[`shutdown`] pair: install
//! once near the top of `main`, and the returned guard (or an explicit
//! `shutdown` call) emits the final aggregates and drains the sink
//! pipeline on the way out. Nothing relies on global destructor order;
//! if the host never shuts down, buffered records are lost, so hold the
//! guard for the life of the process.
//!
//! The thread side is lazy: the first instrumentation call on a thread
//! opens that thread's counters, assigns it a 1-based ordinal, and bumps
//! the active-thread count. The thread-local destructor closes the
//! counters and drops the count again.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Local;

use crate::counters::{CounterKind, CounterProvider};
use crate::mode::BuildMode;
use crate::output;
use crate::pipeline::{Sink, SinkPipeline};
use crate::record::{keys, Record};
use crate::snapshot::{CounterSnapshot, DerivedMetric};
use crate::tracker::{self, Frame, ProfileAggregate, ProfileKey};

/// Ignore mutex poisoning: the protected state stays coherent because
/// every update is a plain field write or map insert.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ProcessState {
    aggregates: Mutex<HashMap<ProfileKey, ProfileAggregate>>,
    pipeline: Mutex<SinkPipeline>,
    thread_seq: AtomicU32,
    active_threads: AtomicU32,
    finished: AtomicBool,
}

static PROCESS: OnceLock<ProcessState> = OnceLock::new();

fn process() -> &'static ProcessState {
    PROCESS.get_or_init(|| ProcessState {
        aggregates: Mutex::new(HashMap::new()),
        pipeline: Mutex::new(SinkPipeline::new()),
        thread_seq: AtomicU32::new(0),
        active_threads: AtomicU32::new(0),
        finished: AtomicBool::new(false),
    })
}

/// Per-thread instrumentation state, created lazily on the first
/// instrumentation call and torn down by the thread-local destructor.
pub(crate) struct ThreadState {
    pub ordinal: u32,
    pub provider: CounterProvider,
    pub frames: Vec<Frame>,
    pub subsystems: Vec<String>,
    pub sessions: Vec<String>,
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.provider.close();
        if let Some(state) = PROCESS.get() {
            state.active_threads.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

thread_local! {
    static THREAD: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

fn acquire_thread() -> ThreadState {
    let state = process();
    let ordinal = state.thread_seq.fetch_add(1, Ordering::Relaxed) + 1;
    state.active_threads.fetch_add(1, Ordering::Relaxed);

    let mut provider = CounterProvider::open();
    provider.reset();
    provider.enable();
    if provider.is_noop() {
        let mut record = standard_record("instrument", "counter_unavailable");
        record.set(keys::THREAD_ID, ordinal);
        record.set(
            keys::MESSAGE,
            "kernel performance counters could not be opened; measuring zeros",
        );
        submit(record);
    }

    ThreadState {
        ordinal,
        provider,
        frames: Vec::new(),
        subsystems: Vec::new(),
        sessions: Vec::new(),
    }
}

/// Run `f` over this thread's instrumentation state, creating the state
/// on first use. Returns `None` when the thread-local is gone (during
/// thread teardown) or already borrowed.
///
/// Any counter read or ioctl failure the provider picked up is reported
/// here, after the state borrow is released, so the record can be built
/// and submitted without re-entering the thread-local.
pub(crate) fn with_thread<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    let (result, ordinal, fault) = THREAD
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let state = slot.get_or_insert_with(acquire_thread);
            let result = f(state);
            Some((result, state.ordinal, state.provider.take_fault()))
        })
        .ok()
        .flatten()?;
    if let Some(err) = fault {
        report_counter_fault(ordinal, err);
    }
    Some(result)
}

/// A counter read or ioctl failed on this thread: logged via the record
/// pipeline, once per thread. The failing field is already flagged
/// unavailable on the snapshot.
fn report_counter_fault(ordinal: u32, err: std::io::Error) {
    let mut record = standard_record("instrument", "counter_unavailable");
    record.set(keys::THREAD_ID, ordinal);
    record.set(
        keys::MESSAGE,
        format!("counter read failed, field marked unavailable: {err}"),
    );
    submit(record);
}

/// Run `f` over this thread's state if it already exists, without
/// creating it.
pub(crate) fn peek_thread<R>(f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    THREAD
        .try_with(|cell| {
            let slot = cell.try_borrow().ok()?;
            slot.as_ref().map(f)
        })
        .ok()
        .flatten()
}

/// Guard for the process-wide instrumentation lifecycle.
///
/// Dropping it calls [`shutdown`]; keep it alive until the host's worker
/// threads have been joined, so the final aggregates cover everything.
#[must_use = "dropping the guard shuts instrumentation down immediately"]
pub struct Lifecycle {
    _private: (),
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        shutdown();
    }
}

/// Initialize the process-wide state and return the guard whose drop
/// emits final aggregates and drains the sinks.
///
/// Calling instrumentation without `install` works, since state comes up
/// lazily, but then nothing triggers the final emission and the host
/// must call [`shutdown`] itself before exiting.
pub fn install() -> Lifecycle {
    process();
    Lifecycle { _private: () }
}

/// Register a sink with the process pipeline.
pub fn add_sink(sink: Box<dyn Sink>) {
    lock(&process().pipeline).install(sink);
}

/// Resolve `path_spec` (which may start with `<temp>`, `<home>`,
/// `<current>`, `<cout>`, `<clog>`, or `<cerr>`) and register a JSON-lines
/// sink writing there.
pub fn add_json_sink(path_spec: &str) -> Result<(), crate::Error> {
    let target = output::resolve_sink_path(path_spec);
    lock(&process().pipeline)
        .install_json_target(&target)
        .map_err(crate::Error::SinkWrite)
}

/// Emit an ad-hoc record carrying `text` under the caller-supplied
/// `category`, plus the caller's source location and the standard
/// identity keys. Subject to the build mode's category policy.
#[track_caller]
pub fn message(category: &str, text: &str) {
    if !BuildMode::ACTIVE.emits(category) {
        return;
    }
    let location = Location::caller();
    let mut record = standard_record(category, "message");
    record.set(keys::MESSAGE, text);
    record.set(keys::FILE, location.file());
    record.set(keys::LINE, location.line());
    record.set(keys::COLUMN, location.column());
    if let Some(function) = tracker::current_function() {
        record.set(keys::FUNCTION, function);
    }
    submit(record);
}

/// Build a record carrying the standard identity keys.
pub(crate) fn standard_record(category: &str, event: &str) -> Record {
    let mut record = Record::new()
        .with(keys::TIMESTAMP, Local::now())
        .with(keys::PROCESS_NAME, output::process_name())
        .with(keys::PROCESS_ID, std::process::id())
        .with(keys::BUILD_MODE, BuildMode::ACTIVE.name())
        .with(keys::CATEGORY, category)
        .with(keys::EVENT, event.to_owned());
    if let Some(ordinal) = peek_thread(|thread| thread.ordinal) {
        record.set(keys::THREAD_ID, ordinal);
    }
    if let Some(subsystem) = tracker::current_subsystem() {
        record.set(keys::SUBSYSTEM, subsystem);
    }
    if let Some(session) = tracker::current_session() {
        record.set(keys::REQUEST, session);
    }
    record
}

/// Submit a record to the pipeline, subject to the build mode's category
/// policy. Records arriving after shutdown are dropped.
pub(crate) fn submit(record: Record) {
    let category = record.get_str(keys::CATEGORY).unwrap_or("");
    if !BuildMode::ACTIVE.emits(category) {
        return;
    }
    let state = process();
    if state.finished.load(Ordering::Relaxed) {
        log::debug!("record submitted after shutdown, dropping");
        return;
    }
    lock(&state.pipeline).submit(record);
}

/// Record a lifecycle misuse: emitted best-effort, execution continues.
pub(crate) fn report_misuse(message: &'static str) {
    log::warn!("{}", crate::Error::LifecycleMisuse(message));
    let mut record = standard_record("instrument", "lifecycle_misuse");
    record.set(keys::MESSAGE, message);
    submit(record);
}

/// Fold one completed scope observation into the aggregation map.
pub(crate) fn record_observation(
    key: ProfileKey,
    workload: f64,
    location: (&'static str, u32),
    inclusive: CounterSnapshot,
    exclusive: CounterSnapshot,
) {
    let state = process();
    if state.finished.load(Ordering::Relaxed) {
        log::debug!("scope exited after shutdown, dropping observation");
        return;
    }
    lock(&state.aggregates)
        .entry(key)
        .or_default()
        .observe(workload, location, &inclusive, &exclusive);
}

/// Emit the final aggregates and drain every sink.
///
/// Idempotent; runs at most once per process. Must happen before the
/// process image is torn down: this is the only mechanism that flushes
/// the aggregation map and closes sink files.
pub fn shutdown() {
    let Some(state) = PROCESS.get() else {
        return;
    };
    if state.finished.swap(true, Ordering::SeqCst) {
        return;
    }

    // The calling thread legitimately still holds its own state; anything
    // beyond that means the host forgot to join its workers.
    let still_registered = u32::from(peek_thread(|_| ()).is_some());
    let active = state.active_threads.load(Ordering::Relaxed);
    let open_frames = peek_thread(|thread| thread.frames.len()).unwrap_or(0);

    let mut pipeline = lock(&state.pipeline);
    if active > still_registered {
        log::warn!("shutting down with {active} instrumented threads still active");
        if BuildMode::ACTIVE.emits("instrument") {
            let mut record = standard_record("instrument", "lifecycle_misuse");
            record.set(keys::MESSAGE, "shutdown before all instrumented threads exited");
            pipeline.submit(record);
        }
    }
    if open_frames > 0 {
        log::warn!("shutting down with {open_frames} profiled scopes still open");
        if BuildMode::ACTIVE.emits("instrument") {
            let mut record = standard_record("instrument", "lifecycle_misuse");
            record.set(keys::MESSAGE, "shutdown inside an open profiled scope");
            pipeline.submit(record);
        }
    }

    let mut entries: Vec<(ProfileKey, ProfileAggregate)> =
        lock(&state.aggregates).drain().collect();
    entries.sort_by(|a, b| {
        b.1.inclusive_total
            .wall_ns()
            .cmp(&a.1.inclusive_total.wall_ns())
    });

    if BuildMode::ACTIVE.emits("profile") {
        for (key, mut aggregate) in entries {
            pipeline.submit(aggregate_record(&key, &mut aggregate));
        }
    }

    pipeline.shutdown();
}

fn aggregate_record(key: &ProfileKey, aggregate: &mut ProfileAggregate) -> Record {
    let mut record = Record::new()
        .with(keys::TIMESTAMP, Local::now())
        .with(keys::PROCESS_NAME, output::process_name())
        .with(keys::PROCESS_ID, std::process::id())
        .with(keys::BUILD_MODE, BuildMode::ACTIVE.name())
        .with(keys::CATEGORY, "profile")
        .with(keys::EVENT, "scope_totals")
        .with(keys::FUNCTION, key.function.clone())
        .with(keys::PARENT_FUNCTION, key.parent.clone());
    if let Some((file, line)) = aggregate.location {
        record.set(keys::FILE, file);
        record.set(keys::LINE, line);
    }
    record.set("prof.calls", aggregate.call_count);
    record.set("prof.workload", aggregate.workload_sum);

    for kind in CounterKind::ALL {
        record.set(
            format!("prof.{}.total", kind.name()),
            aggregate.inclusive_total.value(kind),
        );
        record.set(
            format!("prof.{}.self", kind.name()),
            aggregate.exclusive_self.value(kind),
        );
    }
    for metric in DerivedMetric::ALL {
        record.set(
            format!("prof.{}.total", metric.name()),
            metric.evaluate(&aggregate.inclusive_total),
        );
        record.set(
            format!("prof.{}.self", metric.name()),
            metric.evaluate(&aggregate.exclusive_self),
        );
    }

    record.set("prof.wall_clock.trimean", aggregate.wall_durations.trimean());
    record.set("prof.wall_clock.iqr", aggregate.wall_durations.iqr());
    record.set(
        "prof.wall_clock.std_dev",
        aggregate.wall_durations.std_dev_estimate(),
    );
    record.set("prof.wall_clock.snr_db", aggregate.wall_durations.snr_db());

    let unavailable: Vec<&str> = aggregate
        .inclusive_total
        .unavailable_kinds()
        .map(CounterKind::name)
        .collect();
    if !unavailable.is_empty() {
        record.set("prof.unavailable", unavailable.join(","));
    }
    record
}
