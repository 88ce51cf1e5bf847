//! The counter vocabulary and the per-thread counter provider.
//!
//! [`CounterKind`] is the closed set of quantities the library measures.
//! [`CounterProvider`] is the per-thread object that owns the kernel event
//! handles; on Linux it wraps the `perf_event_open` plumbing in
//! [`crate::perf`], everywhere else (and whenever the kernel refuses any
//! open) it degrades to a no-op variant whose snapshots carry zeros with
//! every field flagged unavailable. Downstream code treats that as a fully
//! supported configuration.

use crate::snapshot::CounterSnapshot;

/// Number of [`CounterKind`] variants.
pub const COUNTER_KINDS: usize = 17;

/// Number of [`CounterGroup`] variants.
pub const GROUP_COUNT: usize = 4;

/// One kind of measurable quantity.
///
/// Each variant corresponds to a kernel software or hardware performance
/// event; the discriminant doubles as the index into a
/// [`CounterSnapshot`]'s value array.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum CounterKind {
    /// High-resolution per-CPU timer, used as the wall clock.
    WallClock,
    /// Per-task clock: nanoseconds this task actually ran.
    TaskClock,
    /// All page faults.
    PageFaults,
    /// Context switches.
    ContextSwitches,
    /// Migrations of the task to another CPU.
    CpuMigrations,
    /// Minor page faults, resolved without I/O.
    MinorFaults,
    /// Major page faults, requiring I/O.
    MajorFaults,
    /// Alignment faults that needed kernel intervention.
    AlignmentFaults,
    /// Instruction emulation faults.
    EmulationFaults,
    /// Processor clock cycles.
    CpuCycles,
    /// Instructions retired.
    Instructions,
    /// Cycles stalled waiting for instruction fetch or decode.
    StallFrontend,
    /// Cycles stalled waiting for execution resources.
    StallBackend,
    /// Cache references.
    CacheReferences,
    /// Cache misses.
    CacheMisses,
    /// Branch instructions retired.
    BranchInstructions,
    /// Mispredicted branches.
    BranchMisses,
}

/// Where a measured or derived quantity comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CounterSource {
    /// Wall-clock time.
    Wall,
    /// Task-scheduling activity on the CPU.
    TaskCpu,
    /// Memory-management and emulation faults.
    Faults,
    /// Processor hardware counters.
    Hardware,
    /// Computed from other counters, not read from the kernel.
    Derived,
}

/// The unit a counter or derived metric is expressed in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CounterUnit {
    /// Nanoseconds.
    Nanoseconds,
    /// A plain event count.
    Count,
    /// A dimensionless ratio.
    Ratio,
}

/// The kernel scheduling group a counter belongs to.
///
/// Hardware events that feed a common derived metric are opened as one
/// kernel group so they share `time_enabled`/`time_running` and are
/// scheduled together; software events are independent singletons.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum CounterGroup {
    /// The nine software singletons.
    Software,
    /// cpu_cycles, instructions, stall_frontend, stall_backend.
    Cycles,
    /// cache_references, cache_misses.
    Cache,
    /// branch_instructions, branch_misses.
    Branch,
}

impl CounterKind {
    /// Every kind, in snapshot index order.
    pub const ALL: [CounterKind; COUNTER_KINDS] = [
        CounterKind::WallClock,
        CounterKind::TaskClock,
        CounterKind::PageFaults,
        CounterKind::ContextSwitches,
        CounterKind::CpuMigrations,
        CounterKind::MinorFaults,
        CounterKind::MajorFaults,
        CounterKind::AlignmentFaults,
        CounterKind::EmulationFaults,
        CounterKind::CpuCycles,
        CounterKind::Instructions,
        CounterKind::StallFrontend,
        CounterKind::StallBackend,
        CounterKind::CacheReferences,
        CounterKind::CacheMisses,
        CounterKind::BranchInstructions,
        CounterKind::BranchMisses,
    ];

    /// Canonical name, used to build record keys such as
    /// `prof.cpu_cycles.total`.
    pub const fn name(self) -> &'static str {
        match self {
            CounterKind::WallClock => "wall_clock",
            CounterKind::TaskClock => "task_clock",
            CounterKind::PageFaults => "page_faults",
            CounterKind::ContextSwitches => "context_switches",
            CounterKind::CpuMigrations => "cpu_migrations",
            CounterKind::MinorFaults => "minor_faults",
            CounterKind::MajorFaults => "major_faults",
            CounterKind::AlignmentFaults => "alignment_faults",
            CounterKind::EmulationFaults => "emulation_faults",
            CounterKind::CpuCycles => "cpu_cycles",
            CounterKind::Instructions => "instructions",
            CounterKind::StallFrontend => "stall_frontend",
            CounterKind::StallBackend => "stall_backend",
            CounterKind::CacheReferences => "cache_references",
            CounterKind::CacheMisses => "cache_misses",
            CounterKind::BranchInstructions => "branch_instructions",
            CounterKind::BranchMisses => "branch_misses",
        }
    }

    /// The source category of this quantity.
    pub const fn source(self) -> CounterSource {
        match self {
            CounterKind::WallClock => CounterSource::Wall,
            CounterKind::TaskClock
            | CounterKind::ContextSwitches
            | CounterKind::CpuMigrations => CounterSource::TaskCpu,
            CounterKind::PageFaults
            | CounterKind::MinorFaults
            | CounterKind::MajorFaults
            | CounterKind::AlignmentFaults
            | CounterKind::EmulationFaults => CounterSource::Faults,
            _ => CounterSource::Hardware,
        }
    }

    /// The unit this counter is expressed in.
    pub const fn unit(self) -> CounterUnit {
        match self {
            CounterKind::WallClock | CounterKind::TaskClock => CounterUnit::Nanoseconds,
            _ => CounterUnit::Count,
        }
    }

    /// Whether kernel multiplexing can leave this counter covering only a
    /// fraction of wall time, making its raw sample worth rescaling.
    /// Software events are always schedulable, so only hardware counters
    /// qualify.
    pub const fn is_scalable(self) -> bool {
        matches!(self.source(), CounterSource::Hardware)
    }

    /// The scheduling group this counter is opened under.
    pub const fn group(self) -> CounterGroup {
        match self {
            CounterKind::CpuCycles
            | CounterKind::Instructions
            | CounterKind::StallFrontend
            | CounterKind::StallBackend => CounterGroup::Cycles,
            CounterKind::CacheReferences | CounterKind::CacheMisses => CounterGroup::Cache,
            CounterKind::BranchInstructions | CounterKind::BranchMisses => {
                CounterGroup::Branch
            }
            _ => CounterGroup::Software,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl CounterGroup {
    /// Every group, in snapshot index order.
    pub const ALL: [CounterGroup; GROUP_COUNT] = [
        CounterGroup::Software,
        CounterGroup::Cycles,
        CounterGroup::Cache,
        CounterGroup::Branch,
    ];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// The per-thread counter capability: open, reset, enable, snapshot,
/// close.
///
/// The set of providers is closed, so this is a tagged variant rather
/// than a trait object: the Linux `perf_event_open` provider, and a no-op
/// provider used on other platforms and after a fatal open error.
#[derive(Debug)]
pub enum CounterProvider {
    /// Live kernel counters for the calling thread.
    #[cfg(target_os = "linux")]
    Perf(crate::perf::PerfCounters),
    /// Snapshots are all-zero with every field unavailable.
    Noop,
}

impl CounterProvider {
    /// Open counters for the calling thread.
    ///
    /// Kernel errors are not surfaced: any failure to open degrades to the
    /// no-op provider, and the caller is told via [`is_noop`] so it can
    /// report the condition once.
    ///
    /// [`is_noop`]: CounterProvider::is_noop
    pub fn open() -> CounterProvider {
        #[cfg(target_os = "linux")]
        match crate::perf::PerfCounters::open() {
            Ok(counters) => return CounterProvider::Perf(counters),
            Err(err) => {
                let err = crate::Error::CounterUnavailable(err);
                log::warn!("{err}, measuring nothing");
            }
        }
        CounterProvider::Noop
    }

    /// Zero all counters. Group members reset atomically through their
    /// leader.
    pub fn reset(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            CounterProvider::Perf(counters) => counters.reset(),
            CounterProvider::Noop => {}
        }
    }

    /// Start counting. Group members enable atomically through their
    /// leader.
    pub fn enable(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            CounterProvider::Perf(counters) => counters.enable(),
            CounterProvider::Noop => {}
        }
    }

    /// Read every counter into a [`CounterSnapshot`], rescaling multiplexed
    /// values. Fields whose reads fail come back flagged unavailable.
    pub fn snapshot(&mut self) -> CounterSnapshot {
        match self {
            #[cfg(target_os = "linux")]
            CounterProvider::Perf(counters) => counters.snapshot(),
            CounterProvider::Noop => CounterSnapshot::unavailable(),
        }
    }

    /// The first unreported read or ioctl failure, if any.
    ///
    /// The caller emits it as a `counter_unavailable` record; this hands
    /// each failure out at most once so the thread is reported exactly
    /// once.
    pub fn take_fault(&mut self) -> Option<std::io::Error> {
        match self {
            #[cfg(target_os = "linux")]
            CounterProvider::Perf(counters) => counters.take_fault(),
            CounterProvider::Noop => None,
        }
    }

    /// Release the kernel handles, in the reverse of open order. The
    /// provider becomes the no-op variant.
    pub fn close(&mut self) {
        *self = CounterProvider::Noop;
    }

    /// True when this provider measures nothing.
    pub fn is_noop(&self) -> bool {
        matches!(self, CounterProvider::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_are_dense() {
        for (position, kind) in CounterKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), position);
        }
        for (position, group) in CounterGroup::ALL.iter().enumerate() {
            assert_eq!(group.index(), position);
        }
    }

    #[test]
    fn group_membership() {
        let cycles: Vec<CounterKind> = CounterKind::ALL
            .iter()
            .copied()
            .filter(|k| k.group() == CounterGroup::Cycles)
            .collect();
        assert_eq!(cycles.len(), 4);
        let software: Vec<CounterKind> = CounterKind::ALL
            .iter()
            .copied()
            .filter(|k| k.group() == CounterGroup::Software)
            .collect();
        assert_eq!(software.len(), 9);
        assert!(software.iter().all(|k| !k.is_scalable()));
    }

    #[test]
    fn noop_provider_measures_nothing() {
        let mut provider = CounterProvider::Noop;
        provider.reset();
        provider.enable();
        let snapshot = provider.snapshot();
        for kind in CounterKind::ALL {
            assert_eq!(snapshot.get(kind), None);
            assert_eq!(snapshot.value(kind), 0);
        }
    }
}
