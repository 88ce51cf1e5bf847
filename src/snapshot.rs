//! Counter snapshots and the metrics derived from their deltas.

use crate::counters::{CounterGroup, CounterKind, CounterSource, CounterUnit, COUNTER_KINDS,
                      GROUP_COUNT};
use crate::error::Error;

mod flags {
    #![allow(missing_docs)]

    use bitflags::bitflags;

    bitflags! {
        /// The set of counters whose values in a snapshot are meaningful.
        ///
        /// A bit is clear when the counter could not be opened or read,
        /// when the kernel never scheduled it (`time_running == 0`), or
        /// when a subtraction went backwards for that field. Bit
        /// positions follow [`CounterKind`](crate::CounterKind) indexes.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
        pub struct Available: u32 {
            const WALL_CLOCK = 1 << 0;
            const TASK_CLOCK = 1 << 1;
            const PAGE_FAULTS = 1 << 2;
            const CONTEXT_SWITCHES = 1 << 3;
            const CPU_MIGRATIONS = 1 << 4;
            const MINOR_FAULTS = 1 << 5;
            const MAJOR_FAULTS = 1 << 6;
            const ALIGNMENT_FAULTS = 1 << 7;
            const EMULATION_FAULTS = 1 << 8;
            const CPU_CYCLES = 1 << 9;
            const INSTRUCTIONS = 1 << 10;
            const STALL_FRONTEND = 1 << 11;
            const STALL_BACKEND = 1 << 12;
            const CACHE_REFERENCES = 1 << 13;
            const CACHE_MISSES = 1 << 14;
            const BRANCH_INSTRUCTIONS = 1 << 15;
            const BRANCH_MISSES = 1 << 16;
        }
    }
}

pub use flags::Available;

impl Available {
    fn only(kind: CounterKind) -> Available {
        Available::from_bits_truncate(1 << kind.index())
    }
}

/// The `time_enabled`/`time_running` nanosecond pair the kernel reports
/// for a scheduling group, kept for multiplexing-aware subtraction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupTiming {
    /// Nanoseconds the group was enabled by the program.
    pub enabled: u64,
    /// Nanoseconds the kernel actually ran the group.
    pub running: u64,
}

/// An immutable reading of every tracked counter.
///
/// Values of scalable counters have already been rescaled by
/// `time_enabled / time_running` at read time; the per-group timing pairs
/// are retained so that subtracting two snapshots can re-derive a pair
/// that keeps downstream derived metrics meaningful.
///
/// Subtraction never wraps: a field that would go backwards is flagged
/// unavailable on the result instead.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct CounterSnapshot {
    values: [u64; COUNTER_KINDS],
    available: Available,
    timing: [GroupTiming; GROUP_COUNT],
}

impl CounterSnapshot {
    /// An all-zero snapshot with every field valid. The identity for
    /// [`accumulate`](CounterSnapshot::accumulate).
    pub fn zero() -> CounterSnapshot {
        CounterSnapshot {
            available: Available::all(),
            ..CounterSnapshot::default()
        }
    }

    /// An all-zero snapshot with every field flagged unavailable: what the
    /// no-op provider produces.
    pub fn unavailable() -> CounterSnapshot {
        CounterSnapshot::default()
    }

    /// The value for `kind`, or `None` when the field is unavailable.
    pub fn get(&self, kind: CounterKind) -> Option<u64> {
        self.is_available(kind).then(|| self.values[kind.index()])
    }

    /// The raw value for `kind`; zero when unavailable.
    pub fn value(&self, kind: CounterKind) -> u64 {
        self.values[kind.index()]
    }

    /// Whether the field for `kind` carries a meaningful value.
    pub fn is_available(&self, kind: CounterKind) -> bool {
        self.available.contains(Available::only(kind))
    }

    /// The counters currently flagged unavailable, by canonical name.
    pub fn unavailable_kinds(&self) -> impl Iterator<Item = CounterKind> + '_ {
        CounterKind::ALL
            .into_iter()
            .filter(move |kind| !self.is_available(*kind))
    }

    /// The timing pair recorded for `group`.
    pub fn timing(&self, group: CounterGroup) -> GroupTiming {
        self.timing[group.index()]
    }

    /// Wall-clock nanoseconds, zero if unavailable.
    pub fn wall_ns(&self) -> u64 {
        self.value(CounterKind::WallClock)
    }

    /// Task-clock nanoseconds, zero if unavailable.
    pub fn cpu_ns(&self) -> u64 {
        self.value(CounterKind::TaskClock)
    }

    pub(crate) fn set(&mut self, kind: CounterKind, value: u64) {
        self.values[kind.index()] = value;
        self.available |= Available::only(kind);
    }

    pub(crate) fn set_timing(&mut self, group: CounterGroup, timing: GroupTiming) {
        self.timing[group.index()] = timing;
    }

    /// Like [`delta_since`](CounterSnapshot::delta_since), but reports
    /// skew instead of flagging it: if any field that both operands carry
    /// goes backwards, the whole subtraction is refused.
    pub fn try_delta_since(&self, earlier: &CounterSnapshot) -> Result<CounterSnapshot, Error> {
        let skewed = CounterKind::ALL.into_iter().any(|kind| {
            self.is_available(kind)
                && earlier.is_available(kind)
                && self.value(kind) < earlier.value(kind)
        });
        if skewed {
            return Err(Error::SnapshotSkew);
        }
        Ok(self.delta_since(earlier))
    }

    /// `self − earlier`, componentwise.
    ///
    /// A field is available on the result only when it is available on
    /// both operands and does not go backwards; a backwards field is a
    /// skewed pair of readings and comes back unavailable rather than
    /// wrapped. The timing pair of each group is re-derived as the
    /// difference of the operands' pairs.
    pub fn delta_since(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        let mut delta = CounterSnapshot::unavailable();
        for kind in CounterKind::ALL {
            if !self.is_available(kind) || !earlier.is_available(kind) {
                continue;
            }
            match self.value(kind).checked_sub(earlier.value(kind)) {
                Some(value) => delta.set(kind, value),
                None => {} // snapshot skew: leave the field unavailable
            }
        }
        for group in CounterGroup::ALL {
            let later = self.timing(group);
            let earlier = earlier.timing(group);
            delta.set_timing(
                group,
                GroupTiming {
                    enabled: later.enabled.saturating_sub(earlier.enabled),
                    running: later.running.saturating_sub(earlier.running),
                },
            );
        }
        delta
    }

    /// `self − children`, saturating at zero: the exclusive share of an
    /// inclusive delta once nested children are taken out.
    ///
    /// Multiplexing estimates can make the accumulated child total exceed
    /// the parent's own delta by a little; saturation keeps the exclusive
    /// value well-formed. A field the children's accumulator lost marks
    /// the result unavailable too, since a partial subtraction would claim
    /// more self time than was measured.
    pub fn exclusive_of(&self, children: &CounterSnapshot) -> CounterSnapshot {
        let mut exclusive = *self;
        for kind in CounterKind::ALL {
            if !children.is_available(kind) {
                exclusive.available &= !Available::only(kind);
                exclusive.values[kind.index()] = 0;
            } else if exclusive.is_available(kind) {
                exclusive.values[kind.index()] =
                    self.value(kind).saturating_sub(children.value(kind));
            }
        }
        exclusive
    }

    /// Add `delta` into this accumulator, componentwise. A field that is
    /// unavailable on either side is unavailable on the sum.
    pub fn accumulate(&mut self, delta: &CounterSnapshot) {
        for kind in CounterKind::ALL {
            let flag = Available::only(kind);
            if self.available.contains(flag) && delta.available.contains(flag) {
                self.values[kind.index()] =
                    self.value(kind).saturating_add(delta.value(kind));
            } else {
                self.available &= !flag;
            }
        }
        for group in CounterGroup::ALL {
            let ours = self.timing(group);
            let theirs = delta.timing(group);
            self.set_timing(
                group,
                GroupTiming {
                    enabled: ours.enabled.saturating_add(theirs.enabled),
                    running: ours.running.saturating_add(theirs.running),
                },
            );
        }
    }
}

/// A metric computed from a snapshot delta, with the same name/source/unit
/// metadata the raw counters carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DerivedMetric {
    /// Wall-clock seconds.
    CpuSeconds,
    /// Fraction of wall time the task was not running.
    TaskIdleFraction,
    /// Major page faults per wall-clock second.
    MajorFaultsPerSecond,
    /// Cycles per retired instruction.
    CyclesPerInstruction,
    /// Fraction of cycles stalled in the frontend.
    FrontendStallFraction,
    /// Fraction of cycles stalled in the backend.
    BackendStallFraction,
    /// Cache misses per cache reference.
    CacheMissFraction,
    /// Branch misses per branch instruction.
    BranchMissFraction,
}

impl DerivedMetric {
    /// Every derived metric, in emission order.
    pub const ALL: [DerivedMetric; 8] = [
        DerivedMetric::CpuSeconds,
        DerivedMetric::TaskIdleFraction,
        DerivedMetric::MajorFaultsPerSecond,
        DerivedMetric::CyclesPerInstruction,
        DerivedMetric::FrontendStallFraction,
        DerivedMetric::BackendStallFraction,
        DerivedMetric::CacheMissFraction,
        DerivedMetric::BranchMissFraction,
    ];

    /// Canonical name, used to build record keys such as
    /// `prof.cycles_per_instruction.self`.
    pub const fn name(self) -> &'static str {
        match self {
            DerivedMetric::CpuSeconds => "cpu_seconds",
            DerivedMetric::TaskIdleFraction => "task_idle_fraction",
            DerivedMetric::MajorFaultsPerSecond => "major_faults_per_second",
            DerivedMetric::CyclesPerInstruction => "cycles_per_instruction",
            DerivedMetric::FrontendStallFraction => "frontend_stall_fraction",
            DerivedMetric::BackendStallFraction => "backend_stall_fraction",
            DerivedMetric::CacheMissFraction => "cache_miss_fraction",
            DerivedMetric::BranchMissFraction => "branch_miss_fraction",
        }
    }

    /// Derived metrics all share the derived source category.
    pub const fn source(self) -> CounterSource {
        CounterSource::Derived
    }

    /// The unit this metric is expressed in.
    pub const fn unit(self) -> CounterUnit {
        match self {
            DerivedMetric::CpuSeconds => CounterUnit::Nanoseconds,
            DerivedMetric::MajorFaultsPerSecond | DerivedMetric::CyclesPerInstruction => {
                CounterUnit::Count
            }
            _ => CounterUnit::Ratio,
        }
    }

    /// Evaluate this metric over a snapshot delta.
    ///
    /// Fractions are clamped to `[0, 1]`. Divisions by zero yield 0,
    /// except cycles-per-instruction with no instructions, which is NaN.
    pub fn evaluate(self, delta: &CounterSnapshot) -> f64 {
        let value = |kind| delta.value(kind) as f64;
        let wall_seconds = value(CounterKind::WallClock) / 1e9;
        match self {
            DerivedMetric::CpuSeconds => wall_seconds,
            DerivedMetric::TaskIdleFraction => {
                let wall = value(CounterKind::WallClock);
                if wall == 0.0 {
                    0.0
                } else {
                    (1.0 - value(CounterKind::TaskClock) / wall).clamp(0.0, 1.0)
                }
            }
            DerivedMetric::MajorFaultsPerSecond => {
                if wall_seconds == 0.0 {
                    0.0
                } else {
                    value(CounterKind::MajorFaults) / wall_seconds
                }
            }
            DerivedMetric::CyclesPerInstruction => {
                let instructions = value(CounterKind::Instructions);
                if instructions == 0.0 {
                    f64::NAN
                } else {
                    value(CounterKind::CpuCycles) / instructions
                }
            }
            DerivedMetric::FrontendStallFraction => {
                fraction(value(CounterKind::StallFrontend), value(CounterKind::CpuCycles))
            }
            DerivedMetric::BackendStallFraction => {
                fraction(value(CounterKind::StallBackend), value(CounterKind::CpuCycles))
            }
            DerivedMetric::CacheMissFraction => fraction(
                value(CounterKind::CacheMisses),
                value(CounterKind::CacheReferences),
            ),
            DerivedMetric::BranchMissFraction => fraction(
                value(CounterKind::BranchMisses),
                value(CounterKind::BranchInstructions),
            ),
        }
    }
}

fn fraction(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(values: &[(CounterKind, u64)]) -> CounterSnapshot {
        let mut snap = CounterSnapshot::zero();
        for &(kind, value) in values {
            snap.set(kind, value);
        }
        snap
    }

    #[test]
    fn delta_is_componentwise() {
        let a = snapshot(&[(CounterKind::CpuCycles, 100), (CounterKind::Instructions, 50)]);
        let b = snapshot(&[(CounterKind::CpuCycles, 350), (CounterKind::Instructions, 75)]);
        let delta = b.delta_since(&a);
        assert_eq!(delta.get(CounterKind::CpuCycles), Some(250));
        assert_eq!(delta.get(CounterKind::Instructions), Some(25));
    }

    #[test]
    fn skewed_subtraction_marks_field_unavailable() {
        let a = snapshot(&[(CounterKind::CpuCycles, 500)]);
        let b = snapshot(&[(CounterKind::CpuCycles, 100)]);
        let delta = b.delta_since(&a);
        assert_eq!(delta.get(CounterKind::CpuCycles), None);
        assert_eq!(delta.value(CounterKind::CpuCycles), 0);
        assert!(matches!(b.try_delta_since(&a), Err(Error::SnapshotSkew)));
        assert!(a.try_delta_since(&b).is_ok());
    }

    #[test]
    fn unavailability_is_contagious() {
        let mut a = CounterSnapshot::zero();
        a.set(CounterKind::CpuCycles, 10);
        let b = CounterSnapshot::unavailable();
        assert_eq!(a.delta_since(&b).get(CounterKind::CpuCycles), None);
        assert_eq!(b.delta_since(&a).get(CounterKind::CpuCycles), None);
    }

    #[test]
    fn deltas_compose() {
        // (C − A) + (B − C) == B − A for readings taken in order A, C, B.
        let a = snapshot(&[(CounterKind::WallClock, 100), (CounterKind::PageFaults, 1)]);
        let c = snapshot(&[(CounterKind::WallClock, 400), (CounterKind::PageFaults, 4)]);
        let b = snapshot(&[(CounterKind::WallClock, 900), (CounterKind::PageFaults, 6)]);
        let mut composed = c.delta_since(&a);
        composed.accumulate(&b.delta_since(&c));
        assert_eq!(composed, b.delta_since(&a));
    }

    #[test]
    fn exclusive_saturates_and_poisons() {
        let inclusive = snapshot(&[
            (CounterKind::WallClock, 300),
            (CounterKind::CpuCycles, 1_000),
        ]);
        let mut children = CounterSnapshot::zero();
        children.set(CounterKind::WallClock, 100);
        // Child cycle count overshoots the parent's: saturate, don't wrap.
        children.set(CounterKind::CpuCycles, 1_200);
        let exclusive = inclusive.exclusive_of(&children);
        assert_eq!(exclusive.get(CounterKind::WallClock), Some(200));
        assert_eq!(exclusive.get(CounterKind::CpuCycles), Some(0));

        // A field the children lost poisons the parent's exclusive value.
        let mut lossy = children;
        lossy.accumulate(&CounterSnapshot::unavailable());
        let poisoned = inclusive.exclusive_of(&lossy);
        assert_eq!(poisoned.get(CounterKind::WallClock), None);
    }

    #[test]
    fn derived_metric_sentinels() {
        let empty = CounterSnapshot::zero();
        assert_eq!(DerivedMetric::TaskIdleFraction.evaluate(&empty), 0.0);
        assert_eq!(DerivedMetric::MajorFaultsPerSecond.evaluate(&empty), 0.0);
        assert_eq!(DerivedMetric::CacheMissFraction.evaluate(&empty), 0.0);
        assert!(DerivedMetric::CyclesPerInstruction.evaluate(&empty).is_nan());
    }

    #[test]
    fn derived_metric_values() {
        let delta = snapshot(&[
            (CounterKind::WallClock, 2_000_000_000),
            (CounterKind::TaskClock, 500_000_000),
            (CounterKind::MajorFaults, 6),
            (CounterKind::CpuCycles, 1_000),
            (CounterKind::Instructions, 500),
            (CounterKind::StallFrontend, 250),
            (CounterKind::StallBackend, 2_000),
            (CounterKind::CacheReferences, 100),
            (CounterKind::CacheMisses, 25),
        ]);
        assert_eq!(DerivedMetric::CpuSeconds.evaluate(&delta), 2.0);
        assert_eq!(DerivedMetric::TaskIdleFraction.evaluate(&delta), 0.75);
        assert_eq!(DerivedMetric::MajorFaultsPerSecond.evaluate(&delta), 3.0);
        assert_eq!(DerivedMetric::CyclesPerInstruction.evaluate(&delta), 2.0);
        assert_eq!(DerivedMetric::FrontendStallFraction.evaluate(&delta), 0.25);
        // Stalls beyond the cycle count clamp to 1.
        assert_eq!(DerivedMetric::BackendStallFraction.evaluate(&delta), 1.0);
        assert_eq!(DerivedMetric::CacheMissFraction.evaluate(&delta), 0.25);
    }
}
