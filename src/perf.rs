//! Linux `perf_event_open` plumbing.
//!
//! One [`PerfCounters`] instance belongs to one thread: the kernel
//! attributes every event to the task that opened it, so handles are never
//! shared across threads. Hardware events that feed a common derived
//! metric are opened as leader/follower groups, which makes the kernel
//! schedule them together and report one `time_enabled`/`time_running`
//! pair per group; the software events are independent singletons.
//!
//! All events are opened disabled, excluding kernel and hypervisor
//! samples, and with a read format that requests both `time_enabled` and
//! `time_running` so multiplexed values can be rescaled.

use std::fs::File;
use std::io::{self, Read};
use std::os::raw::{c_int, c_uint};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use perf_event_open_sys as sys;
use perf_event_open_sys::bindings::perf_event_attr;

use crate::counters::{CounterGroup, CounterKind};
use crate::snapshot::{CounterSnapshot, GroupTiming};

/// Produce an `io::Result` from an errno-style system call.
///
/// An 'errno-style' system call is one that reports failure by returning -1
/// and setting the C `errno` value when an error occurs.
fn check_errno_syscall<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
    R: PartialOrd + Default,
{
    let result = f();
    if result < R::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// View a `u64` slice as the byte buffer a counter `read` fills in.
fn as_byte_slice_mut(slice: &mut [u64]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            slice.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(slice),
        )
    }
}

/// Rescale a raw sample for kernel multiplexing.
///
/// When the event ran for only part of the time it was enabled, the raw
/// count covers that fraction; scaling by `enabled / running` estimates
/// the full-period value. An event that never ran has no meaningful value
/// at all.
fn scaled(value: u64, enabled: u64, running: u64) -> Option<u64> {
    if running == 0 {
        None
    } else if running >= enabled {
        Some(value)
    } else {
        // u128 keeps the multiply exact; the division is rare enough that
        // its software implementation doesn't matter.
        Some((value as u128 * enabled as u128 / running as u128) as u64)
    }
}

fn kind_config(kind: CounterKind) -> (u32, u64) {
    use sys::bindings as b;
    match kind {
        CounterKind::WallClock => (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_CPU_CLOCK as u64),
        CounterKind::TaskClock => (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_TASK_CLOCK as u64),
        CounterKind::PageFaults => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_PAGE_FAULTS as u64)
        }
        CounterKind::ContextSwitches => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_CONTEXT_SWITCHES as u64)
        }
        CounterKind::CpuMigrations => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_CPU_MIGRATIONS as u64)
        }
        CounterKind::MinorFaults => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_PAGE_FAULTS_MIN as u64)
        }
        CounterKind::MajorFaults => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_PAGE_FAULTS_MAJ as u64)
        }
        CounterKind::AlignmentFaults => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_ALIGNMENT_FAULTS as u64)
        }
        CounterKind::EmulationFaults => {
            (b::PERF_TYPE_SOFTWARE, b::PERF_COUNT_SW_EMULATION_FAULTS as u64)
        }
        CounterKind::CpuCycles => (b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CPU_CYCLES as u64),
        CounterKind::Instructions => {
            (b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_INSTRUCTIONS as u64)
        }
        CounterKind::StallFrontend => (
            b::PERF_TYPE_HARDWARE,
            b::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND as u64,
        ),
        CounterKind::StallBackend => (
            b::PERF_TYPE_HARDWARE,
            b::PERF_COUNT_HW_STALLED_CYCLES_BACKEND as u64,
        ),
        CounterKind::CacheReferences => (
            b::PERF_TYPE_HARDWARE,
            b::PERF_COUNT_HW_CACHE_REFERENCES as u64,
        ),
        CounterKind::CacheMisses => {
            (b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_CACHE_MISSES as u64)
        }
        CounterKind::BranchInstructions => (
            b::PERF_TYPE_HARDWARE,
            b::PERF_COUNT_HW_BRANCH_INSTRUCTIONS as u64,
        ),
        CounterKind::BranchMisses => {
            (b::PERF_TYPE_HARDWARE, b::PERF_COUNT_HW_BRANCH_MISSES as u64)
        }
    }
}

fn base_attrs(kind: CounterKind, grouped: bool) -> perf_event_attr {
    let (type_, config) = kind_config(kind);
    let mut attrs = perf_event_attr {
        // Setting `size` accurately will not prevent the code from working
        // on older kernels; unknown trailing fields are zero.
        size: std::mem::size_of::<perf_event_attr>() as u32,
        type_,
        config,
        ..perf_event_attr::default()
    };

    attrs.set_disabled(1);
    attrs.set_exclude_kernel(1); // don't count time in kernel
    attrs.set_exclude_hv(1); // don't count time in hypervisor

    attrs.read_format = (sys::bindings::PERF_FORMAT_TOTAL_TIME_ENABLED
        | sys::bindings::PERF_FORMAT_TOTAL_TIME_RUNNING) as u64;
    if grouped {
        // Group reads go through the leader and need member ids to tell
        // the values apart.
        attrs.read_format |=
            (sys::bindings::PERF_FORMAT_ID | sys::bindings::PERF_FORMAT_GROUP) as u64;
    }
    attrs
}

/// One open event file descriptor plus its kernel-assigned id.
struct EventFd {
    file: File,
    id: u64,
}

impl EventFd {
    fn open(kind: CounterKind, grouped: bool, group_fd: RawFd) -> io::Result<EventFd> {
        let mut attrs = base_attrs(kind, grouped);
        let file = unsafe {
            File::from_raw_fd(check_errno_syscall(|| {
                sys::perf_event_open(&mut attrs, 0, -1, group_fd, 0)
            })?)
        };

        let mut id = 0_u64;
        check_errno_syscall(|| unsafe { sys::ioctls::ID(file.as_raw_fd(), &mut id) })?;
        Ok(EventFd { file, id })
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EventFd")
            .field("fd", &self.file.as_raw_fd())
            .field("id", &self.id)
            .finish()
    }
}

/// A leader/follower group of hardware events read as a unit.
#[derive(Debug)]
struct EventGroup {
    which: CounterGroup,
    leader: EventFd,
    followers: Vec<EventFd>,
    /// Kernel id → counter kind, leader first.
    members: Vec<(u64, CounterKind)>,
}

impl EventGroup {
    fn open(which: CounterGroup, kinds: &[CounterKind]) -> io::Result<EventGroup> {
        let leader = EventFd::open(kinds[0], true, -1)?;
        let mut members = vec![(leader.id, kinds[0])];
        let mut followers = Vec::with_capacity(kinds.len() - 1);
        for &kind in &kinds[1..] {
            let follower = EventFd::open(kind, true, leader.file.as_raw_fd())?;
            members.push((follower.id, kind));
            followers.push(follower);
        }
        Ok(EventGroup {
            which,
            leader,
            followers,
            members,
        })
    }

    /// An ioctl on the leader with `PERF_IOC_FLAG_GROUP` applies to every
    /// member atomically.
    fn ioctl(&mut self, f: unsafe fn(c_int, c_uint) -> c_int) -> io::Result<()> {
        check_errno_syscall(|| unsafe {
            f(self.leader.file.as_raw_fd(), sys::bindings::PERF_IOC_FLAG_GROUP)
        })
        .map(|_| ())
    }

    /// Read the whole group through the leader and store the rescaled
    /// values and the group timing pair into `snap`.
    fn read_into(&mut self, snap: &mut CounterSnapshot) -> io::Result<()> {
        // With `PERF_FORMAT_{ID,GROUP,TOTAL_TIME_{ENABLED,RUNNING}}`, the
        // data has the form:
        //
        //     struct read_format {
        //         u64 nr;            /* The number of events */
        //         u64 time_enabled;
        //         u64 time_running;
        //         struct {
        //             u64 value;
        //             u64 id;
        //         } values[nr];
        //     };
        let mut data = vec![0_u64; 3 + 2 * self.members.len()];
        let bytes = self.leader.file.read(as_byte_slice_mut(&mut data))?;
        if bytes != std::mem::size_of_val(&data[..]) || data[0] as usize != self.members.len()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "group read did not match the configured members",
            ));
        }

        let (enabled, running) = (data[1], data[2]);
        snap.set_timing(self.which, GroupTiming { enabled, running });
        for n in 0..self.members.len() {
            let value = data[3 + 2 * n];
            let id = data[4 + 2 * n];
            let kind = match self.members.iter().find(|(member, _)| *member == id) {
                Some((_, kind)) => *kind,
                None => continue,
            };
            if let Some(value) = scaled(value, enabled, running) {
                snap.set(kind, value);
            }
        }
        Ok(())
    }
}

/// An independent software event.
#[derive(Debug)]
struct SoloCounter {
    kind: CounterKind,
    event: EventFd,
}

impl SoloCounter {
    fn open(kind: CounterKind) -> io::Result<SoloCounter> {
        Ok(SoloCounter {
            kind,
            event: EventFd::open(kind, false, -1)?,
        })
    }

    fn ioctl(&mut self, f: unsafe fn(c_int, c_uint) -> c_int) -> io::Result<()> {
        check_errno_syscall(|| unsafe { f(self.event.file.as_raw_fd(), 0) }).map(|_| ())
    }

    fn read_into(&mut self, snap: &mut CounterSnapshot) -> io::Result<()> {
        // Non-group layout: value, time_enabled, time_running.
        let mut data = [0_u64; 3];
        let bytes = self.event.file.read(as_byte_slice_mut(&mut data))?;
        if bytes != std::mem::size_of_val(&data) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short counter read",
            ));
        }
        let (value, enabled, running) = (data[0], data[1], data[2]);
        if self.kind == CounterKind::WallClock {
            // The software singletons are always schedulable; one pair
            // stands in for all of them.
            snap.set_timing(CounterGroup::Software, GroupTiming { enabled, running });
        }
        if let Some(value) = scaled(value, enabled, running) {
            snap.set(self.kind, value);
        }
        Ok(())
    }
}

const CYCLES_KINDS: [CounterKind; 4] = [
    CounterKind::CpuCycles,
    CounterKind::Instructions,
    CounterKind::StallFrontend,
    CounterKind::StallBackend,
];

const CACHE_KINDS: [CounterKind; 2] = [CounterKind::CacheReferences, CounterKind::CacheMisses];

const BRANCH_KINDS: [CounterKind; 2] =
    [CounterKind::BranchInstructions, CounterKind::BranchMisses];

const SOFTWARE_KINDS: [CounterKind; 9] = [
    CounterKind::WallClock,
    CounterKind::TaskClock,
    CounterKind::PageFaults,
    CounterKind::ContextSwitches,
    CounterKind::CpuMigrations,
    CounterKind::MinorFaults,
    CounterKind::MajorFaults,
    CounterKind::AlignmentFaults,
    CounterKind::EmulationFaults,
];

/// Every kernel counter one thread tracks.
#[derive(Debug)]
pub struct PerfCounters {
    groups: Vec<EventGroup>,
    solos: Vec<SoloCounter>,
    /// First read or ioctl failure since open, held until the lifecycle
    /// collects it via [`take_fault`](PerfCounters::take_fault).
    fault: Option<io::Error>,
    fault_reported: bool,
}

/// Keep the first failure; later ones add nothing new about this thread.
fn keep_first_fault(slot: &mut Option<io::Error>, reported: bool, err: io::Error) {
    if !reported && slot.is_none() {
        log::warn!("perf counter read failed, field marked unavailable: {err}");
        *slot = Some(err);
    }
}

impl PerfCounters {
    /// Open all groups and singletons for the calling thread.
    ///
    /// Any failure is fatal for the whole instance: the caller degrades to
    /// the no-op provider rather than measuring an inconsistent subset.
    pub fn open() -> io::Result<PerfCounters> {
        let groups = vec![
            EventGroup::open(CounterGroup::Cycles, &CYCLES_KINDS)?,
            EventGroup::open(CounterGroup::Cache, &CACHE_KINDS)?,
            EventGroup::open(CounterGroup::Branch, &BRANCH_KINDS)?,
        ];
        let mut solos = Vec::with_capacity(SOFTWARE_KINDS.len());
        for kind in SOFTWARE_KINDS {
            solos.push(SoloCounter::open(kind)?);
        }
        Ok(PerfCounters {
            groups,
            solos,
            fault: None,
            fault_reported: false,
        })
    }

    /// Reset every counter to zero.
    pub fn reset(&mut self) {
        self.for_each_ioctl(sys::ioctls::RESET);
    }

    /// Start counting on every counter.
    pub fn enable(&mut self) {
        self.for_each_ioctl(sys::ioctls::ENABLE);
    }

    fn for_each_ioctl(&mut self, f: unsafe fn(c_int, c_uint) -> c_int) {
        for group in &mut self.groups {
            if let Err(err) = group.ioctl(f) {
                keep_first_fault(&mut self.fault, self.fault_reported, err);
            }
        }
        for solo in &mut self.solos {
            if let Err(err) = solo.ioctl(f) {
                keep_first_fault(&mut self.fault, self.fault_reported, err);
            }
        }
    }

    /// Read everything into one snapshot. Fields whose reads fail stay
    /// flagged unavailable; the thread carries on.
    pub fn snapshot(&mut self) -> CounterSnapshot {
        let mut snap = CounterSnapshot::unavailable();
        for group in &mut self.groups {
            if let Err(err) = group.read_into(&mut snap) {
                keep_first_fault(&mut self.fault, self.fault_reported, err);
            }
        }
        for solo in &mut self.solos {
            if let Err(err) = solo.read_into(&mut snap) {
                keep_first_fault(&mut self.fault, self.fault_reported, err);
            }
        }
        snap
    }

    /// The first read or ioctl failure since open, handed out at most
    /// once. The lifecycle turns it into a `counter_unavailable` record
    /// for this thread; later failures stay quiet.
    pub fn take_fault(&mut self) -> Option<io::Error> {
        if self.fault_reported {
            return None;
        }
        let fault = self.fault.take();
        if fault.is_some() {
            self.fault_reported = true;
        }
        fault
    }
}

impl Drop for PerfCounters {
    fn drop(&mut self) {
        // Close in the reverse of open order: singletons first, then each
        // group's followers before its leader.
        while self.solos.pop().is_some() {}
        while let Some(mut group) = self.groups.pop() {
            while group.followers.pop().is_some() {}
        }
    }
}
