//! Continuous CPU-time sampling of the supervised process tree.
//!
//! A background thread wakes every `1 / frequency` seconds, walks the child
//! and its descendants through procfs and charges each thread with the clock
//! ticks it consumed since the previous wake-up.

use crate::collector::procfs::parser::ProcStat;
use crate::collector::procfs::{CLK_TCK, ProcReader, ProcTarget};
use crate::collector::sink::{ArtifactSink, ArtifactWriter};
use crate::collector::traits::FileSystem;
use crate::collector::{CollectorError, CollectorKind, ContinuousCollector};
use crate::profile::Profile;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

const NANOS_PER_TICK: u64 = 1_000_000_000 / CLK_TCK;

/// Pid of the supervised child, published once it has been spawned.
#[derive(Debug, Clone, Default)]
pub struct TargetPid(Arc<AtomicU32>);

impl TargetPid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, pid: u32) {
        self.0.store(pid, Ordering::Release);
    }

    pub fn get(&self) -> Option<u32> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// Why the sampler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Requested,
    Deadline,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Requested => write!(f, "requested"),
            StopCause::Deadline => write!(f, "deadline"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ThreadTotals {
    samples: i64,
    cpu_nanos: i64,
}

/// Turns successive tick readings into per-thread CPU totals.
#[derive(Debug, Default)]
pub struct CpuAccumulator {
    last_ticks: HashMap<(u32, u32), u64>,
    totals: BTreeMap<(String, String, u32), ThreadTotals>,
}

impl CpuAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one reading of the threads of process `pid`.
    ///
    /// A thread seen for the first time is charged with all its ticks: it
    /// started after sampling began.
    pub fn observe(&mut self, pid: u32, process: &str, threads: &[ProcStat]) {
        for thread in threads {
            let ticks = thread.cpu_ticks();
            let previous = self
                .last_ticks
                .insert((pid, thread.pid), ticks)
                .unwrap_or(0);
            let delta = ticks.saturating_sub(previous);
            if delta == 0 {
                continue;
            }
            let entry = self
                .totals
                .entry((process.to_string(), thread.comm.clone(), pid))
                .or_default();
            entry.samples += 1;
            entry.cpu_nanos += (delta * NANOS_PER_TICK) as i64;
        }
    }

    /// Reads every process of the tree rooted at `root`.
    pub fn observe_tree<F: FileSystem>(&mut self, reader: &ProcReader<F>, root: u32) {
        for pid in reader.process_tree(root) {
            let Ok(threads) = reader.task_stats(ProcTarget::Pid(pid)) else {
                continue;
            };
            let process = threads
                .iter()
                .find(|t| t.pid == pid)
                .map(|t| t.comm.clone())
                .unwrap_or_else(|| pid.to_string());
            self.observe(pid, &process, &threads);
        }
    }

    pub fn thread_count(&self) -> usize {
        self.totals.len()
    }

    /// Appends one sample per thread that consumed CPU.
    pub fn fill(&self, profile: &mut Profile) {
        for ((process, thread, pid), totals) in &self.totals {
            let pid = pid.to_string();
            profile.add_sample(
                &[process.as_str(), thread.as_str()],
                &[totals.samples, totals.cpu_nanos],
                &[("pid", pid.as_str())],
            );
        }
    }
}

enum CpuState {
    Idle,
    Running {
        cancel: Sender<()>,
        handle: JoinHandle<Result<u64, CollectorError>>,
    },
    Stopped,
}

/// CPU profiler over procfs.
pub struct CpuProfiler<F: FileSystem + Clone + 'static> {
    reader: ProcReader<F>,
    frequency: u32,
    duration: Option<Duration>,
    target: TargetPid,
    state: CpuState,
}

impl<F: FileSystem + Clone + 'static> CpuProfiler<F> {
    pub fn new(reader: ProcReader<F>, frequency: u32, duration: Option<Duration>) -> Self {
        Self {
            reader,
            frequency: frequency.max(1),
            duration,
            target: TargetPid::new(),
            state: CpuState::Idle,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frequency))
    }
}

impl<F: FileSystem + Clone + 'static> ContinuousCollector for CpuProfiler<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Cpu
    }

    fn start(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        if !matches!(self.state, CpuState::Idle) {
            return Err(CollectorError::AlreadyRunning(CollectorKind::Cpu));
        }
        let writer = sink.open()?;
        let (cancel, cancelled) = mpsc::channel();
        let sampler = Sampler {
            reader: self.reader.clone(),
            target: self.target.clone(),
            period: self.period(),
            deadline: self.duration.map(|d| Instant::now() + d),
        };
        let handle = thread::Builder::new()
            .name("cpu-sampler".to_string())
            .spawn(move || sampler.run(cancelled, writer))?;

        info!(
            hz = self.frequency,
            duration = ?self.duration,
            path = %sink.path().display(),
            "cpu profiling started"
        );
        self.state = CpuState::Running { cancel, handle };
        Ok(())
    }

    fn attach(&mut self, pid: u32) {
        self.target.publish(pid);
    }

    fn stop(&mut self) -> Result<(), CollectorError> {
        match std::mem::replace(&mut self.state, CpuState::Stopped) {
            CpuState::Idle => {
                self.state = CpuState::Idle;
                Ok(())
            }
            CpuState::Stopped => Ok(()),
            CpuState::Running { cancel, handle } => {
                // The sampler may already have hit its deadline and dropped the receiver.
                let _ = cancel.send(());
                let bytes = handle.join().map_err(|_| {
                    CollectorError::Capture("cpu sampler thread panicked".to_string())
                })??;
                info!(bytes, "cpu profiling stopped");
                Ok(())
            }
        }
    }
}

struct Sampler<F: FileSystem> {
    reader: ProcReader<F>,
    target: TargetPid,
    period: Duration,
    deadline: Option<Instant>,
}

impl<F: FileSystem> Sampler<F> {
    fn run(
        self,
        cancelled: mpsc::Receiver<()>,
        writer: ArtifactWriter,
    ) -> Result<u64, CollectorError> {
        let started = Instant::now();
        let mut profile = Profile::new(
            CollectorKind::Cpu,
            &[("samples", "count"), ("cpu", "nanoseconds")],
            self.period.as_nanos() as u64,
        );
        let mut acc = CpuAccumulator::new();
        let mut wakeups = 0u64;

        let cause = loop {
            let timeout = match self.deadline {
                Some(deadline) => self
                    .period
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.period,
            };
            match cancelled.recv_timeout(timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break StopCause::Requested,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if let Some(pid) = self.target.get() {
                acc.observe_tree(&self.reader, pid);
                wakeups += 1;
                trace!(wakeups, threads = acc.thread_count(), "cpu sample");
            }
            if self.deadline.is_some_and(|d| Instant::now() >= d) {
                break StopCause::Deadline;
            }
        };

        debug!(%cause, wakeups, "cpu sampler finished");
        acc.fill(&mut profile);
        profile.duration_nanos = started.elapsed().as_nanos() as i64;
        profile.add_comment(&format!("stop: {}", cause));
        profile.add_comment(&format!("wakeups: {}", wakeups));
        writer.commit(&profile)
    }
}
