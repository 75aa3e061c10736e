//! Collector catalog.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CollectorFactory                        │
//! │   build(kind, rate) ──► Collector                            │
//! │                          ├─ Continuous(ContinuousCollector)  │
//! │                          │    CpuProfiler (sampler thread)   │
//! │                          └─ Snapshot(SnapshotCollector)      │
//! │                               Heap/Allocs   ──► HeapProbe    │
//! │                               LiveStacks/Block/Mutex         │
//! │                                     │                        │
//! │                              ┌──────▼──────┐                 │
//! │                              │ ProcReader  │                 │
//! │                              └──────┬──────┘                 │
//! │                              ┌──────▼──────┐                 │
//! │                              │ FileSystem  │ (trait)         │
//! │                              └──────┬──────┘                 │
//! └─────────────────────────────────────┼────────────────────────┘
//!                          ┌────────────┴────────────┐
//!                   ┌──────▼──────┐           ┌──────▼──────┐
//!                   │   RealFs    │           │   MockFs    │
//!                   └─────────────┘           └─────────────┘
//! ```
//!
//! Every collector writes one artifact through its own [`ArtifactSink`];
//! a failure in one never touches the state of another.

pub mod allocator;
pub mod cpu;
pub mod heap;
mod kind;
#[cfg(test)]
pub mod mock;
pub mod procfs;
pub mod sink;
pub mod threads;
pub mod traits;

pub use allocator::{AppliedRate, HeapProbe, JemallocProbe, ProbeError};
pub use cpu::CpuProfiler;
pub use heap::{AllocsSnapshot, HeapSnapshot};
pub use kind::{ARTIFACT_EXTENSION, CollectorKind, Lifecycle};
pub use procfs::{CollectError, ProcReader};
pub use sink::{ArtifactSink, ArtifactWriter};
pub use threads::{BlockSnapshot, LiveStacksSnapshot, MutexSnapshot};
pub use traits::{FileSystem, RealFs};

use crate::config::CollectionPlan;
use crate::profile::Profile;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for collector operations.
#[derive(Debug)]
pub enum CollectorError {
    /// `start` on a collector that was already started this run.
    AlreadyRunning(CollectorKind),
    /// The artifact file could not be created.
    SinkUnavailable { path: PathBuf, source: io::Error },
    /// Reading the measured state failed.
    Capture(String),
    /// Allocator introspection failed.
    Probe(ProbeError),
    Io(io::Error),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::AlreadyRunning(kind) => write!(f, "{} collector already running", kind),
            CollectorError::SinkUnavailable { path, source } => {
                write!(f, "cannot open sink {}: {}", path.display(), source)
            }
            CollectorError::Capture(msg) => write!(f, "capture failed: {}", msg),
            CollectorError::Probe(e) => write!(f, "allocator probe: {}", e),
            CollectorError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::SinkUnavailable { source, .. } => Some(source),
            CollectorError::Probe(e) => Some(e),
            CollectorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CollectorError {
    fn from(e: io::Error) -> Self {
        CollectorError::Io(e)
    }
}

impl From<ProbeError> for CollectorError {
    fn from(e: ProbeError) -> Self {
        CollectorError::Probe(e)
    }
}

impl From<CollectError> for CollectorError {
    fn from(e: CollectError) -> Self {
        CollectorError::Capture(e.to_string())
    }
}

/// A collector that accumulates over an interval.
pub trait ContinuousCollector: Send {
    fn kind(&self) -> CollectorKind;

    /// Begins collecting into `sink`.
    fn start(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError>;

    /// Points the collector at the spawned child.
    fn attach(&mut self, _pid: u32) {}

    /// Finalizes and closes the sink. Idempotent.
    fn stop(&mut self) -> Result<(), CollectorError>;
}

/// A collector that captures current state on demand.
pub trait SnapshotCollector: Send {
    fn kind(&self) -> CollectorKind;

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError>;
}

/// One collector of either lifecycle.
pub enum Collector {
    Continuous(Box<dyn ContinuousCollector>),
    Snapshot(Box<dyn SnapshotCollector>),
}

impl Collector {
    pub fn kind(&self) -> CollectorKind {
        match self {
            Collector::Continuous(c) => c.kind(),
            Collector::Snapshot(c) => c.kind(),
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collector::Continuous(c) => write!(f, "Continuous({})", c.kind()),
            Collector::Snapshot(c) => write!(f, "Snapshot({})", c.kind()),
        }
    }
}

/// Opens `sink`, builds the profile and commits it. The sink is opened first
/// so an unwritable destination fails before any measurement is taken.
pub(crate) fn capture(
    sink: &ArtifactSink,
    build: impl FnOnce() -> Result<Profile, CollectorError>,
) -> Result<(), CollectorError> {
    let writer = sink.open()?;
    let profile = build()?;
    writer.commit(&profile)?;
    Ok(())
}

/// Builds collectors for a run.
pub trait CollectorFactory {
    /// Constructs the collector for `kind`. `rate` is the plan's effective
    /// rate for kinds that take one.
    fn build(&self, kind: CollectorKind, rate: Option<u64>) -> Collector;

    /// Applies process-wide knobs. Called once before the child is spawned.
    fn arm(&self, _plan: &CollectionPlan) {}
}

/// Collectors backed by procfs and the jemalloc probe.
pub struct ProcfsFactory<F: FileSystem + Clone + 'static> {
    fs: F,
    proc_path: String,
    probe: Arc<dyn HeapProbe>,
    heap_rate: AppliedRate,
    cpu_frequency: u32,
    cpu_duration: Option<Duration>,
}

impl ProcfsFactory<RealFs> {
    /// Factory reading the real `/proc` with the linked allocator.
    pub fn for_plan(plan: &CollectionPlan) -> Self {
        Self::new(RealFs::new(), "/proc", Arc::new(JemallocProbe::new()), plan)
    }
}

impl<F: FileSystem + Clone + 'static> ProcfsFactory<F> {
    pub fn new(
        fs: F,
        proc_path: impl Into<String>,
        probe: Arc<dyn HeapProbe>,
        plan: &CollectionPlan,
    ) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            probe,
            heap_rate: AppliedRate::new(),
            cpu_frequency: plan.cpu_frequency(),
            cpu_duration: plan.cpu_duration(),
        }
    }

    fn reader(&self) -> ProcReader<F> {
        ProcReader::new(self.fs.clone(), self.proc_path.clone())
    }
}

impl<F: FileSystem + Clone + 'static> CollectorFactory for ProcfsFactory<F> {
    fn build(&self, kind: CollectorKind, rate: Option<u64>) -> Collector {
        let rate = rate.or_else(|| kind.default_rate()).unwrap_or(1);
        match kind {
            CollectorKind::Cpu => Collector::Continuous(Box::new(CpuProfiler::new(
                self.reader(),
                self.cpu_frequency,
                self.cpu_duration,
            ))),
            CollectorKind::Heap => Collector::Snapshot(Box::new(HeapSnapshot::new(
                self.probe.clone(),
                self.reader(),
                self.heap_rate.clone(),
            ))),
            CollectorKind::Allocations => Collector::Snapshot(Box::new(AllocsSnapshot::new(
                self.probe.clone(),
                self.reader(),
            ))),
            CollectorKind::LiveStacks => {
                Collector::Snapshot(Box::new(LiveStacksSnapshot::new(self.reader())))
            }
            CollectorKind::Blocking => {
                Collector::Snapshot(Box::new(BlockSnapshot::new(self.reader(), rate)))
            }
            CollectorKind::LockContention => {
                Collector::Snapshot(Box::new(MutexSnapshot::new(self.reader(), rate)))
            }
        }
    }

    fn arm(&self, plan: &CollectionPlan) {
        if !plan.is_enabled(CollectorKind::Heap) && !plan.is_enabled(CollectorKind::Allocations) {
            return;
        }
        let Some(rate) = plan.rate(CollectorKind::Heap) else {
            return;
        };
        match self.probe.set_sample_interval(rate) {
            Ok(()) => {
                self.heap_rate.set(rate);
                debug!(rate, "heap sampling interval applied");
            }
            Err(e) => warn!(rate, error = %e, "heap sampling interval not applied"),
        }
    }
}
