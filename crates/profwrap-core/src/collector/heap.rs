//! Allocator snapshots: live heap figures and cumulative allocation counters.

use crate::collector::allocator::{AppliedRate, HeapProbe};
use crate::collector::procfs::{ProcReader, ProcTarget};
use crate::collector::sink::ArtifactSink;
use crate::collector::traits::FileSystem;
use crate::collector::{CollectorError, CollectorKind, SnapshotCollector, capture};
use crate::profile::Profile;
use std::sync::Arc;
use tracing::debug;

const KIB: i64 = 1024;

/// Live heap after a full purge: allocator counters plus the process' Vm* figures.
pub struct HeapSnapshot<F: FileSystem> {
    probe: Arc<dyn HeapProbe>,
    reader: ProcReader<F>,
    rate: AppliedRate,
}

impl<F: FileSystem> HeapSnapshot<F> {
    /// `rate` is the sampling interval the allocator accepted, if any.
    pub fn new(probe: Arc<dyn HeapProbe>, reader: ProcReader<F>, rate: AppliedRate) -> Self {
        Self {
            probe,
            reader,
            rate,
        }
    }

    fn build(&self) -> Result<Profile, CollectorError> {
        self.probe.purge()?;
        let stats = self.probe.heap_stats()?;

        let rate = self.rate.get();
        let mut profile =
            Profile::new(CollectorKind::Heap, &[("space", "bytes")], rate.unwrap_or(0));
        for (name, value) in [
            ("allocated", stats.allocated),
            ("active", stats.active),
            ("resident", stats.resident),
            ("mapped", stats.mapped),
            ("retained", stats.retained),
            ("metadata", stats.metadata),
        ] {
            profile.add_sample(&["allocator", name], &[value as i64], &[]);
        }

        // Vm* figures are best effort: absent off Linux.
        match self.reader.process_status(ProcTarget::Current) {
            Ok(status) => {
                for (name, kib) in [
                    ("VmPeak", status.vm_peak),
                    ("VmSize", status.vm_size),
                    ("VmHWM", status.vm_hwm),
                    ("VmRSS", status.vm_rss),
                    ("VmData", status.vm_data),
                    ("VmStk", status.vm_stk),
                    ("VmSwap", status.vm_swap),
                ] {
                    profile.add_sample(&["process", name], &[kib as i64 * KIB], &[]);
                }
            }
            Err(e) => debug!(error = %e, "heap: process status unavailable"),
        }

        if let Some(rate) = rate {
            profile.add_comment(&format!("sample_interval: {} bytes", rate));
        }
        Ok(profile)
    }
}

impl<F: FileSystem> SnapshotCollector for HeapSnapshot<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Heap
    }

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        capture(sink, || self.build())
    }
}

/// Cumulative allocations since process start, plus page faults of the
/// supervisor and its reaped children.
pub struct AllocsSnapshot<F: FileSystem> {
    probe: Arc<dyn HeapProbe>,
    reader: ProcReader<F>,
}

impl<F: FileSystem> AllocsSnapshot<F> {
    pub fn new(probe: Arc<dyn HeapProbe>, reader: ProcReader<F>) -> Self {
        Self { probe, reader }
    }

    fn build(&self) -> Result<Profile, CollectorError> {
        self.probe.purge()?;
        let counters = self.probe.alloc_counters()?;

        let mut profile = Profile::new(
            CollectorKind::Allocations,
            &[("objects", "count"), ("space", "bytes")],
            0,
        );
        let rows = [
            ("small", "malloc", counters.small_nmalloc, counters.small_allocated),
            ("small", "free", counters.small_ndalloc, 0),
            ("large", "malloc", counters.large_nmalloc, counters.large_allocated),
            ("large", "free", counters.large_ndalloc, 0),
        ];
        for (class, op, objects, bytes) in rows {
            profile.add_sample(
                &["allocator", class, op],
                &[objects as i64, bytes as i64],
                &[],
            );
        }

        match self.reader.process_stat(ProcTarget::Current) {
            Ok(stat) => {
                let faults = [
                    ("self", "minor", stat.minflt),
                    ("self", "major", stat.majflt),
                    ("children", "minor", stat.cminflt),
                    ("children", "major", stat.cmajflt),
                ];
                for (who, kind, count) in faults {
                    profile.add_sample(&["page-faults", who, kind], &[count as i64], &[]);
                }
            }
            Err(e) => debug!(error = %e, "allocs: process stat unavailable"),
        }
        Ok(profile)
    }
}

impl<F: FileSystem> SnapshotCollector for AllocsSnapshot<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Allocations
    }

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        capture(sink, || self.build())
    }
}
