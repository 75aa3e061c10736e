//! The fixed catalog of collector kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// File extension shared by every artifact.
pub const ARTIFACT_EXTENSION: &str = "prof";

/// Every kind a plan can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectorKind {
    Cpu,
    Heap,
    LiveStacks,
    Blocking,
    LockContention,
    Allocations,
}

/// Lifecycle shape of a collector kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accumulates over an interval and must be stopped to finalize.
    Continuous,
    /// Captures current state on demand.
    PointInTime,
}

impl CollectorKind {
    /// All kinds, in catalog order.
    pub const ALL: [CollectorKind; 6] = [
        CollectorKind::Cpu,
        CollectorKind::Heap,
        CollectorKind::LiveStacks,
        CollectorKind::Blocking,
        CollectorKind::LockContention,
        CollectorKind::Allocations,
    ];

    /// Order in which point-in-time collectors are snapshotted during draining.
    /// Fixed so artifacts of two runs can be diffed.
    pub const SNAPSHOT_ORDER: [CollectorKind; 5] = [
        CollectorKind::Heap,
        CollectorKind::LiveStacks,
        CollectorKind::Blocking,
        CollectorKind::LockContention,
        CollectorKind::Allocations,
    ];

    pub fn lifecycle(self) -> Lifecycle {
        match self {
            CollectorKind::Cpu => Lifecycle::Continuous,
            _ => Lifecycle::PointInTime,
        }
    }

    pub fn is_continuous(self) -> bool {
        self.lifecycle() == Lifecycle::Continuous
    }

    /// Short name used in settings, file names and logs.
    pub fn name(self) -> &'static str {
        match self {
            CollectorKind::Cpu => "cpu",
            CollectorKind::Heap => "heap",
            CollectorKind::LiveStacks => "goroutine",
            CollectorKind::Blocking => "block",
            CollectorKind::LockContention => "mutex",
            CollectorKind::Allocations => "allocs",
        }
    }

    /// Parses a kind name as accepted in `PROFWRAP_PROFILES`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(CollectorKind::Cpu),
            "heap" => Some(CollectorKind::Heap),
            "goroutine" | "live-stacks" | "threads" => Some(CollectorKind::LiveStacks),
            "block" | "blocking" => Some(CollectorKind::Blocking),
            "mutex" | "lock-contention" => Some(CollectorKind::LockContention),
            "allocs" | "allocations" => Some(CollectorKind::Allocations),
            _ => None,
        }
    }

    /// Deterministic artifact file name, e.g. `cpu.prof`.
    pub fn artifact_name(self) -> String {
        format!("{}.{}", self.name(), ARTIFACT_EXTENSION)
    }

    /// Default sampling rate for kinds that take one.
    ///
    /// - Heap: average bytes allocated between samples.
    /// - Blocking: nanoseconds spent blocked per recorded event.
    /// - LockContention: on average 1/fraction contention events are kept.
    pub fn default_rate(self) -> Option<u64> {
        match self {
            CollectorKind::Heap => Some(512 * 1024),
            CollectorKind::Blocking => Some(1),
            CollectorKind::LockContention => Some(1),
            _ => None,
        }
    }

    /// Whether the kind accepts a sampling rate at all.
    pub fn takes_rate(self) -> bool {
        self.default_rate().is_some()
    }

    /// Inverse of [`artifact_name`](Self::artifact_name).
    pub fn from_artifact_name(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?;
        CollectorKind::ALL.into_iter().find(|k| k.name() == stem)
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_names_are_distinct() {
        let mut names: Vec<String> = CollectorKind::ALL.iter().map(|k| k.artifact_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CollectorKind::ALL.len());
        assert_eq!(CollectorKind::Cpu.artifact_name(), "cpu.prof");
        assert_eq!(CollectorKind::LiveStacks.artifact_name(), "goroutine.prof");
    }

    #[test]
    fn test_snapshot_order_covers_point_in_time_kinds() {
        let point_in_time: Vec<CollectorKind> = CollectorKind::ALL
            .into_iter()
            .filter(|k| !k.is_continuous())
            .collect();
        assert_eq!(point_in_time.len(), CollectorKind::SNAPSHOT_ORDER.len());
        for kind in point_in_time {
            assert!(CollectorKind::SNAPSHOT_ORDER.contains(&kind));
        }
        assert_eq!(CollectorKind::SNAPSHOT_ORDER[0], CollectorKind::Heap);
    }

    #[test]
    fn test_name_aliases() {
        assert_eq!(CollectorKind::from_name("live-stacks"), Some(CollectorKind::LiveStacks));
        assert_eq!(CollectorKind::from_name(" MUTEX "), Some(CollectorKind::LockContention));
        assert_eq!(CollectorKind::from_name("trace"), None);
    }

    #[test]
    fn test_kind_from_artifact_name() {
        for kind in CollectorKind::ALL {
            assert_eq!(CollectorKind::from_artifact_name(&kind.artifact_name()), Some(kind));
        }
        assert_eq!(CollectorKind::from_artifact_name("manifest.json"), None);
        assert_eq!(CollectorKind::from_artifact_name("blocking.prof"), None);
    }

    #[test]
    fn test_rates_only_for_sampled_kinds() {
        assert!(CollectorKind::Heap.takes_rate());
        assert!(CollectorKind::Blocking.takes_rate());
        assert!(CollectorKind::LockContention.takes_rate());
        assert!(!CollectorKind::Cpu.takes_rate());
        assert!(!CollectorKind::Allocations.takes_rate());
    }
}
