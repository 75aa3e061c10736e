//! Readers for the Linux `/proc` filesystem.
//!
//! `ProcReader` resolves per-process and per-thread files for a [`ProcTarget`]
//! and hands their contents to the pure parsers in [`parser`].

pub mod parser;

use crate::collector::traits::FileSystem;
use parser::{ProcStat, ProcStatus, SchedStat, parse_children, parse_proc_stat, parse_proc_status};
use parser::{parse_schedstat, parse_wchan};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub use parser::ParseError;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
pub const CLK_TCK: u64 = 100;

/// Upper bound on process-tree depth walked through `children` files.
const MAX_TREE_DEPTH: usize = 32;

/// Error type for collection failures.
#[derive(Debug)]
pub enum CollectError {
    /// Process disappeared during collection.
    ProcessGone(String),
    /// I/O error reading process files.
    Io(std::io::Error),
    /// Parse error in process files.
    Parse(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::ProcessGone(who) => write!(f, "process {} disappeared", who),
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl From<ParseError> for CollectError {
    fn from(e: ParseError) -> Self {
        CollectError::Parse(e.to_string())
    }
}

/// Which process a reader looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcTarget {
    /// The calling process (`/proc/self`).
    Current,
    Pid(u32),
}

impl ProcTarget {
    fn dir_name(self) -> String {
        match self {
            ProcTarget::Current => "self".to_string(),
            ProcTarget::Pid(pid) => pid.to_string(),
        }
    }
}

impl std::fmt::Display for ProcTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Per-thread figures read from `/proc/[pid]/task/[tid]/`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInfo {
    pub tid: u32,
    pub stat: ProcStat,
    /// Absent when the kernel lacks schedstats.
    pub sched: Option<SchedStat>,
    /// Absent when the thread vanished between reads.
    pub status: Option<ProcStatus>,
    pub wchan: Option<String>,
}

/// Reads process and thread information below a proc mount.
#[derive(Debug, Clone)]
pub struct ProcReader<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> ProcReader<F> {
    /// Creates a new reader.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    fn process_dir(&self, target: ProcTarget) -> PathBuf {
        Path::new(&self.proc_path).join(target.dir_name())
    }

    fn read(&self, path: &Path, target: ProcTarget) -> Result<String, CollectError> {
        self.fs
            .read_to_string(path)
            .map_err(|_| CollectError::ProcessGone(target.to_string()))
    }

    /// Reads `/proc/[pid]/stat`.
    pub fn process_stat(&self, target: ProcTarget) -> Result<ProcStat, CollectError> {
        let content = self.read(&self.process_dir(target).join("stat"), target)?;
        Ok(parse_proc_stat(&content)?)
    }

    /// Reads `/proc/[pid]/status`.
    pub fn process_status(&self, target: ProcTarget) -> Result<ProcStatus, CollectError> {
        let content = self.read(&self.process_dir(target).join("status"), target)?;
        Ok(parse_proc_status(&content)?)
    }

    /// Lists thread ids from `/proc/[pid]/task`, sorted ascending.
    pub fn task_ids(&self, target: ProcTarget) -> Result<Vec<u32>, CollectError> {
        let task_dir = self.process_dir(target).join("task");
        let entries = self
            .fs
            .read_dir(&task_dir)
            .map_err(|_| CollectError::ProcessGone(target.to_string()))?;
        let mut tids: Vec<u32> = entries
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.parse().ok())
            .collect();
        tids.sort_unstable();
        Ok(tids)
    }

    /// Reads the `stat` file of every thread. Threads that exit mid-read are skipped.
    pub fn task_stats(&self, target: ProcTarget) -> Result<Vec<ProcStat>, CollectError> {
        let task_dir = self.process_dir(target).join("task");
        let stats = self
            .task_ids(target)?
            .into_iter()
            .filter_map(|tid| {
                let content = self
                    .fs
                    .read_to_string(&task_dir.join(tid.to_string()).join("stat"))
                    .ok()?;
                parse_proc_stat(&content).ok()
            })
            .collect();
        Ok(stats)
    }

    /// Reads everything known about every thread of `target`.
    ///
    /// Threads whose `stat` cannot be read are skipped; the optional files
    /// are left empty when unreadable.
    pub fn tasks(&self, target: ProcTarget) -> Result<Vec<TaskInfo>, CollectError> {
        let task_dir = self.process_dir(target).join("task");
        let mut tasks = Vec::new();
        for tid in self.task_ids(target)? {
            let dir = task_dir.join(tid.to_string());
            let Some(stat) = self
                .fs
                .read_to_string(&dir.join("stat"))
                .ok()
                .and_then(|c| parse_proc_stat(&c).ok())
            else {
                continue;
            };
            let sched = self
                .fs
                .read_to_string(&dir.join("schedstat"))
                .ok()
                .and_then(|c| parse_schedstat(&c).ok());
            let status = self
                .fs
                .read_to_string(&dir.join("status"))
                .ok()
                .and_then(|c| parse_proc_status(&c).ok());
            let wchan = self
                .fs
                .read_to_string(&dir.join("wchan"))
                .ok()
                .and_then(|c| parse_wchan(&c));
            tasks.push(TaskInfo {
                tid,
                stat,
                sched,
                status,
                wchan,
            });
        }
        Ok(tasks)
    }

    /// Returns `root` followed by all of its live descendants, found through
    /// the per-thread `children` files. Order is breadth-first.
    pub fn process_tree(&self, root: u32) -> Vec<u32> {
        let mut seen = HashSet::from([root]);
        let mut tree = vec![root];
        let mut frontier = vec![root];

        for _ in 0..MAX_TREE_DEPTH {
            let mut next = Vec::new();
            for pid in frontier {
                let target = ProcTarget::Pid(pid);
                let task_dir = self.process_dir(target).join("task");
                let Ok(tids) = self.task_ids(target) else {
                    continue;
                };
                for tid in tids {
                    let Ok(content) = self
                        .fs
                        .read_to_string(&task_dir.join(tid.to_string()).join("children"))
                    else {
                        continue;
                    };
                    for child in parse_children(&content) {
                        if seen.insert(child) {
                            tree.push(child);
                            next.push(child);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        tree
    }
}
