//! Per-thread snapshots of the supervisor read from `/proc/self/task`.
//!
//! All three run after the child has been reaped and describe the threads
//! that drove the run: where they are parked, how long they queued for a CPU
//! and how often they were preempted.

use crate::collector::procfs::{ProcReader, ProcTarget, TaskInfo};
use crate::collector::sink::ArtifactSink;
use crate::collector::traits::FileSystem;
use crate::collector::{CollectorError, CollectorKind, SnapshotCollector, capture};
use crate::profile::Profile;

fn process_name<F: FileSystem>(reader: &ProcReader<F>) -> String {
    reader
        .process_stat(ProcTarget::Current)
        .map(|stat| stat.comm)
        .unwrap_or_else(|_| "self".to_string())
}

fn read_tasks<F: FileSystem>(reader: &ProcReader<F>) -> Result<(String, Vec<TaskInfo>), CollectorError> {
    let tasks = reader.tasks(ProcTarget::Current)?;
    Ok((process_name(reader), tasks))
}

/// One sample per live thread, with its kernel wait channel as leaf frame.
pub struct LiveStacksSnapshot<F: FileSystem> {
    reader: ProcReader<F>,
}

impl<F: FileSystem> LiveStacksSnapshot<F> {
    pub fn new(reader: ProcReader<F>) -> Self {
        Self { reader }
    }

    fn build(&self) -> Result<Profile, CollectorError> {
        let (process, tasks) = read_tasks(&self.reader)?;
        let mut profile = Profile::new(CollectorKind::LiveStacks, &[("threads", "count")], 0);
        for task in &tasks {
            let leaf = match &task.wchan {
                Some(symbol) => symbol.clone(),
                None if task.stat.state == 'R' => "running".to_string(),
                None => format!("state {}", task.stat.state),
            };
            let tid = task.tid.to_string();
            let state = task.stat.state.to_string();
            let processor = task.stat.processor.to_string();
            profile.add_sample(
                &[process.as_str(), task.stat.comm.as_str(), leaf.as_str()],
                &[1],
                &[
                    ("tid", tid.as_str()),
                    ("state", state.as_str()),
                    ("cpu", processor.as_str()),
                ],
            );
        }
        Ok(profile)
    }
}

impl<F: FileSystem> SnapshotCollector for LiveStacksSnapshot<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::LiveStacks
    }

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        capture(sink, || self.build())
    }
}

/// Run-queue wait per thread. `rate` is the nanoseconds of waiting that
/// count as one blocking event.
pub struct BlockSnapshot<F: FileSystem> {
    reader: ProcReader<F>,
    rate: u64,
}

impl<F: FileSystem> BlockSnapshot<F> {
    pub fn new(reader: ProcReader<F>, rate: u64) -> Self {
        Self {
            reader,
            rate: rate.max(1),
        }
    }

    fn build(&self) -> Result<Profile, CollectorError> {
        let (process, tasks) = read_tasks(&self.reader)?;
        let mut profile = Profile::new(
            CollectorKind::Blocking,
            &[("contentions", "count"), ("delay", "nanoseconds")],
            self.rate,
        );
        for task in &tasks {
            let Some(sched) = task.sched else {
                continue;
            };
            if sched.wait_ns == 0 {
                continue;
            }
            let blkio = task.stat.delayacct_blkio_ticks.to_string();
            profile.add_sample(
                &[process.as_str(), task.stat.comm.as_str()],
                &[(sched.wait_ns / self.rate) as i64, sched.wait_ns as i64],
                &[("blkio_ticks", blkio.as_str())],
            );
        }
        Ok(profile)
    }
}

impl<F: FileSystem> SnapshotCollector for BlockSnapshot<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Blocking
    }

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        capture(sink, || self.build())
    }
}

/// Involuntary context switches per thread, thinned by `fraction`.
pub struct MutexSnapshot<F: FileSystem> {
    reader: ProcReader<F>,
    fraction: u64,
}

impl<F: FileSystem> MutexSnapshot<F> {
    pub fn new(reader: ProcReader<F>, fraction: u64) -> Self {
        Self {
            reader,
            fraction: fraction.max(1),
        }
    }

    fn build(&self) -> Result<Profile, CollectorError> {
        let (process, tasks) = read_tasks(&self.reader)?;
        let mut profile = Profile::new(
            CollectorKind::LockContention,
            &[("contentions", "count")],
            self.fraction,
        );
        for task in &tasks {
            let switches = task
                .status
                .as_ref()
                .map_or(0, |s| s.nonvoluntary_ctxt_switches);
            let events = switches / self.fraction;
            if events == 0 {
                continue;
            }
            profile.add_sample(
                &[process.as_str(), task.stat.comm.as_str()],
                &[events as i64],
                &[],
            );
        }
        Ok(profile)
    }
}

impl<F: FileSystem> SnapshotCollector for MutexSnapshot<F> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::LockContention
    }

    fn snapshot(&mut self, sink: &ArtifactSink) -> Result<(), CollectorError> {
        capture(sink, || self.build())
    }
}
