//! Run supervision: spawns the target and sequences collectors around it.
//!
//! ```text
//!  Idle ──(resolve executable)──► Armed ──(start cpu, spawn)──► Running
//!   │                                          │                  │
//!   │ not found                                │ spawn error      │ child reaped
//!   ▼                                          ▼                  ▼
//! Failed ◄─────────────────────────────── (stop started)      Draining
//!                                                                 │ stop, snapshots
//!                                                                 ▼
//!                                                               Done
//! ```
//!
//! Nothing is written to the output directory before the child has been
//! reaped, except the temporary file an active continuous collector holds
//! open.

mod command;
mod manifest;

pub use command::{SpawnError, StdioMode, Target, resolve_program};
pub use manifest::{ChildEntry, CollectorEntry, MANIFEST_NAME, Manifest};

use crate::collector::{
    ArtifactSink, Collector, CollectorError, CollectorFactory, CollectorKind, ContinuousCollector,
    ProcfsFactory, SnapshotCollector,
};
use crate::config::CollectionPlan;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Exit code reported when the child could not be started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Offset added to a terminating signal number.
const SIGNAL_EXIT_BASE: i32 = 128;

/// Exit code reported when the child ran but its status could not be read.
pub const UNKNOWN_STATUS_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Armed,
    Running,
    Draining,
    Done,
    Failed,
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
    /// The child was started but waiting for it failed.
    Unknown,
}

impl ChildOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ChildOutcome::Exited(code) => code,
            ChildOutcome::Signaled(signal) => SIGNAL_EXIT_BASE + signal,
            ChildOutcome::Unknown => UNKNOWN_STATUS_EXIT_CODE,
        }
    }

    fn from_wait(pid: u32, waited: io::Result<ExitStatus>) -> Self {
        match waited {
            Ok(status) => ChildOutcome::from_status(status),
            Err(e) => {
                error!(pid, error = %e, "waiting for child failed");
                ChildOutcome::Unknown
            }
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildOutcome::Signaled(signal);
            }
        }
        ChildOutcome::Exited(status.code().unwrap_or(1))
    }
}

/// Result of one collector for the run.
pub type CollectorReport = (CollectorKind, Result<(), CollectorError>);

/// Final result of a supervised run.
#[derive(Debug)]
pub struct ExitOutcome {
    pub child: Result<ChildOutcome, SpawnError>,
    /// One entry per collector that was built, in the order its terminal
    /// operation ran.
    pub reports: Vec<CollectorReport>,
}

impl ExitOutcome {
    /// Process exit code to propagate.
    pub fn exit_code(&self) -> i32 {
        match &self.child {
            Ok(outcome) => outcome.exit_code(),
            Err(_) => SPAWN_FAILURE_EXIT_CODE,
        }
    }

    pub fn spawn_failed(&self) -> bool {
        self.child.is_err()
    }

    pub fn failures(&self) -> impl Iterator<Item = (CollectorKind, &CollectorError)> {
        self.reports
            .iter()
            .filter_map(|(kind, result)| result.as_ref().err().map(|e| (*kind, e)))
    }

    pub fn report(&self, kind: CollectorKind) -> Option<&Result<(), CollectorError>> {
        self.reports
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, result)| result)
    }
}

struct Started {
    kind: CollectorKind,
    collector: Box<dyn ContinuousCollector>,
}

/// Owns the collectors and the child for exactly one run.
pub struct Supervisor {
    plan: CollectionPlan,
    factory: Box<dyn CollectorFactory>,
    state: RunState,
}

impl Supervisor {
    /// Supervisor using the procfs and jemalloc backed collectors.
    pub fn new(plan: CollectionPlan) -> Self {
        let factory = ProcfsFactory::for_plan(&plan);
        Self::with_factory(plan, Box::new(factory))
    }

    pub fn with_factory(plan: CollectionPlan, factory: Box<dyn CollectorFactory>) -> Self {
        Self {
            plan,
            factory,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn plan(&self) -> &CollectionPlan {
        &self.plan
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "supervisor state");
        self.state = next;
    }

    /// Runs `target` to completion.
    pub fn run(&mut self, target: &Target) -> ExitOutcome {
        let program = match resolve_program(target.program()) {
            Ok(program) => program,
            Err(e) => {
                error!(program = %target.program().to_string_lossy(), error = %e, "cannot start program");
                self.transition(RunState::Failed);
                return ExitOutcome {
                    child: Err(e),
                    reports: Vec::new(),
                };
            }
        };

        let output_dir = self
            .plan
            .output_dir()
            .filter(|_| self.plan.is_active())
            .map(Path::to_path_buf);

        let (continuous, snapshots) = match &output_dir {
            Some(dir) => self.arm(dir),
            None => (Vec::new(), Vec::new()),
        };

        let mut reports = Vec::new();
        let mut started = Vec::new();
        if let Some(dir) = &output_dir {
            for (kind, mut collector) in continuous {
                let sink = ArtifactSink::new(dir.join(kind.artifact_name()));
                match collector.start(&sink) {
                    Ok(()) => started.push(Started { kind, collector }),
                    Err(e) => {
                        warn!(collector = %kind, error = %e, "collector failed to start");
                        reports.push((kind, Err(e)));
                    }
                }
            }
        }

        let run_started = Instant::now();
        let child = match command::spawn(target, &program) {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program.display(), error = %e, "spawn failed");
                stop_all(&mut started, &mut reports);
                let child = Err(e);
                self.finish(output_dir.as_deref(), target, &child, &reports);
                self.transition(RunState::Failed);
                return ExitOutcome { child, reports };
            }
        };
        let pid = child.id();
        for entry in &mut started {
            entry.collector.attach(pid);
        }
        self.transition(RunState::Running);
        info!(pid, program = %program.display(), "child started");

        let child = Ok(ChildOutcome::from_wait(pid, child.wait()));
        info!(
            pid,
            outcome = ?child,
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "child finished"
        );

        self.transition(RunState::Draining);
        stop_all(&mut started, &mut reports);
        if let Some(dir) = &output_dir {
            for (kind, mut collector) in snapshots {
                let sink = ArtifactSink::new(dir.join(kind.artifact_name()));
                let result = collector.snapshot(&sink);
                match &result {
                    Ok(()) => debug!(collector = %kind, "snapshot written"),
                    Err(e) => warn!(collector = %kind, error = %e, "snapshot failed"),
                }
                reports.push((kind, result));
            }
        }

        self.finish(output_dir.as_deref(), target, &child, &reports);
        self.transition(RunState::Done);
        ExitOutcome { child, reports }
    }

    /// Idle → Armed: clean stale artifacts, build collectors, apply process-wide knobs.
    #[allow(clippy::type_complexity)]
    fn arm(
        &mut self,
        dir: &Path,
    ) -> (
        Vec<(CollectorKind, Box<dyn ContinuousCollector>)>,
        Vec<(CollectorKind, Box<dyn SnapshotCollector>)>,
    ) {
        if self.plan.clean_stale() {
            clean_stale(dir);
        }

        let mut continuous = Vec::new();
        let mut snapshots = Vec::new();
        let kinds = self
            .plan
            .continuous_kinds()
            .into_iter()
            .chain(self.plan.snapshot_kinds());
        for kind in kinds {
            match self.factory.build(kind, self.plan.rate(kind)) {
                Collector::Continuous(c) => continuous.push((kind, c)),
                Collector::Snapshot(c) => snapshots.push((kind, c)),
            }
        }
        self.factory.arm(&self.plan);

        info!(
            dir = %dir.display(),
            collectors = ?self.plan.enabled(),
            "profiling armed"
        );
        self.transition(RunState::Armed);
        (continuous, snapshots)
    }

    fn finish(
        &self,
        dir: Option<&Path>,
        target: &Target,
        child: &Result<ChildOutcome, SpawnError>,
        reports: &[CollectorReport],
    ) {
        let Some(dir) = dir else {
            return;
        };
        let exit_code = match child {
            Ok(outcome) => outcome.exit_code(),
            Err(_) => SPAWN_FAILURE_EXIT_CODE,
        };
        let manifest = Manifest::build(dir, target, child, exit_code, reports);
        if let Err(e) = manifest.write(dir) {
            warn!(dir = %dir.display(), error = %e, "manifest not written");
        }
        let failed = reports.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            dir = %dir.display(),
            collectors = reports.len(),
            failed,
            "all data saved"
        );
    }
}

/// Stops started continuous collectors in reverse start order.
fn stop_all(started: &mut Vec<Started>, reports: &mut Vec<CollectorReport>) {
    while let Some(mut entry) = started.pop() {
        let result = entry.collector.stop();
        if let Err(e) = &result {
            warn!(collector = %entry.kind, error = %e, "collector failed to stop");
        }
        reports.push((entry.kind, result));
    }
}

/// Artifacts a previous run may have left behind.
fn stale_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = vec![dir.join(MANIFEST_NAME)];
    for kind in CollectorKind::ALL {
        let sink = ArtifactSink::new(dir.join(kind.artifact_name()));
        files.push(sink.tmp_path());
        files.push(sink.path().to_path_buf());
    }
    files
}

fn clean_stale(dir: &Path) {
    for path in stale_files(dir) {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale artifact"),
        }
    }
}

/// Runs `target` under `plan` with the default collectors.
pub fn supervise(plan: CollectionPlan, target: &Target) -> ExitOutcome {
    Supervisor::new(plan).run(target)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collector::allocator::testing::FixedProbe;
    use crate::collector::mock::MockFs;
    use crate::config::{
        CLEAN, CPU_DURATION, ENABLE_BLOCK, ENABLE_CPU, ENABLE_HEAP, ENABLE_MUTEX, OUTPUT_DIR,
        PROFILES, Settings, resolve,
    };
    use crate::profile::read_artifact;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Collectors that only record the calls they receive.
    struct RecordingFactory {
        log: Log,
        /// Touched by the child right before it exits.
        marker: Option<PathBuf>,
    }

    struct RecordingContinuous {
        kind: CollectorKind,
        log: Log,
        marker: Option<PathBuf>,
        running: bool,
    }

    impl ContinuousCollector for RecordingContinuous {
        fn kind(&self) -> CollectorKind {
            self.kind
        }

        fn start(&mut self, _sink: &ArtifactSink) -> Result<(), CollectorError> {
            self.log.push(format!("start {}", self.kind));
            self.running = true;
            Ok(())
        }

        fn attach(&mut self, _pid: u32) {
            self.log.push(format!("attach {}", self.kind));
        }

        fn stop(&mut self) -> Result<(), CollectorError> {
            if std::mem::replace(&mut self.running, false) {
                let child_done = self.marker.as_ref().is_some_and(|m| m.exists());
                self.log
                    .push(format!("stop {} child_done={}", self.kind, child_done));
            }
            Ok(())
        }
    }

    struct RecordingSnapshot {
        kind: CollectorKind,
        log: Log,
    }

    impl SnapshotCollector for RecordingSnapshot {
        fn kind(&self) -> CollectorKind {
            self.kind
        }

        fn snapshot(&mut self, _sink: &ArtifactSink) -> Result<(), CollectorError> {
            self.log.push(format!("snapshot {}", self.kind));
            Ok(())
        }
    }

    impl CollectorFactory for RecordingFactory {
        fn build(&self, kind: CollectorKind, _rate: Option<u64>) -> Collector {
            self.log.push(format!("build {}", kind));
            if kind.is_continuous() {
                Collector::Continuous(Box::new(RecordingContinuous {
                    kind,
                    log: self.log.clone(),
                    marker: self.marker.clone(),
                    running: false,
                }))
            } else {
                Collector::Snapshot(Box::new(RecordingSnapshot {
                    kind,
                    log: self.log.clone(),
                }))
            }
        }

        fn arm(&self, _plan: &CollectionPlan) {
            self.log.push("arm".to_string());
        }
    }

    fn recording(plan: CollectionPlan, marker: Option<PathBuf>) -> (Supervisor, Log) {
        let log = Log::default();
        let factory = RecordingFactory {
            log: log.clone(),
            marker,
        };
        (Supervisor::with_factory(plan, Box::new(factory)), log)
    }

    fn settings_for(dir: &Path) -> Settings {
        Settings::new().with(OUTPUT_DIR, dir.to_string_lossy())
    }

    fn sh(script: &str) -> Target {
        Target::new("sh", ["-c", script])
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_collector_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("child-done");
        let plan = resolve(
            &settings_for(dir.path())
                .with(ENABLE_CPU, "1")
                .with(ENABLE_HEAP, "1")
                .with(ENABLE_BLOCK, "1")
                .with(ENABLE_MUTEX, "1"),
        )
        .unwrap();
        let (mut supervisor, log) = recording(plan, Some(marker.clone()));

        let target = Target::new("sh", ["-c".into(), ": > \"$0\"".into(), marker.into_os_string()]);
        let outcome = supervisor.run(&target);

        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(supervisor.state(), RunState::Done);
        assert_eq!(
            log.entries(),
            vec![
                "build cpu",
                "build heap",
                "build block",
                "build mutex",
                "arm",
                "start cpu",
                "attach cpu",
                "stop cpu child_done=true",
                "snapshot heap",
                "snapshot block",
                "snapshot mutex",
            ]
        );
        let kinds: Vec<CollectorKind> = outcome.reports.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                CollectorKind::Cpu,
                CollectorKind::Heap,
                CollectorKind::Blocking,
                CollectorKind::LockContention,
            ]
        );
        assert_eq!(outcome.failures().count(), 0);

        let manifest = Manifest::read(dir.path()).unwrap();
        assert_eq!(manifest.child, ChildEntry::Exited { code: 0 });
        assert_eq!(manifest.collectors.len(), 4);
    }

    #[test]
    fn test_disabled_plan_passes_exit_code_through() {
        let dir = tempfile::tempdir().unwrap();

        // No output directory at all.
        let plan = resolve(&Settings::new().with(ENABLE_CPU, "1")).unwrap();
        let (mut supervisor, log) = recording(plan, None);
        let outcome = supervisor.run(&sh("exit 3"));
        assert_eq!(outcome.exit_code(), 3);
        assert!(outcome.reports.is_empty());
        assert!(log.entries().is_empty());

        // An output directory but nothing enabled.
        let plan = resolve(&settings_for(dir.path())).unwrap();
        let (mut supervisor, log) = recording(plan, None);
        assert_eq!(supervisor.run(&sh("exit 3")).exit_code(), 3);
        assert!(log.entries().is_empty());
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_program_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cpu.prof"), b"previous run").unwrap();
        let plan = resolve(&settings_for(dir.path()).with(PROFILES, "cpu,heap")).unwrap();
        let (mut supervisor, log) = recording(plan, None);

        let outcome = supervisor.run(&Target::new("profwrap-no-such-program-4711", ["x"]));
        assert!(matches!(outcome.child, Err(SpawnError::NotFound(_))));
        assert!(outcome.spawn_failed());
        assert_eq!(outcome.exit_code(), SPAWN_FAILURE_EXIT_CODE);
        assert_eq!(supervisor.state(), RunState::Failed);
        assert!(outcome.reports.is_empty());
        assert!(log.entries().is_empty());
        assert_eq!(dir_entries(dir.path()), vec!["cpu.prof"]);
    }

    #[test]
    fn test_spawn_failure_stops_started_collectors() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let broken = bin.path().join("broken");
        fs::write(&broken, "#!/nonexistent/interpreter\n").unwrap();
        fs::set_permissions(&broken, fs::Permissions::from_mode(0o755)).unwrap();

        let plan = resolve(&settings_for(dir.path()).with(ENABLE_CPU, "1")).unwrap();
        let (mut supervisor, log) = recording(plan, None);
        let outcome = supervisor.run(&Target::new(broken.as_os_str(), Vec::<String>::new()));

        assert!(matches!(outcome.child, Err(SpawnError::Io(_))));
        assert_eq!(outcome.exit_code(), 127);
        assert_eq!(
            log.entries(),
            vec!["build cpu", "arm", "start cpu", "stop cpu child_done=false"]
        );
        let manifest = Manifest::read(dir.path()).unwrap();
        assert!(matches!(manifest.child, ChildEntry::NotStarted { .. }));
    }

    #[test]
    fn test_failed_wait_is_unknown_not_a_spawn_failure() {
        let outcome = ChildOutcome::from_wait(42, Err(io::Error::other("ECHILD")));
        assert_eq!(outcome, ChildOutcome::Unknown);
        assert_eq!(outcome.exit_code(), UNKNOWN_STATUS_EXIT_CODE);

        let run = ExitOutcome {
            child: Ok(outcome),
            reports: Vec::new(),
        };
        assert!(!run.spawn_failed());
        assert_ne!(run.exit_code(), SPAWN_FAILURE_EXIT_CODE);
    }

    #[test]
    fn test_signal_exit_code() {
        let (mut supervisor, _) = recording(CollectionPlan::disabled(), None);
        let outcome = supervisor.run(&sh("kill -TERM $$"));
        assert_eq!(outcome.child.as_ref().ok(), Some(&ChildOutcome::Signaled(15)));
        assert_eq!(outcome.exit_code(), 143);
    }

    #[test]
    fn test_failing_heap_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let plan = resolve(
            &settings_for(dir.path())
                .with(ENABLE_HEAP, "true")
                .with(ENABLE_BLOCK, "true")
                .with(CLEAN, "false"),
        )
        .unwrap();
        // A directory squatting on the temporary path makes the heap sink unopenable.
        fs::create_dir(dir.path().join("heap.prof.tmp")).unwrap();

        let factory = ProcfsFactory::new(
            MockFs::supervisor_process(),
            "/proc",
            Arc::new(FixedProbe::default()),
            &plan,
        );
        let mut supervisor = Supervisor::with_factory(plan, Box::new(factory));
        let outcome = supervisor.run(&sh("exit 0"));

        assert_eq!(outcome.exit_code(), 0);
        assert!(matches!(
            outcome.report(CollectorKind::Heap),
            Some(Err(CollectorError::SinkUnavailable { .. }))
        ));
        assert!(matches!(outcome.report(CollectorKind::Blocking), Some(Ok(()))));
        assert_eq!(outcome.failures().count(), 1);
        assert!(!dir.path().join("heap.prof").exists());
        assert_eq!(
            read_artifact(&dir.path().join("block.prof")).unwrap().kind,
            CollectorKind::Blocking
        );

        let manifest = Manifest::read(dir.path()).unwrap();
        let heap = &manifest.collectors[0];
        assert_eq!(heap.kind, CollectorKind::Heap);
        assert!(!heap.ok);
    }

    #[test]
    fn test_clean_removes_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("mutex.prof"), b"stale").unwrap();
        fs::write(dir.path().join("cpu.prof.tmp"), b"stale").unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        let plan = resolve(&settings_for(dir.path()).with(ENABLE_BLOCK, "1")).unwrap();
        let (mut supervisor, _) = recording(plan, None);
        supervisor.run(&sh("exit 0"));

        assert_eq!(dir_entries(dir.path()), vec!["manifest.json", "notes.txt"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cpu_deadline_self_stops() {
        let dir = tempfile::tempdir().unwrap();
        let plan = resolve(
            &settings_for(dir.path())
                .with(ENABLE_CPU, "1")
                .with(CPU_DURATION, "0.5"),
        )
        .unwrap();
        assert_eq!(plan.cpu_duration(), Some(Duration::from_millis(500)));

        let outcome = supervise(plan, &sh("sleep 2"));
        assert_eq!(outcome.exit_code(), 0);
        assert!(matches!(outcome.report(CollectorKind::Cpu), Some(Ok(()))));

        let cpu = dir.path().join("cpu.prof");
        assert!(fs::metadata(&cpu).unwrap().len() > 0);

        // Readable by any pprof tool: gzip around a perftools.profiles message.
        {
            use prost::Message;
            use std::io::Read;

            let mut raw = Vec::new();
            flate2::read::GzDecoder::new(fs::File::open(&cpu).unwrap())
                .read_to_end(&mut raw)
                .unwrap();
            let message = crate::profile::proto::Profile::decode(raw.as_slice()).unwrap();
            assert_eq!(message.string_table[0], "");
            let sample_type = message.sample_type.last().copied().unwrap();
            assert_eq!(message.period_type, Some(sample_type));
            assert!(message.period > 0);
        }

        let profile = read_artifact(&cpu).unwrap();
        assert!(profile.comment_texts().contains(&"stop: deadline"));
        assert!(profile.duration_nanos < Duration::from_millis(1500).as_nanos() as i64);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshots_are_written_after_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let plan = resolve(&settings_for(dir.path()).with(PROFILES, "cpu,goroutine,block")).unwrap();

        let outcome = supervise(plan, &sh("exit 0"));
        assert_eq!(outcome.failures().count(), 0);

        let mtime = |name: &str| fs::metadata(dir.path().join(name)).unwrap().modified().unwrap();
        assert!(mtime("cpu.prof") <= mtime("goroutine.prof"));
        assert!(mtime("goroutine.prof") <= mtime("block.prof"));
    }
}
