//! The supervised command: executable resolution, spawning and stream relays.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Why the child never ran.
#[derive(Debug)]
pub enum SpawnError {
    /// No program was given.
    EmptyCommand,
    /// The program was not found on disk or in `PATH`.
    NotFound(OsString),
    /// The program exists but lacks the executable bit.
    NotExecutable(PathBuf),
    /// The OS refused to start the program.
    Io(io::Error),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "no program to run"),
            SpawnError::NotFound(program) => {
                write!(f, "program not found: {}", program.to_string_lossy())
            }
            SpawnError::NotExecutable(path) => write!(f, "not executable: {}", path.display()),
            SpawnError::Io(e) => write!(f, "spawn failed: {}", e),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SpawnError {
    fn from(e: io::Error) -> Self {
        SpawnError::Io(e)
    }
}

/// How the child's stdout and stderr reach the terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// The child writes directly to the supervisor's descriptors.
    #[default]
    Inherit,
    /// Piped and copied by relay threads that are joined before draining.
    Relay,
}

/// Program and arguments to supervise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    program: OsString,
    args: Vec<OsString>,
    stdio: StdioMode,
}

impl Target {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdio: StdioMode::Inherit,
        }
    }

    /// Splits `argv`-style input into program and arguments.
    pub fn from_argv<I, A>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next()?;
        Some(Self::new(program, argv))
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn stdio(&self) -> StdioMode {
        self.stdio
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolves `program` the way `execvp` would: as a path when it contains a
/// separator, otherwise through the `PATH` entries.
pub fn resolve_program(program: &OsStr) -> Result<PathBuf, SpawnError> {
    if program.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let as_path = Path::new(program);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        if !as_path.exists() {
            return Err(SpawnError::NotFound(program.to_owned()));
        }
        if !is_executable(as_path) {
            return Err(SpawnError::NotExecutable(as_path.to_path_buf()));
        }
        return Ok(as_path.to_path_buf());
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| SpawnError::NotFound(program.to_owned()))
}

/// A spawned child plus the threads relaying its output.
pub(crate) struct RunningChild {
    child: Child,
    relays: Vec<RelayHandle>,
}

impl RunningChild {
    pub(crate) fn id(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the child to terminate, then for its output to drain.
    pub(crate) fn wait(mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        for relay in self.relays {
            let name = relay.thread().name().unwrap_or("relay").to_string();
            match relay.join() {
                Ok(Ok(bytes)) => debug!(relay = %name, bytes, "relay drained"),
                Ok(Err(e)) => warn!(relay = %name, error = %e, "relay failed"),
                Err(_) => warn!(relay = %name, "relay thread panicked"),
            }
        }
        Ok(status)
    }
}

type RelayHandle = JoinHandle<io::Result<u64>>;

fn relay<R, W>(name: &str, mut from: R, mut to: W) -> io::Result<RelayHandle>
where
    R: io::Read + Send + 'static,
    W: io::Write + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let copied = io::copy(&mut from, &mut to)?;
            to.flush()?;
            Ok(copied)
        })
}

/// Builds the command for the resolved program. Stdin is always inherited,
/// and the child sees the program name as given rather than its resolved path.
fn command(target: &Target, program: &Path) -> Command {
    let mut command = Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.arg0(target.program());
    }
    command.args(&target.args).stdin(Stdio::inherit());
    match target.stdio {
        StdioMode::Inherit => {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        StdioMode::Relay => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }
    command
}

/// Starts a relay for each piped stream of `child`. If one cannot start, the
/// child is killed and reaped along with the relays already running.
fn attach_relays<S>(mut child: Child, mut start: S) -> Result<RunningChild, SpawnError>
where
    S: FnMut(
        &str,
        Box<dyn io::Read + Send>,
        Box<dyn io::Write + Send>,
    ) -> io::Result<RelayHandle>,
{
    let mut pipes: Vec<(&str, Box<dyn io::Read + Send>, Box<dyn io::Write + Send>)> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pipes.push(("relay-stdout", Box::new(stdout), Box::new(io::stdout())));
    }
    if let Some(stderr) = child.stderr.take() {
        pipes.push(("relay-stderr", Box::new(stderr), Box::new(io::stderr())));
    }

    let mut running = RunningChild {
        child,
        relays: Vec::with_capacity(pipes.len()),
    };
    for (name, from, to) in pipes {
        match start(name, from, to) {
            Ok(handle) => running.relays.push(handle),
            Err(e) => return Err(abandon(running, e)),
        }
    }
    Ok(running)
}

fn abandon(mut running: RunningChild, cause: io::Error) -> SpawnError {
    let pid = running.id();
    warn!(pid, error = %cause, "cannot relay child output, killing child");
    if let Err(e) = running.child.kill() {
        warn!(pid, error = %e, "failed to kill child");
    }
    if let Err(e) = running.wait() {
        warn!(pid, error = %e, "failed to reap child");
    }
    SpawnError::Io(cause)
}

/// Spawns the resolved program.
pub(crate) fn spawn(target: &Target, program: &Path) -> Result<RunningChild, SpawnError> {
    let child = command(target, program).spawn()?;
    attach_relays(child, |name, from, to| relay(name, from, to))
}
