//! Text parsers for the handful of `/proc` files the collectors read.
//!
//! Each parser takes the file content and nothing else, so tests feed them
//! literal strings.

use std::fmt;
use std::str::FromStr;

/// A `/proc` file whose content did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The overall layout is wrong (missing `comm` parentheses, too few columns).
    Layout { file: &'static str, detail: String },
    /// A required field is absent or not a number.
    Field {
        file: &'static str,
        field: &'static str,
    },
}

impl ParseError {
    fn layout(file: &'static str, detail: impl Into<String>) -> Self {
        ParseError::Layout {
            file,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Layout { file, detail } => write!(f, "{}: {}", file, detail),
            ParseError::Field { file, field } => write!(f, "{}: bad field {}", file, field),
        }
    }
}

impl std::error::Error for ParseError {}

/// Scheduler-facing counters from `/proc/<pid>/stat` (or a task's `stat`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub minflt: u64,
    pub cminflt: u64,
    pub majflt: u64,
    pub cmajflt: u64,
    /// User time in clock ticks.
    pub utime: u64,
    /// System time in clock ticks.
    pub stime: u64,
    pub num_threads: i32,
    /// CPU the task last ran on.
    pub processor: i32,
    /// Aggregated block I/O delay in clock ticks.
    pub delayacct_blkio_ticks: u64,
}

impl ProcStat {
    /// User plus system time in clock ticks.
    pub fn cpu_ticks(&self) -> u64 {
        self.utime.saturating_add(self.stime)
    }
}

// Column positions counted from `state`, i.e. proc(5) field number minus 3.
const STAT_PPID: usize = 1;
const STAT_MINFLT: usize = 7;
const STAT_CMINFLT: usize = 8;
const STAT_MAJFLT: usize = 9;
const STAT_CMAJFLT: usize = 10;
const STAT_UTIME: usize = 11;
const STAT_STIME: usize = 12;
const STAT_NUM_THREADS: usize = 17;
const STAT_PROCESSOR: usize = 36;
const STAT_BLKIO_TICKS: usize = 39;

/// Columns that must be present for a line to count as a stat line.
const STAT_MIN_COLUMNS: usize = STAT_NUM_THREADS + 1;

/// Parses one `stat` line.
///
/// `comm` may itself contain spaces and parentheses, so it is taken as
/// everything between the first `(` and the last `)`. The trailing columns
/// (`processor`, `delayacct_blkio_ticks`) were added in later kernels and
/// read as zero when missing.
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    const FILE: &str = "stat";
    let line = content.trim();

    let (head, rest) = line
        .split_once('(')
        .ok_or_else(|| ParseError::layout(FILE, "no comm"))?;
    let (comm, tail) = rest
        .rsplit_once(')')
        .ok_or_else(|| ParseError::layout(FILE, "unterminated comm"))?;
    let pid = head.trim().parse::<u32>().map_err(|_| ParseError::Field {
        file: FILE,
        field: "pid",
    })?;

    let columns: Vec<&str> = tail.split_whitespace().collect();
    if columns.len() < STAT_MIN_COLUMNS {
        return Err(ParseError::layout(
            FILE,
            format!("{} columns after comm", columns.len()),
        ));
    }

    let number = |idx: usize, field: &'static str| -> Result<i64, ParseError> {
        columns[idx]
            .parse::<i64>()
            .map_err(|_| ParseError::Field { file: FILE, field })
    };
    let counter = |idx: usize, field: &'static str| -> Result<u64, ParseError> {
        columns[idx]
            .parse::<u64>()
            .map_err(|_| ParseError::Field { file: FILE, field })
    };

    Ok(ProcStat {
        pid,
        comm: comm.to_string(),
        state: columns[0].chars().next().unwrap_or('?'),
        ppid: u32::try_from(number(STAT_PPID, "ppid")?).unwrap_or(0),
        minflt: counter(STAT_MINFLT, "minflt")?,
        cminflt: counter(STAT_CMINFLT, "cminflt")?,
        majflt: counter(STAT_MAJFLT, "majflt")?,
        cmajflt: counter(STAT_CMAJFLT, "cmajflt")?,
        utime: counter(STAT_UTIME, "utime")?,
        stime: counter(STAT_STIME, "stime")?,
        num_threads: i32::try_from(number(STAT_NUM_THREADS, "num_threads")?).unwrap_or(0),
        processor: trailing_column(&columns, STAT_PROCESSOR),
        delayacct_blkio_ticks: trailing_column(&columns, STAT_BLKIO_TICKS),
    })
}

/// Reads a column newer kernels append, defaulting when absent or unparsable.
fn trailing_column<T: FromStr + Default>(columns: &[&str], idx: usize) -> T {
    columns
        .get(idx)
        .and_then(|c| c.parse().ok())
        .unwrap_or_default()
}

/// Memory and context-switch figures from `/proc/<pid>/status`.
/// Memory values are in kB as the kernel reports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcStatus {
    pub name: String,
    pub state: String,
    pub pid: u32,
    pub threads: u32,
    pub vm_peak: u64,
    pub vm_size: u64,
    pub vm_hwm: u64,
    pub vm_rss: u64,
    pub vm_data: u64,
    pub vm_stk: u64,
    pub vm_swap: u64,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
}

/// Parses `status`. Lines are `Key:<whitespace>value[ unit]`; unknown keys
/// are ignored and absent numeric keys stay zero. Only `Name` is required.
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let mut status = ProcStatus::default();
    let mut named = false;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let leading = || -> u64 {
            value
                .split_ascii_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0)
        };
        match key.trim() {
            "Name" => {
                status.name = value.to_string();
                named = true;
            }
            "State" => status.state = value.to_string(),
            "Pid" => status.pid = u32::try_from(leading()).unwrap_or(0),
            "Threads" => status.threads = u32::try_from(leading()).unwrap_or(0),
            "VmPeak" => status.vm_peak = leading(),
            "VmSize" => status.vm_size = leading(),
            "VmHWM" => status.vm_hwm = leading(),
            "VmRSS" => status.vm_rss = leading(),
            "VmData" => status.vm_data = leading(),
            "VmStk" => status.vm_stk = leading(),
            "VmSwap" => status.vm_swap = leading(),
            "voluntary_ctxt_switches" => status.voluntary_ctxt_switches = leading(),
            "nonvoluntary_ctxt_switches" => status.nonvoluntary_ctxt_switches = leading(),
            _ => {}
        }
    }

    if !named {
        return Err(ParseError::Field {
            file: "status",
            field: "Name",
        });
    }
    Ok(status)
}

/// Parsed data from `/proc/[pid]/task/[tid]/schedstat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStat {
    /// Time spent on the CPU (ns).
    pub run_ns: u64,
    /// Time spent waiting on a run queue (ns).
    pub wait_ns: u64,
    /// Number of timeslices run on this CPU.
    pub timeslices: u64,
}

/// Parses `schedstat` content: three space-separated counters.
pub fn parse_schedstat(content: &str) -> Result<SchedStat, ParseError> {
    let mut parts = content.split_whitespace();
    let mut next = |field: &'static str| -> Result<u64, ParseError> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(ParseError::Field {
                file: "schedstat",
                field,
            })
    };
    Ok(SchedStat {
        run_ns: next("run_ns")?,
        wait_ns: next("wait_ns")?,
        timeslices: next("timeslices")?,
    })
}

/// Parses `/proc/[pid]/task/[tid]/children`: space-separated child pids.
/// Unparseable entries are skipped.
pub fn parse_children(content: &str) -> Vec<u32> {
    content
        .split_whitespace()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Parses a `wchan` file. `0` and empty mean "not blocked in the kernel".
pub fn parse_wchan(content: &str) -> Option<String> {
    let symbol = content.trim();
    if symbol.is_empty() || symbol == "0" {
        None
    } else {
        Some(symbol.to_string())
    }
}
