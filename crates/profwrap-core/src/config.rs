//! Resolution of key/value settings into a `CollectionPlan`.
//!
//! Settings normally come from `PROFWRAP_*` environment variables, optionally
//! overlaid by command-line flags. Resolution is forgiving: unknown keys are
//! ignored, malformed numbers fall back to defaults with a warning, and a
//! missing output directory simply disables profiling so the wrapper acts as
//! a pass-through.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::collector::CollectorKind;

pub const OUTPUT_DIR: &str = "PROFWRAP_OUTPUT_DIR";
pub const PROFILES: &str = "PROFWRAP_PROFILES";
pub const ENABLE_CPU: &str = "PROFWRAP_ENABLE_CPU";
pub const ENABLE_HEAP: &str = "PROFWRAP_ENABLE_HEAP";
pub const ENABLE_GOROUTINE: &str = "PROFWRAP_ENABLE_GOROUTINE";
pub const ENABLE_BLOCK: &str = "PROFWRAP_ENABLE_BLOCK";
pub const ENABLE_MUTEX: &str = "PROFWRAP_ENABLE_MUTEX";
pub const ENABLE_ALLOCS: &str = "PROFWRAP_ENABLE_ALLOCS";
pub const CPU_DURATION: &str = "PROFWRAP_CPU_DURATION";
pub const CPU_HZ: &str = "PROFWRAP_CPU_HZ";
pub const MEM_RATE: &str = "PROFWRAP_MEM_RATE";
pub const BLOCK_RATE: &str = "PROFWRAP_BLOCK_RATE";
pub const MUTEX_FRACTION: &str = "PROFWRAP_MUTEX_FRACTION";
pub const CLEAN: &str = "PROFWRAP_CLEAN";

/// Prefix shared by every recognized key.
pub const PREFIX: &str = "PROFWRAP_";

/// Default CPU sampling frequency (samples per second).
pub const DEFAULT_CPU_HZ: u32 = 100;
/// Upper bound on CPU sampling frequency; procfs reads get expensive past this.
pub const MAX_CPU_HZ: u32 = 1000;

const ENABLE_KEYS: [(&str, CollectorKind); 6] = [
    (ENABLE_CPU, CollectorKind::Cpu),
    (ENABLE_HEAP, CollectorKind::Heap),
    (ENABLE_GOROUTINE, CollectorKind::LiveStacks),
    (ENABLE_BLOCK, CollectorKind::Blocking),
    (ENABLE_MUTEX, CollectorKind::LockContention),
    (ENABLE_ALLOCS, CollectorKind::Allocations),
];

const RATE_KEYS: [(&str, CollectorKind); 3] = [
    (MEM_RATE, CollectorKind::Heap),
    (BLOCK_RATE, CollectorKind::Blocking),
    (MUTEX_FRACTION, CollectorKind::LockContention),
];

/// Error type for plan resolution.
#[derive(Debug)]
pub enum ConfigError {
    /// The output directory could not be created or written to.
    UnwritableOutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnwritableOutputDir { path, source } => {
                write!(f, "output directory {} is not writable: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::UnwritableOutputDir { source, .. } => Some(source),
        }
    }
}

/// Raw key/value settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every `PROFWRAP_*` variable from the process environment.
    pub fn from_env() -> Self {
        std::env::vars()
            .filter(|(key, _)| key.starts_with(PREFIX))
            .collect()
    }

    /// Sets a key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Immutable description of what to collect for one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPlan {
    output_dir: Option<PathBuf>,
    enabled: BTreeSet<CollectorKind>,
    rates: BTreeMap<CollectorKind, u64>,
    cpu_duration: Option<Duration>,
    cpu_frequency: u32,
    clean_stale: bool,
}

impl Default for CollectionPlan {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CollectionPlan {
    /// A plan that collects nothing and writes nothing.
    pub fn disabled() -> Self {
        Self {
            output_dir: None,
            enabled: BTreeSet::new(),
            rates: BTreeMap::new(),
            cpu_duration: None,
            cpu_frequency: DEFAULT_CPU_HZ,
            clean_stale: true,
        }
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn enabled(&self) -> &BTreeSet<CollectorKind> {
        &self.enabled
    }

    pub fn is_enabled(&self, kind: CollectorKind) -> bool {
        self.enabled.contains(&kind)
    }

    /// True when at least one collector will run.
    pub fn is_active(&self) -> bool {
        self.output_dir.is_some() && !self.enabled.is_empty()
    }

    /// Explicitly configured rate, if any.
    pub fn configured_rate(&self, kind: CollectorKind) -> Option<u64> {
        self.rates.get(&kind).copied()
    }

    /// Configured rate or the collector-specific default.
    pub fn rate(&self, kind: CollectorKind) -> Option<u64> {
        self.configured_rate(kind).or_else(|| kind.default_rate())
    }

    pub fn cpu_duration(&self) -> Option<Duration> {
        self.cpu_duration
    }

    pub fn cpu_frequency(&self) -> u32 {
        self.cpu_frequency
    }

    pub fn clean_stale(&self) -> bool {
        self.clean_stale
    }

    /// Where the artifact for `kind` lands, when profiling is active.
    pub fn artifact_path(&self, kind: CollectorKind) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(kind.artifact_name()))
    }

    /// Enabled continuous kinds, in catalog order (their start order).
    pub fn continuous_kinds(&self) -> Vec<CollectorKind> {
        CollectorKind::ALL
            .into_iter()
            .filter(|k| k.is_continuous() && self.is_enabled(*k))
            .collect()
    }

    /// Enabled point-in-time kinds, in canonical snapshot order.
    pub fn snapshot_kinds(&self) -> Vec<CollectorKind> {
        CollectorKind::SNAPSHOT_ORDER
            .into_iter()
            .filter(|k| self.is_enabled(*k))
            .collect()
    }
}

/// Resolves settings into a plan.
///
/// Returns a disabled plan when no output directory is configured. The only
/// side effect is creating the output directory (and probing that it accepts
/// new files) when one is configured.
pub fn resolve(settings: &Settings) -> Result<CollectionPlan, ConfigError> {
    let output_dir = match settings.get(OUTPUT_DIR).map(str::trim) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            debug!("no output directory configured, profiling disabled");
            return Ok(CollectionPlan::disabled());
        }
    };

    let mut enabled = BTreeSet::new();
    for (key, kind) in ENABLE_KEYS {
        if let Some(value) = settings.get(key)
            && parse_bool(key, value)
        {
            enabled.insert(kind);
        }
    }
    if let Some(list) = settings.get(PROFILES) {
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match CollectorKind::from_name(name) {
                Some(kind) => {
                    enabled.insert(kind);
                }
                None => warn!(key = PROFILES, name, "unknown profile kind ignored"),
            }
        }
    }

    let mut rates = BTreeMap::new();
    for (key, kind) in RATE_KEYS {
        if let Some(rate) = settings.get(key).and_then(|v| parse_positive(key, v)) {
            rates.insert(kind, rate);
        }
    }

    let cpu_duration = settings
        .get(CPU_DURATION)
        .and_then(|v| parse_duration_secs(CPU_DURATION, v));

    let cpu_frequency = settings
        .get(CPU_HZ)
        .and_then(|v| parse_positive(CPU_HZ, v))
        .map(|hz| {
            if hz > u64::from(MAX_CPU_HZ) {
                warn!(key = CPU_HZ, hz, max = MAX_CPU_HZ, "CPU sampling frequency clamped");
            }
            hz.min(u64::from(MAX_CPU_HZ)) as u32
        })
        .unwrap_or(DEFAULT_CPU_HZ);

    let clean_stale = settings
        .get(CLEAN)
        .map(|v| parse_bool(CLEAN, v))
        .unwrap_or(true);

    ensure_writable(&output_dir)?;

    Ok(CollectionPlan {
        output_dir: Some(output_dir),
        enabled,
        rates,
        cpu_duration,
        cpu_frequency,
        clean_stale,
    })
}

/// Creates `dir` if missing and checks that a file can be created in it.
fn ensure_writable(dir: &Path) -> Result<(), ConfigError> {
    let unwritable = |source| ConfigError::UnwritableOutputDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(unwritable)?;
    tempfile::Builder::new()
        .prefix(".profwrap-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(unwritable)
}

fn parse_bool(key: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" | "" => false,
        other => {
            warn!(key, value = other, "unrecognized boolean, treating as false");
            false
        }
    }
}

fn parse_positive(key: &str, value: &str) -> Option<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value, "expected a positive integer, using default");
            None
        }
    }
}

/// Seconds, integral or decimal (`2`, `0.5`).
fn parse_duration_secs(key: &str, value: &str) -> Option<Duration> {
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            warn!(key, value, "expected a positive number of seconds, ignoring");
            None
        }
    }
}
