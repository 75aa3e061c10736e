//! Allocator introspection through jemalloc's `mallctl` namespace.
//!
//! Heap and allocation snapshots read the allocator's statistics; the heap
//! sampling rate is a process-wide profiling knob set once before the child
//! runs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// `MALLCTL_ARENAS_ALL`: addresses the merged view of every arena.
pub const ARENAS_ALL: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// A `mallctl` call returned a non-zero errno.
    Mallctl { name: &'static str, code: i32 },
    /// The process does not run on jemalloc.
    Unsupported,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Mallctl { name, code } => {
                write!(f, "mallctl {} failed with errno {}", name, code)
            }
            ProbeError::Unsupported => write!(f, "allocator introspection unsupported"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Allocator-wide byte counters, refreshed at the current epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocated: u64,
    pub active: u64,
    pub resident: u64,
    pub mapped: u64,
    pub retained: u64,
    pub metadata: u64,
}

/// Cumulative allocation counters merged over all arenas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocCounters {
    pub small_nmalloc: u64,
    pub small_ndalloc: u64,
    pub small_allocated: u64,
    pub large_nmalloc: u64,
    pub large_ndalloc: u64,
    pub large_allocated: u64,
}

/// Heap sampling interval that is actually in force.
///
/// Empty until [`HeapProbe::set_sample_interval`] succeeded, so a profile
/// never claims a rate the allocator rejected.
#[derive(Debug, Clone, Default)]
pub struct AppliedRate(Arc<AtomicU64>);

impl AppliedRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bytes: u64) {
        self.0.store(bytes, Ordering::Release);
    }

    pub fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            bytes => Some(bytes),
        }
    }
}

/// Access to the process allocator.
pub trait HeapProbe: Send + Sync {
    /// Returns dirty pages of every arena to the OS and refreshes the
    /// statistics epoch.
    fn purge(&self) -> Result<(), ProbeError>;

    fn heap_stats(&self) -> Result<HeapStats, ProbeError>;

    fn alloc_counters(&self) -> Result<AllocCounters, ProbeError>;

    /// Sets the mean number of bytes between heap samples.
    fn set_sample_interval(&self, bytes: u64) -> Result<(), ProbeError>;
}

/// Base-2 log of the sampling interval, as jemalloc's `lg_sample` expects.
pub fn lg_sample(bytes: u64) -> usize {
    if bytes <= 1 {
        0
    } else {
        (u64::BITS - 1 - bytes.leading_zeros()) as usize
    }
}

/// Probe backed by the linked jemalloc.
#[derive(Debug, Default, Clone, Copy)]
pub struct JemallocProbe;

impl JemallocProbe {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(target_env = "msvc"))]
mod ctl {
    use super::ProbeError;
    use std::ffi::CStr;
    use std::ptr;

    /// Reads a fixed-size value.
    pub(super) fn read<T: Copy + Default>(
        name: &'static CStr,
        label: &'static str,
    ) -> Result<T, ProbeError> {
        let mut value = T::default();
        let mut len = std::mem::size_of::<T>();
        // SAFETY: `value` is a valid, writable T and `len` holds its exact size;
        // jemalloc writes at most `len` bytes into it.
        let code = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr().cast(),
                (&mut value as *mut T).cast(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        if code != 0 {
            return Err(ProbeError::Mallctl { name: label, code });
        }
        Ok(value)
    }

    /// Writes a fixed-size value.
    pub(super) fn write<T: Copy>(
        name: &'static CStr,
        label: &'static str,
        mut value: T,
    ) -> Result<(), ProbeError> {
        // SAFETY: `value` outlives the call and `newlen` is its exact size.
        let code = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                (&mut value as *mut T).cast(),
                std::mem::size_of::<T>(),
            )
        };
        if code != 0 {
            return Err(ProbeError::Mallctl { name: label, code });
        }
        Ok(())
    }

    /// Runs a void control such as `arena.<i>.purge`.
    pub(super) fn call(name: &'static CStr, label: &'static str) -> Result<(), ProbeError> {
        // SAFETY: void controls take no input and produce no output.
        let code = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if code != 0 {
            return Err(ProbeError::Mallctl { name: label, code });
        }
        Ok(())
    }

    /// Advances the statistics epoch so subsequent reads are current.
    pub(super) fn refresh_epoch() -> Result<(), ProbeError> {
        write(c"epoch", "epoch", 1u64)
    }
}

#[cfg(not(target_env = "msvc"))]
impl HeapProbe for JemallocProbe {
    fn purge(&self) -> Result<(), ProbeError> {
        ctl::call(c"arena.4096.purge", "arena.4096.purge")?;
        ctl::refresh_epoch()
    }

    fn heap_stats(&self) -> Result<HeapStats, ProbeError> {
        ctl::refresh_epoch()?;
        let size = |name, label| ctl::read::<usize>(name, label).map(|v| v as u64);
        Ok(HeapStats {
            allocated: size(c"stats.allocated", "stats.allocated")?,
            active: size(c"stats.active", "stats.active")?,
            resident: size(c"stats.resident", "stats.resident")?,
            mapped: size(c"stats.mapped", "stats.mapped")?,
            retained: size(c"stats.retained", "stats.retained")?,
            metadata: size(c"stats.metadata", "stats.metadata")?,
        })
    }

    fn alloc_counters(&self) -> Result<AllocCounters, ProbeError> {
        ctl::refresh_epoch()?;
        let count = |name, label| ctl::read::<u64>(name, label);
        let size = |name, label| ctl::read::<usize>(name, label).map(|v| v as u64);
        Ok(AllocCounters {
            small_nmalloc: count(
                c"stats.arenas.4096.small.nmalloc",
                "stats.arenas.4096.small.nmalloc",
            )?,
            small_ndalloc: count(
                c"stats.arenas.4096.small.ndalloc",
                "stats.arenas.4096.small.ndalloc",
            )?,
            small_allocated: size(
                c"stats.arenas.4096.small.allocated",
                "stats.arenas.4096.small.allocated",
            )?,
            large_nmalloc: count(
                c"stats.arenas.4096.large.nmalloc",
                "stats.arenas.4096.large.nmalloc",
            )?,
            large_ndalloc: count(
                c"stats.arenas.4096.large.ndalloc",
                "stats.arenas.4096.large.ndalloc",
            )?,
            large_allocated: size(
                c"stats.arenas.4096.large.allocated",
                "stats.arenas.4096.large.allocated",
            )?,
        })
    }

    fn set_sample_interval(&self, bytes: u64) -> Result<(), ProbeError> {
        ctl::write(c"prof.reset", "prof.reset", lg_sample(bytes))
    }
}

#[cfg(target_env = "msvc")]
impl HeapProbe for JemallocProbe {
    fn purge(&self) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn heap_stats(&self) -> Result<HeapStats, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn alloc_counters(&self) -> Result<AllocCounters, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn set_sample_interval(&self, _bytes: u64) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported)
    }
}
