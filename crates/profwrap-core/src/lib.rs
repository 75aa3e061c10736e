//! profwrap-core - supervised profiling runs.
//!
//! Provides:
//! - `config`: settings map to `CollectionPlan` resolution
//! - `collector`: the collector catalog (CPU sampler, point-in-time snapshots),
//!   procfs access and allocator probes
//! - `profile`: the on-disk artifact format
//! - `supervisor`: runs a child program and sequences the collectors around it

pub mod collector;
pub mod config;
pub mod profile;
pub mod supervisor;

pub use collector::{CollectorError, CollectorKind};
pub use config::{CollectionPlan, ConfigError, Settings, resolve};
pub use supervisor::{ChildOutcome, ExitOutcome, SpawnError, Supervisor, Target, supervise};
