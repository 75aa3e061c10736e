//! Mock filesystem and `/proc` fixtures for tests.

mod filesystem;
mod scenarios;

pub use filesystem::{MockFs, MockTask};
pub use scenarios::{stat_line, status_text};
