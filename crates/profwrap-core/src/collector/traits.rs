//! Filesystem access behind a trait so collectors can read a real `/proc`
//! on Linux or an in-memory tree in tests.

use std::io;
use std::path::{Path, PathBuf};

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    ///
    /// # Returns
    /// A vector of paths to entries in the directory, or an I/O error.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_read_dir_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();

        let fs = RealFs::new();
        assert_eq!(fs.read_dir(dir.path()).unwrap().len(), 2);
        assert_eq!(fs.read_to_string(&dir.path().join("a")).unwrap(), "1");
        assert!(fs.exists(&dir.path().join("b")));
        assert!(!fs.exists(Path::new("/nonexistent/path/12345")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_fs_reads_own_stat() {
        let fs = RealFs::new();
        let stat = fs.read_to_string(Path::new("/proc/self/stat")).unwrap();
        assert!(stat.starts_with(&std::process::id().to_string()));
    }
}
