//! In-memory mock filesystem for testing collectors without a real `/proc`.

use crate::collector::traits::FileSystem;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Files of one thread under `/proc/[pid]/task/[tid]/`.
///
/// Empty strings mean "file absent".
#[derive(Debug, Clone, Copy, Default)]
pub struct MockTask<'a> {
    pub stat: &'a str,
    pub status: &'a str,
    pub schedstat: &'a str,
    pub wchan: &'a str,
    pub children: &'a str,
}

/// A `/proc`-shaped tree held in memory.
///
/// Paths are stored whole; every ancestor of an added path is registered as
/// a directory so `read_dir` and `exists` behave like the real thing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    nodes: BTreeMap<PathBuf, Node>,
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Dir,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `content` at `path`, replacing any previous content.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref();
        self.mkdir_ancestors(path);
        self.nodes
            .insert(path.to_path_buf(), Node::File(content.into()));
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.mkdir_ancestors(path);
        self.nodes.entry(path.to_path_buf()).or_insert(Node::Dir);
    }

    fn mkdir_ancestors(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            self.nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir);
        }
    }

    /// Adds the process-level `stat` and `status` of `/proc/<dir>/`.
    ///
    /// `dir` is a pid or `"self"`.
    pub fn add_process(&mut self, dir: &str, stat: &str, status: &str) {
        let base = PathBuf::from(format!("/proc/{}", dir));
        self.add_dir(base.join("task"));
        self.add_file(base.join("stat"), stat);
        self.add_file(base.join("status"), status);
    }

    /// Adds one thread of `/proc/<dir>/`.
    pub fn add_task(&mut self, dir: &str, tid: u32, task: MockTask<'_>) {
        let base = PathBuf::from(format!("/proc/{}/task/{}", dir, tid));
        self.add_dir(&base);
        for (name, content) in [
            ("stat", task.stat),
            ("status", task.status),
            ("schedstat", task.schedstat),
            ("wchan", task.wchan),
            ("children", task.children),
        ] {
            if !content.is_empty() {
                self.add_file(base.join(name), content);
            }
        }
    }

    /// Drops a file, as when a thread or process exits mid-read.
    pub fn remove_file(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if matches!(self.nodes.get(path), Some(Node::File(_))) {
            self.nodes.remove(path);
        }
    }
}

fn not_found(what: &str, path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} {} not in mock", what, path.display()),
    )
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.nodes.get(path) {
            Some(Node::File(content)) => Ok(content.clone()),
            _ => Err(not_found("file", path)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(self
                .nodes
                .keys()
                .filter(|entry| entry.parent() == Some(path))
                .cloned()
                .collect()),
            _ => Err(not_found("directory", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_create_their_parents() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/self/stat", "1 (x) S 0");

        assert!(fs.exists(Path::new("/proc/self/stat")));
        assert!(fs.exists(Path::new("/proc/self")));
        assert_eq!(
            fs.read_to_string(Path::new("/proc/self/stat")).unwrap(),
            "1 (x) S 0"
        );
    }

    #[test]
    fn test_mock_fs_add_task_skips_empty_files() {
        let mut fs = MockFs::new();
        fs.add_task(
            "42",
            42,
            MockTask {
                stat: "42 (w) S 1",
                children: "43",
                ..MockTask::default()
            },
        );

        let entries = fs.read_dir(Path::new("/proc/42/task/42")).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!fs.exists(Path::new("/proc/42/task/42/wchan")));

        fs.remove_file("/proc/42/task/42/children");
        assert!(fs.read_to_string(Path::new("/proc/42/task/42/children")).is_err());
    }

    #[test]
    fn test_missing_paths_are_not_found() {
        let mut fs = MockFs::new();
        let err = fs.read_to_string(Path::new("/proc/1/stat")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(fs.read_dir(Path::new("/proc")).is_err());

        fs.add_dir("/proc/1/task");
        assert!(fs.read_to_string(Path::new("/proc/1/task")).is_err());
        assert!(fs.read_dir(Path::new("/proc/1/task")).unwrap().is_empty());
    }
}
