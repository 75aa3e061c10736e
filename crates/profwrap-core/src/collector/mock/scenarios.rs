//! Pre-built mock `/proc` trees.

use super::filesystem::{MockFs, MockTask};

/// Builds a `stat` line with the fields the collectors read; the rest are zero.
#[allow(clippy::too_many_arguments)]
pub fn stat_line(
    pid: u32,
    comm: &str,
    state: char,
    ppid: u32,
    utime: u64,
    stime: u64,
    threads: u32,
    processor: u32,
) -> String {
    format!(
        "{pid} ({comm}) {state} {ppid} {pid} {ppid} 0 -1 4194304 120 0 2 0 {utime} {stime} 0 0 20 0 {threads} 0 5000 10485760 300 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 {processor} 0 0 0"
    )
}

/// Builds a `status` file with the fields the collectors read.
pub fn status_text(name: &str, pid: u32, threads: u32, voluntary: u64, nonvoluntary: u64) -> String {
    format!(
        "Name:\t{name}\nState:\tS (sleeping)\nPid:\t{pid}\nThreads:\t{threads}\nVmPeak:\t   20480 kB\nVmSize:\t   18432 kB\nVmHWM:\t    6144 kB\nVmRSS:\t    5120 kB\nVmData:\t    4096 kB\nVmStk:\t     132 kB\nVmSwap:\t       0 kB\nvoluntary_ctxt_switches:\t{voluntary}\nnonvoluntary_ctxt_switches:\t{nonvoluntary}\n"
    )
}

impl MockFs {
    /// The supervising process as seen through `/proc/self`: a main thread
    /// parked in `wait4` and an idle relay thread.
    pub fn supervisor_process() -> Self {
        let mut fs = Self::new();
        fs.add_process(
            "self",
            &stat_line(1000, "profwrap", 'S', 1, 12, 4, 2, 0),
            &status_text("profwrap", 1000, 2, 40, 15),
        );

        let main_stat = stat_line(1000, "profwrap", 'S', 1, 10, 3, 2, 0);
        let main_status = status_text("profwrap", 1000, 2, 30, 3);
        fs.add_task(
            "self",
            1000,
            MockTask {
                stat: &main_stat,
                status: &main_status,
                schedstat: "9000000 4000000 30\n",
                wchan: "do_wait",
                children: "2000 ",
            },
        );

        let relay_stat = stat_line(1001, "relay-stdout", 'S', 1, 2, 1, 2, 1);
        let relay_status = status_text("relay-stdout", 1001, 2, 10, 12);
        fs.add_task(
            "self",
            1001,
            MockTask {
                stat: &relay_stat,
                status: &relay_status,
                schedstat: "500000 250000 4\n",
                wchan: "0",
                children: "",
            },
        );
        fs
    }

    /// A supervised child (pid 2000, two threads) with a grandchild (2100)
    /// that in turn forked 2200.
    pub fn supervised_tree() -> Self {
        let mut fs = Self::new();

        let lines = [
            ("2000", 2000, stat_line(2000, "server", 'R', 1000, 250, 50, 2, 0), "2100"),
            ("2000", 2001, stat_line(2001, "server-io", 'S', 1000, 40, 10, 2, 1), ""),
            ("2100", 2100, stat_line(2100, "sh", 'S', 2000, 5, 5, 1, 0), "2200 "),
            ("2200", 2200, stat_line(2200, "worker", 'R', 2100, 90, 0, 1, 1), ""),
        ];
        for (dir, tid, stat, children) in &lines {
            fs.add_task(
                dir,
                *tid,
                MockTask {
                    stat,
                    schedstat: "1000000 500000 10\n",
                    children,
                    ..MockTask::default()
                },
            );
        }
        fs
    }
}

#[cfg(test)]
mod tests {
    use crate::collector::mock::MockFs;
    use crate::collector::procfs::parser::{parse_proc_stat, parse_proc_status};
    use crate::collector::traits::FileSystem;
    use std::path::Path;

    #[test]
    fn test_fixture_lines_parse() {
        let stat = parse_proc_stat(&super::stat_line(7, "a b", 'R', 1, 11, 22, 3, 5)).unwrap();
        assert_eq!(stat.comm, "a b");
        assert_eq!(stat.utime, 11);
        assert_eq!(stat.stime, 22);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.processor, 5);

        let status = parse_proc_status(&super::status_text("a", 7, 3, 4, 9)).unwrap();
        assert_eq!(status.vm_rss, 5120);
        assert_eq!(status.nonvoluntary_ctxt_switches, 9);
    }

    #[test]
    fn test_supervisor_process_layout() {
        let fs = MockFs::supervisor_process();
        assert!(fs.exists(Path::new("/proc/self/status")));
        assert_eq!(fs.read_dir(Path::new("/proc/self/task")).unwrap().len(), 2);
    }
}
