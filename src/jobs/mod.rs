//! Batch side of the server: the job directory queue, the command
//! grammar, and the per-file runner.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::warn;

use crate::snapshot::BackupSupervisor;
use crate::store::Store;
use crate::Result;

pub mod parser;
pub mod runner;

/// Longest job path the dispatcher will accept.
pub const MAX_JOB_PATH_LEN: usize = 256;

/// Shared cursor over the job directory.
///
/// Dispatcher workers call [`JobQueue::next`] until it returns `None`;
/// the mutex around the `ReadDir` iterator guarantees no two workers
/// claim the same file. Claim order is whatever the directory yields.
pub struct JobQueue {
    cursor: Mutex<fs::ReadDir>,
}

impl JobQueue {
    /// Opens the cursor over `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(JobQueue {
            cursor: Mutex::new(fs::read_dir(dir)?),
        })
    }

    /// Claims the next `.job` file, or `None` at end of directory.
    pub fn next(&self) -> Option<PathBuf> {
        let mut cursor = self.cursor.lock().unwrap();
        loop {
            let entry = match cursor.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("failed to read job directory entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || path.extension() != Some("job".as_ref()) {
                continue;
            }
            if path.as_os_str().len() > MAX_JOB_PATH_LEN {
                warn!("job path too long, skipping {}", path.display());
                continue;
            }
            return Some(path);
        }
    }
}

/// One dispatcher worker: claim and run jobs until the directory ends.
///
/// A failing job is logged and skipped; it never takes the worker
/// down with it.
pub fn drain_queue(queue: &JobQueue, store: &Store, supervisor: &BackupSupervisor) {
    while let Some(job) = queue.next() {
        if let Err(e) = runner::run_job(store, supervisor, &job) {
            warn!("skipping job {}: {e}", job.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn queue_yields_each_job_exactly_once() {
        let dir = TempDir::new().unwrap();
        for name in ["a.job", "b.job", "c.job", "notes.txt", "d.out"] {
            fs::write(dir.path().join(name), "").unwrap();
        }

        let queue = Arc::new(JobQueue::open(dir.path()).unwrap());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                let mut claimed = Vec::new();
                while let Some(job) = queue.next() {
                    claimed.push(job);
                }
                claimed
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for path in handle.join().unwrap() {
                assert!(all.insert(path), "job claimed twice");
            }
        }
        let names: HashSet<String> = all
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            HashSet::from(["a.job".to_owned(), "b.job".to_owned(), "c.job".to_owned()])
        );
    }

    #[test]
    fn drain_runs_every_job_against_one_store() {
        let dir = TempDir::new().unwrap();
        for (name, key) in [("one.job", "k1"), ("two.job", "k2"), ("three.job", "k3")] {
            fs::write(
                dir.path().join(name),
                format!("WRITE [({key},set)]\nREAD [{key}]\n"),
            )
            .unwrap();
        }

        let store = Store::new();
        let supervisor = BackupSupervisor::new(1);
        let queue = JobQueue::open(dir.path()).unwrap();
        drain_queue(&queue, &store, &supervisor);

        for (name, key) in [("one.out", "k1"), ("two.out", "k2"), ("three.out", "k3")] {
            let out = fs::read_to_string(dir.path().join(name)).unwrap();
            assert_eq!(out, format!("[({key},set)]\n"));
        }
    }
}
