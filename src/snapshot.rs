use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::wait;
use nix::unistd::{fork, write, ForkResult};

use crate::store::Store;
use crate::Result;

/// Outcome of a backup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    /// A child process is writing the snapshot.
    Forked,
    /// The accounting disagreed with the process table; nothing forked.
    Skipped,
}

/// Caps the number of live snapshot children at `max_backups`.
///
/// At the cap, the caller reaps one finished child before starting a
/// new one; the mutex is held across the reap so concurrent BACKUPs
/// queue behind it. The counter never exceeds the cap.
pub struct BackupSupervisor {
    max_backups: usize,
    active: Mutex<usize>,
}

impl BackupSupervisor {
    /// Creates a supervisor allowing `max_backups` concurrent children.
    pub fn new(max_backups: usize) -> Self {
        BackupSupervisor {
            max_backups,
            active: Mutex::new(0),
        }
    }

    /// Reserves a child slot, reaping a finished child if at the cap.
    ///
    /// Returns `false` when the process table holds no children even
    /// though the counter is at the cap; the caller skips the backup
    /// instead of blocking forever.
    fn reserve(&self) -> bool {
        let mut active = self.active.lock().unwrap();
        while *active >= self.max_backups {
            match wait() {
                Ok(_) => *active -= 1,
                Err(Errno::ECHILD) => {
                    *active = 0;
                    return false;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("failed to reap snapshot child: {e}");
                    return false;
                }
            }
        }
        *active += 1;
        true
    }

    fn release(&self) {
        let mut active = self.active.lock().unwrap();
        *active = active.saturating_sub(1);
    }

    /// Reaps every outstanding snapshot child. Called at shutdown.
    pub fn drain(&self) {
        let mut active = self.active.lock().unwrap();
        while *active > 0 {
            match wait() {
                Ok(_) => *active -= 1,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Returns the `.bak` path for snapshot `seq` of job `job_stem`.
pub fn backup_path(dir: &Path, job_stem: &str, seq: u32) -> PathBuf {
    dir.join(format!("{job_stem}-{seq}.bak"))
}

/// Snapshots the store to `<dir>/<job_stem>-<seq>.bak`.
///
/// The parent renders the image under the bucket locks and opens the
/// output file, then forks; the child only pushes the pre-rendered
/// bytes to disk and `_exit`s, so it never takes a lock that another
/// thread may have held at fork time and the parent never blocks on
/// snapshot I/O.
pub fn backup(
    store: &Store,
    supervisor: &BackupSupervisor,
    dir: &Path,
    job_stem: &str,
    seq: u32,
) -> Result<BackupStatus> {
    if !supervisor.reserve() {
        return Ok(BackupStatus::Skipped);
    }

    let path = backup_path(dir, job_stem, seq);
    let image = store.serialize()?;
    let file = match File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            supervisor.release();
            return Err(e.into());
        }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("snapshot child {child} writing {}", path.display());
            Ok(BackupStatus::Forked)
        }
        Ok(ForkResult::Child) => {
            // Only async-signal-safe work from here on: raw writes to
            // the already-open descriptor, then _exit.
            let fd: OwnedFd = file.into();
            let mut done = 0;
            while done < image.len() {
                match write(fd.as_fd(), &image[done..]) {
                    Ok(n) => done += n,
                    Err(Errno::EINTR) => continue,
                    Err(_) => unsafe { libc::_exit(1) },
                }
            }
            unsafe { libc::_exit(0) }
        }
        Err(e) => {
            supervisor.release();
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;

    // The test harness may run several forking tests in one process,
    // so a drain can reap a sibling's child. Poll for the content
    // instead of relying on reap pairing.
    fn wait_for_content(path: &Path, expected: &str) {
        for _ in 0..500 {
            if let Ok(content) = fs::read_to_string(path) {
                if content == expected {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("snapshot {} never reached expected content", path.display());
    }

    #[test]
    fn backup_writes_the_image_at_fork_time() {
        let dir = TempDir::new().unwrap();
        let store = Store::new();
        store.write(&[("x".to_owned(), "1".to_owned())]).unwrap();

        let supervisor = BackupSupervisor::new(1);
        let status = backup(&store, &supervisor, dir.path(), "a", 1).unwrap();
        assert_eq!(status, BackupStatus::Forked);

        // A later write must not leak into the already-forked image.
        store.write(&[("x".to_owned(), "2".to_owned())]).unwrap();
        supervisor.drain();

        wait_for_content(&dir.path().join("a-1.bak"), "(x,1)\n");
    }

    #[test]
    fn sequences_name_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = Store::new();
        store.write(&[("k".to_owned(), "v".to_owned())]).unwrap();

        let supervisor = BackupSupervisor::new(2);
        for seq in 1..=3 {
            assert_eq!(
                backup(&store, &supervisor, dir.path(), "job", seq).unwrap(),
                BackupStatus::Forked
            );
        }
        supervisor.drain();

        for seq in 1..=3 {
            wait_for_content(&backup_path(dir.path(), "job", seq), "(k,v)\n");
        }
    }
}
