//! Executes a single `.job` file's commands against the store.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use super::parser::{self, Command};
use crate::snapshot::{self, BackupStatus, BackupSupervisor};
use crate::store::Store;
use crate::Result;

const HELP_TEXT: &str = "Available commands:\n\
    \x20 WRITE [(key,value)(key2,value2),...]\n\
    \x20 READ [key,key2,...]\n\
    \x20 DELETE [key,key2,...]\n\
    \x20 SHOW\n\
    \x20 WAIT <delay_ms>\n\
    \x20 BACKUP\n\
    \x20 HELP\n";

/// Executes one `.job` file against the store.
///
/// The companion `<name>.out` is created (truncating) up front, so it
/// exists even when no command writes to it. Snapshot files land next
/// to the job. Malformed commands are logged and skipped; the job
/// itself only fails on I/O errors against its own files.
pub fn run_job(store: &Store, supervisor: &BackupSupervisor, job_path: &Path) -> Result<()> {
    let stem = job_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = job_path.parent().unwrap_or_else(|| Path::new("."));

    let mut input = BufReader::new(File::open(job_path)?);
    let mut out = File::create(job_path.with_extension("out"))?;
    let mut backup_seq = 0u32;

    while let Some(command) = parser::next_command(&mut input)? {
        match command {
            Command::Write(pairs) => {
                if let Err(e) = store.write(&pairs) {
                    warn!("{stem}: failed to write pairs: {e}");
                }
            }
            Command::Read(keys) => {
                if let Err(e) = store.read(&keys, &mut out) {
                    warn!("{stem}: failed to read keys: {e}");
                }
            }
            Command::Delete(keys) => {
                if let Err(e) = store.delete(&keys, &mut out) {
                    warn!("{stem}: failed to delete keys: {e}");
                }
            }
            Command::Show => store.show(&mut out)?,
            Command::Wait(ms) => {
                info!("{stem}: waiting {ms} ms");
                thread::sleep(Duration::from_millis(ms));
            }
            Command::Backup => {
                backup_seq += 1;
                match snapshot::backup(store, supervisor, dir, &stem, backup_seq) {
                    Ok(BackupStatus::Forked) => {}
                    Ok(BackupStatus::Skipped) => {
                        warn!("{stem}: backup {backup_seq} skipped");
                    }
                    Err(e) => warn!("{stem}: failed to back up: {e}"),
                }
            }
            Command::Help => {
                let mut stdout = io::stdout().lock();
                let _ = stdout.write_all(HELP_TEXT.as_bytes());
            }
            Command::Empty => {}
            Command::Invalid => {
                warn!("{stem}: invalid command, see HELP for usage");
            }
        }
    }
    Ok(())
}
