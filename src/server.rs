use std::path::PathBuf;
use std::sync::Arc;

use crossbeam::channel;
use log::{info, warn};

use crate::jobs::{self, JobQueue};
use crate::notifier::Notifier;
use crate::session::{registrar, worker, SessionTable};
use crate::snapshot::BackupSupervisor;
use crate::store::Store;
use crate::thread_pool::{SharedQueueThreadPool, ThreadPool};
use crate::{fifo, KvsError, Result};

/// Prefix of the rendezvous FIFO path; the CLI name is appended.
const RENDEZVOUS_PREFIX: &str = "/tmp/server_";

/// Boot configuration, straight from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory scanned for `.job` files.
    pub jobs_dir: PathBuf,
    /// Dispatcher worker count.
    pub max_threads: usize,
    /// Concurrent snapshot children cap.
    pub max_backups: usize,
    /// Name appended to `/tmp/server_` to form the rendezvous path.
    pub pipe_name: String,
}

/// The server: one value owning the store, the session table and the
/// snapshot supervisor, shared by reference across every thread.
pub struct Server {
    config: ServerConfig,
    rendezvous: PathBuf,
    store: Arc<Store>,
    sessions: Arc<SessionTable>,
    backups: Arc<BackupSupervisor>,
}

/// Builds the rendezvous FIFO path for a pipe name.
pub fn rendezvous_path(pipe_name: &str) -> PathBuf {
    PathBuf::from(format!("{RENDEZVOUS_PREFIX}{pipe_name}"))
}

impl Server {
    /// Validates the configuration and prepares a bootable server.
    ///
    /// Creates the rendezvous FIFO (replacing a stale one), wires the
    /// notifier into the store, installs signal dispositions and masks
    /// SIGUSR1 on the calling thread so every thread spawned later
    /// inherits the mask.
    pub fn bind(config: ServerConfig) -> Result<Arc<Server>> {
        if config.max_threads == 0 {
            return Err(KvsError::InvalidArgument(
                "max_threads must be positive".to_owned(),
            ));
        }
        if config.max_backups == 0 {
            return Err(KvsError::InvalidArgument(
                "max_backups must be positive".to_owned(),
            ));
        }
        if config.pipe_name.is_empty() || config.pipe_name.contains('/') {
            return Err(KvsError::InvalidArgument(
                "pipe name must be a plain file name".to_owned(),
            ));
        }
        if !config.jobs_dir.is_dir() {
            return Err(KvsError::InvalidArgument(format!(
                "jobs directory {} does not exist",
                config.jobs_dir.display()
            )));
        }

        registrar::install_signal_handlers()?;
        registrar::mask_sigusr1()?;

        let rendezvous = rendezvous_path(&config.pipe_name);
        fifo::create(&rendezvous)?;
        info!("rendezvous pipe at {}", rendezvous.display());

        let store = Arc::new(Store::new());
        let sessions = Arc::new(SessionTable::new());
        store.set_listener(Box::new(Notifier::new(sessions.clone())));

        let backups = Arc::new(BackupSupervisor::new(config.max_backups));

        Ok(Arc::new(Server {
            config,
            rendezvous,
            store,
            sessions,
            backups,
        }))
    }

    /// Spawns the session workers and the hostess.
    pub fn serve_sessions(&self) {
        worker::spawn_workers(&self.sessions, &self.store);
        registrar::spawn_hostess(self.rendezvous.clone(), self.sessions.clone());
    }

    /// Runs the dispatcher pool over the job directory until it drains.
    pub fn process_jobs(&self) -> Result<()> {
        let queue = Arc::new(JobQueue::open(&self.config.jobs_dir)?);
        let pool = SharedQueueThreadPool::new(self.config.max_threads as u32)?;
        let (done_tx, done_rx) = channel::bounded(self.config.max_threads);

        for _ in 0..self.config.max_threads {
            let queue = queue.clone();
            let store = self.store.clone();
            let backups = self.backups.clone();
            let done_tx = done_tx.clone();
            pool.spawn(move || {
                jobs::drain_queue(&queue, &store, &backups);
                let _ = done_tx.send(());
            });
        }
        drop(done_tx);

        for _ in 0..self.config.max_threads {
            if done_rx.recv().is_err() {
                warn!("a dispatcher worker vanished before finishing");
                break;
            }
        }
        info!("job directory drained");
        Ok(())
    }

    /// Reaps snapshot children and removes the rendezvous FIFO.
    pub fn shutdown(&self) {
        self.backups.drain();
        if let Err(e) = fifo::remove(&self.rendezvous) {
            warn!("failed to remove rendezvous pipe: {e}");
        }
    }

    /// Full lifecycle: sessions up, jobs drained, teardown.
    ///
    /// Session workers and the hostess are not joined; they end with
    /// the process.
    pub fn run(&self) -> Result<()> {
        self.serve_sessions();
        let outcome = self.process_jobs();
        self.shutdown();
        outcome
    }

    /// The store, for embedding and tests.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The session table, for embedding and tests.
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }
}
