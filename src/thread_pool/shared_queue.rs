use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error};

use super::ThreadPool;
use crate::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Workers pulling jobs off one shared MPMC channel.
///
/// Dropping the pool closes the channel; workers finish what they
/// hold and exit. A panicking job is contained by its worker.
pub struct SharedQueueThreadPool {
    tx: Sender<Job>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for id in 0..threads {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("dispatcher-{id}"))
                .spawn(move || worker_loop(id, rx))
                .expect("failed to spawn dispatcher worker");
        }
        Ok(SharedQueueThreadPool { tx })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .expect("thread pool has no active threads");
    }
}

fn worker_loop(id: u32, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("dispatcher worker {id}: job panicked");
        }
    }
    debug!("dispatcher worker {id}: queue closed, exiting");
}
