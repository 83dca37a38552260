//! Worker pools for the batch side of the server.

use crate::Result;

/// A pool of worker threads.
///
/// The server sizes one of these with the `max_threads` argument and
/// runs its dispatcher loops on it; each loop drains the job
/// directory queue to completion.
pub trait ThreadPool {
    /// Creates a pool with `threads` workers.
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// Hands a job to the pool.
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

mod shared_queue;

pub use self::shared_queue::SharedQueueThreadPool;
