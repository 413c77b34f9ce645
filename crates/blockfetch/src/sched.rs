//! One-shot job scheduler collaborator.
//!
//! The engine schedules its fsync job here instead of blocking a writer
//! thread on `fsync`. Hosts with their own job system implement
//! [`Scheduler`]; [`ThreadScheduler`] is the standalone default.

use std::thread;

/// A job to run asynchronously, at most once per `schedule` call.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Execute `job` asynchronously. Implementations must not run the job
    /// inline on the calling thread; the caller may hold locks the job takes.
    fn schedule(&self, job: Job);
}

/// Runs each job on its own named, detached thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, job: Job) {
        let spawned = thread::Builder::new()
            .name("blockfetch-sync".to_string())
            .spawn(job);
        if let Err(e) = spawned {
            log::error!("failed to spawn sync job thread: {e}");
        }
    }
}
