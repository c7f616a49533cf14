use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{error, warn};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of insertion threads fed through a bounded queue.
pub(crate) struct WorkerPool {
    queue: Sender<Job>,
    finished: Receiver<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize, capacity: usize) -> io::Result<Self> {
        let (queue, jobs) = bounded::<Job>(capacity);
        let (done, finished) = bounded::<()>(threads);
        let handles = (0..threads)
            .map(|i| {
                let jobs = jobs.clone();
                let done = done.clone();
                thread::Builder::new()
                    .name(format!("spindle-worker-{i}"))
                    .spawn(move || {
                        for job in jobs.iter() {
                            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
                                error!(panic = panic_message(&*panic), "sample insertion panicked");
                            }
                        }
                        let _ = done.send(());
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            queue,
            finished,
            handles,
        })
    }

    /// Queue a job without blocking. A full queue hands the job back.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        self.queue.try_send(job).map_err(|e| match e {
            TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
        })
    }

    /// Close the queue and wait up to `timeout` for queued jobs to drain.
    ///
    /// Returns `false` when the wait timed out; lagging workers are left to
    /// finish on their own.
    pub(crate) fn shutdown(self, timeout: Duration) -> bool {
        let Self {
            queue,
            finished,
            handles,
        } = self;
        drop(queue);

        let deadline = Instant::now() + timeout;
        for _ in 0..handles.len() {
            if finished.recv_deadline(deadline).is_err() {
                warn!(?timeout, "timed out waiting for sample insertion to drain");
                return false;
            }
        }
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
