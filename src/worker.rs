//! Background execution for fetch and parse work.
//!
//! Jobs run on a fixed set of threads fed from one queue. Each submission
//! returns a [`TaskHandle`] with separate progress and result channels, so
//! callers on another thread decide how and when to consume updates.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AtlasregError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub completed: u64,
    pub total: u64,
}

/// Sending half of a task's progress channel, handed to the job.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Sender<TransferProgress>,
}

impl ProgressReporter {
    pub fn report(&self, completed: u64, total: u64) {
        // The receiver may have been dropped; progress is best effort.
        let _ = self.sender.send(TransferProgress { completed, total });
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    queue: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (queue, jobs) = mpsc::channel::<Job>();
        let jobs = Arc::new(Mutex::new(jobs));
        let workers = (0..size)
            .map(|index| {
                let jobs = Arc::clone(&jobs);
                thread::spawn(move || {
                    loop {
                        let next = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
                        match next {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                    debug!(worker = index, "worker stopped");
                })
            })
            .collect();
        Self {
            queue: Some(queue),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProgressReporter) -> Result<T, AtlasregError> + Send + 'static,
    {
        let (progress_tx, progress_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        let reporter = ProgressReporter {
            sender: progress_tx,
        };
        let task: Job = Box::new(move || {
            let _ = result_tx.send(job(&reporter));
        });
        let queued = self
            .queue
            .as_ref()
            .map(|queue| queue.send(task).is_ok())
            .unwrap_or(false);
        if !queued {
            warn!("worker pool is shut down; task dropped");
        }
        TaskHandle {
            progress: progress_rx,
            result: result_rx,
            finished: None,
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(thread::available_parallelism().map(|n| n.get()).unwrap_or(2))
    }
}

impl Drop for WorkerPool {
    /// Closes the queue, then joins workers once queued jobs have run.
    fn drop(&mut self) {
        self.queue.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

pub struct TaskHandle<T> {
    progress: Receiver<TransferProgress>,
    result: Receiver<Result<T, AtlasregError>>,
    finished: Option<Result<T, AtlasregError>>,
}

impl<T> TaskHandle<T> {
    pub fn progress(&self) -> &Receiver<TransferProgress> {
        &self.progress
    }

    /// Non-blocking poll. Returns the result once, when the task is done.
    pub fn try_result(&mut self) -> Option<Result<T, AtlasregError>> {
        if let Some(done) = self.finished.take() {
            return Some(done);
        }
        match self.result.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(lost_task())),
        }
    }

    pub fn is_finished(&mut self) -> bool {
        if self.finished.is_some() {
            return true;
        }
        match self.result.try_recv() {
            Ok(result) => {
                self.finished = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.finished = Some(Err(lost_task()));
                true
            }
        }
    }

    pub fn wait(mut self) -> Result<T, AtlasregError> {
        if let Some(done) = self.finished.take() {
            return done;
        }
        self.result.recv().unwrap_or_else(|_| Err(lost_task()))
    }
}

fn lost_task() -> AtlasregError {
    AtlasregError::Worker("task ended without a result".to_string())
}
