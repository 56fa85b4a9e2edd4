//! Single-worker background queue for deferred scheduling tasks.
//!
//! Tasks run one at a time in submission order. [`SerialQueue::cancel_all_and_wait`] drops every
//! task that has not started and blocks until the running one returns.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};

type Task = Box<dyn FnOnce() + Send>;

struct Job {
    generation: u64,
    task: Task,
}

struct Shared {
    /// Jobs submitted under an older generation are skipped.
    generation: AtomicU64,
    /// Jobs submitted and not yet finished (or skipped).
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        while *outstanding > 0 {
            outstanding = self
                .idle
                .wait(outstanding)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub(crate) struct SerialQueue {
    name: String,
    tx: Option<Sender<Job>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl SerialQueue {
    pub fn new(name: &str) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_main(rx, worker_shared))
            .with_context(|| format!("spawn {name} worker"))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Queue `task` behind everything already submitted.
    pub fn add_operation<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        *self
            .shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        let job = Job {
            generation: self.shared.generation.load(Ordering::Acquire),
            task: Box::new(task),
        };
        if tx.send(job).is_err() {
            tracing::warn!(queue = %self.name, "serial queue worker is gone; task dropped");
            self.shared.finish_one();
        }
    }

    /// Cancel every task that has not started yet and wait for the running one.
    ///
    /// From inside a task this only cancels; waiting there would wait on itself.
    pub fn cancel_all_and_wait(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if std::thread::current().id() == self.worker_id {
            return;
        }
        self.shared.wait_idle();
    }

    /// Block until every submitted task has run or been skipped.
    #[cfg(test)]
    pub fn wait_idle(&self) {
        self.shared.wait_idle();
    }

    pub fn operation_count(&self) -> usize {
        *self
            .shared
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            // The last owner may be a task on the worker itself; it exits once the task returns.
            if std::thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn worker_main(rx: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = rx.recv() {
        if job.generation == shared.generation.load(Ordering::Acquire) {
            if catch_unwind(AssertUnwindSafe(job.task)).is_err() {
                tracing::error!("serial queue task panicked");
            }
        } else {
            tracing::trace!(generation = job.generation, "skipping cancelled task");
        }
        shared.finish_one();
    }
}
