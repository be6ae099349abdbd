//! Execution strategies for per-packet work.
//!
//! The reactor hands every received packet to a [`Dispatcher`] as a boxed
//! closure. [`Dispatcher::Inline`] runs it on the reactor thread;
//! [`Dispatcher::Pooled`] queues it for a fixed set of worker threads fed
//! through a crossbeam channel.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use clap::ValueEnum;
use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

/// Default number of worker threads for the pooled dispatcher.
pub const DEFAULT_WORKERS: usize = 2;

/// A unit of work, normally "handle one packet and send the reply".
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DispatcherKind {
    /// Handle packets on the reactor thread.
    Inline,
    /// Handle packets on a fixed-size worker pool.
    Pooled,
}

impl fmt::Display for DispatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Pooled => f.write_str("pooled"),
        }
    }
}

pub enum Dispatcher {
    Inline,
    Pooled(WorkerPool),
}

impl Dispatcher {
    /// Builds the dispatcher for `kind`; `workers` is ignored for inline.
    pub fn new(kind: DispatcherKind, workers: usize) -> io::Result<Self> {
        match kind {
            DispatcherKind::Inline => Ok(Self::Inline),
            DispatcherKind::Pooled => WorkerPool::new(workers).map(Self::Pooled),
        }
    }

    pub fn kind(&self) -> DispatcherKind {
        match self {
            Self::Inline => DispatcherKind::Inline,
            Self::Pooled(_) => DispatcherKind::Pooled,
        }
    }

    /// Runs or schedules `task`. A panicking task is logged and discarded.
    pub fn submit(&self, task: Task) {
        match self {
            Self::Inline => run_task(task),
            Self::Pooled(pool) => pool.submit(task),
        }
    }

    /// Waits for outstanding work to finish. Later calls return immediately.
    pub fn stop(&self) {
        if let Self::Pooled(pool) = self {
            pool.stop();
        }
    }
}

/// Fixed-size thread pool draining an unbounded task queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `size` named worker threads. Zero is rejected.
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one thread",
            ));
        }

        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("kv-worker-{id}"))
                .spawn(move || {
                    // recv keeps yielding queued tasks after the sender is gone.
                    while let Ok(task) = receiver.recv() {
                        run_task(task);
                    }
                    debug!(worker = id, "worker exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues `task` for the next idle worker. Dropped with a warning once
    /// the pool has been stopped.
    pub fn submit(&self, task: Task) {
        match lock(&self.sender).as_ref() {
            Some(sender) => {
                if sender.send(task).is_err() {
                    warn!("worker pool queue closed, dropping task");
                }
            }
            None => warn!("worker pool stopped, dropping task"),
        }
    }

    /// Closes the queue and joins every worker once it has drained.
    pub fn stop(&self) {
        lock(&self.sender).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_task(task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(%message, "task panicked, packet dropped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
