//! Bounded worker pool
//!
//! A fixed set of named threads fed through a bounded crossbeam channel.
//! Submission never blocks: once `workers + backlog` jobs are outstanding
//! (running or waiting), `try_execute` refuses the job and the caller gets
//! the refusal as backpressure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::error::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters shared between the pool handle and its workers
///
/// `outstanding` is taken before a job is queued and released only after
/// the job has returned, so `outstanding == 0` means nothing is queued and
/// nothing is running.
#[derive(Debug, Default)]
struct Counters {
    outstanding: AtomicUsize,
    running: AtomicUsize,
}

/// Fixed-size thread pool with exact admission control
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    limit: usize,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one) accepting up to `backlog`
    /// waiting jobs on top of the ones running
    pub fn new(name: &str, workers: usize, backlog: usize) -> Result<Self> {
        let workers = workers.max(1);
        let limit = workers + backlog;
        let (sender, receiver) = channel::bounded::<Job>(limit);
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let thread_name = format!("{}-{}", name, i);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, receiver, counters))?;
            handles.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers: handles,
            counters,
            limit,
        })
    }

    /// Queue a job if there is room; false means it was not accepted
    pub fn try_execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };

        let limit = self.limit;
        let reserved = self
            .counters
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }

        match sender.try_send(Box::new(job)) {
            Ok(()) => true,
            Err(e) => {
                self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!(pool = %self.name, "failed to queue job: {}", e);
                false
            }
        }
    }

    /// True while another job would be accepted
    pub fn has_capacity(&self) -> bool {
        self.sender.is_some() && self.outstanding() < self.limit
    }

    /// True when nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Jobs queued or running
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::SeqCst)
    }

    /// Jobs currently executing
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    /// Maximum jobs outstanding at once
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs, let queued ones finish, and join the workers
    pub fn shutdown(&mut self) {
        // Closing the channel ends each worker's loop once the queue drains
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(thread_name: &str, receiver: Receiver<Job>, counters: Arc<Counters>) {
    for job in receiver.iter() {
        counters.running.fetch_add(1, Ordering::SeqCst);
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(worker = thread_name, "job panicked");
        }
        counters.running.fetch_sub(1, Ordering::SeqCst);
        counters.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
