//! Named asynchronous jobs on a fixed pool of worker threads.
//!
//! The orchestrator submits labelled jobs and later blocks on a label
//! pattern (`"FM.Grid.c0:*"`) until every matching job has reported back.
//! Errors and panics inside a job are captured and handed back as values at
//! that barrier.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::error::JobError;
use crate::gridder::{DegridStats, GridStats};
use crate::vis::ChunkHandle;

/// Work order. Carries only store paths and small plain values.
#[derive(Clone, Debug)]
pub enum JobRequest {
    InitKernel {
        facet: usize,
        cache_path: PathBuf,
        cache_valid: bool,
    },
    Grid {
        facet: usize,
        chunk: ChunkHandle,
    },
    Fft {
        facet: usize,
    },
    ModelTile {
        facet: usize,
    },
    Degrid {
        facet: usize,
        chunk: ChunkHandle,
    },
}

impl JobRequest {
    pub fn facet(&self) -> usize {
        match self {
            JobRequest::InitKernel { facet, .. }
            | JobRequest::Grid { facet, .. }
            | JobRequest::Fft { facet }
            | JobRequest::ModelTile { facet }
            | JobRequest::Degrid { facet, .. } => *facet,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobOutput {
    KernelReady { facet: usize },
    Gridded { facet: usize, stats: GridStats },
    Transformed { facet: usize },
    ModelTileReady { facet: usize },
    Degridded { facet: usize, stats: DegridStats },
}

pub trait JobHandler: Send + Sync {
    fn handle(&self, job: JobRequest) -> Result<JobOutput, String>;
}

pub type JobResult = (String, Result<JobOutput, JobError>);

/// Shared completion counter.
#[derive(Clone, Debug, Default)]
pub struct JobCounter {
    name: String,
    value: Arc<AtomicUsize>,
}

impl JobCounter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}

pub trait JobDispatch {
    fn register_handlers(&mut self, name: &str, handler: Arc<dyn JobHandler>);
    fn run_job(&mut self, label: &str, handler: &str, request: JobRequest) -> Result<(), JobError>;
    /// Blocks until every submitted job matching `pattern` has finished and
    /// returns their results in submission order.
    fn await_job_results(&mut self, pattern: &str) -> Vec<JobResult>;
    fn create_counter(&mut self, name: &str) -> JobCounter;
}

impl<T: JobDispatch + ?Sized> JobDispatch for &mut T {
    fn register_handlers(&mut self, name: &str, handler: Arc<dyn JobHandler>) {
        (**self).register_handlers(name, handler)
    }

    fn run_job(&mut self, label: &str, handler: &str, request: JobRequest) -> Result<(), JobError> {
        (**self).run_job(label, handler, request)
    }

    fn await_job_results(&mut self, pattern: &str) -> Vec<JobResult> {
        (**self).await_job_results(pattern)
    }

    fn create_counter(&mut self, name: &str) -> JobCounter {
        (**self).create_counter(name)
    }
}

/// `prefix*` matches by prefix, anything else must match exactly.
pub fn label_matches(pattern: &str, label: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => label.starts_with(prefix),
        None => pattern == label,
    }
}

struct Task {
    seq: u64,
    label: String,
    handler: Arc<dyn JobHandler>,
    request: JobRequest,
}

struct Finished {
    seq: u64,
    label: String,
    result: Result<JobOutput, JobError>,
}

pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    results: Receiver<Finished>,
    workers: Vec<JoinHandle<()>>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    counters: HashMap<String, JobCounter>,
    /// Submitted but not yet received, by sequence number.
    outstanding: BTreeMap<u64, String>,
    /// Received but not yet claimed by a barrier.
    finished: BTreeMap<u64, (String, Result<JobOutput, JobError>)>,
    next_seq: u64,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl WorkerPool {
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let (sender, receiver) = bounded::<Task>(4 * n_workers);
        let (result_tx, results) = unbounded::<Finished>();

        let mut workers = Vec::with_capacity(n_workers);
        for worker_id in 0..n_workers {
            let receiver = receiver.clone();
            let result_tx = result_tx.clone();
            let handle = std::thread::spawn(move || {
                debug!("worker {worker_id} started");
                while let Ok(task) = receiver.recv() {
                    let Task {
                        seq,
                        label,
                        handler,
                        request,
                    } = task;
                    let result = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
                        Ok(Ok(out)) => Ok(out),
                        Ok(Err(message)) => Err(JobError::Failed {
                            label: label.clone(),
                            message,
                        }),
                        Err(payload) => Err(JobError::Panicked {
                            label: label.clone(),
                            message: panic_message(payload.as_ref()),
                        }),
                    };
                    if result_tx.send(Finished { seq, label, result }).is_err() {
                        break;
                    }
                }
                debug!("worker {worker_id} shutting down");
            });
            workers.push(handle);
        }
        info!("started {n_workers} workers");

        WorkerPool {
            sender: Some(sender),
            results,
            workers,
            handlers: HashMap::new(),
            counters: HashMap::new(),
            outstanding: BTreeMap::new(),
            finished: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn n_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn n_outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!("worker {worker_id} terminated abnormally");
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl JobDispatch for WorkerPool {
    fn register_handlers(&mut self, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    fn run_job(&mut self, label: &str, handler: &str, request: JobRequest) -> Result<(), JobError> {
        let h = self
            .handlers
            .get(handler)
            .cloned()
            .ok_or_else(|| JobError::UnknownHandler {
                label: label.to_string(),
                handler: handler.to_string(),
            })?;
        let sender = self.sender.as_ref().ok_or(JobError::PoolClosed)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        sender
            .send(Task {
                seq,
                label: label.to_string(),
                handler: h,
                request,
            })
            .map_err(|_| JobError::PoolClosed)?;
        self.outstanding.insert(seq, label.to_string());
        Ok(())
    }

    fn await_job_results(&mut self, pattern: &str) -> Vec<JobResult> {
        while self
            .outstanding
            .values()
            .any(|label| label_matches(pattern, label))
        {
            match self.results.recv() {
                Ok(done) => {
                    self.outstanding.remove(&done.seq);
                    self.finished.insert(done.seq, (done.label, done.result));
                }
                Err(_) => {
                    // every worker is gone; fail what is still pending
                    for (seq, label) in std::mem::take(&mut self.outstanding) {
                        self.finished.insert(seq, (label.clone(), Err(JobError::PoolClosed)));
                    }
                }
            }
        }
        let matching: Vec<u64> = self
            .finished
            .iter()
            .filter(|(_, (label, _))| label_matches(pattern, label))
            .map(|(seq, _)| *seq)
            .collect();
        matching
            .into_iter()
            .filter_map(|seq| self.finished.remove(&seq))
            .collect()
    }

    fn create_counter(&mut self, name: &str) -> JobCounter {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| JobCounter {
                name: name.to_string(),
                value: Arc::new(AtomicUsize::new(0)),
            })
            .clone()
    }
}
