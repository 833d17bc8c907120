//! Fixed-size dispatch pool.
//!
//! Named worker threads pull jobs from a shared channel. Dropping the sender
//! closes the channel; every worker finishes the job it holds, sees the
//! disconnect and exits, and `stop()` joins them all.

use super::{EngineError, EngineFactory, SchedulerEngine};
use crate::config::SchedulerSettings;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A unit of work run on a dispatch thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const REQUIRED_TABLES: [&str; 3] = [
    "jobs_tablename",
    "executions_tablename",
    "auditlogs_tablename",
];

/// Default engine: runs submitted jobs on `thread_pool_size` threads.
pub struct DispatchPool {
    settings: SchedulerSettings,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    executed: Arc<AtomicU64>,
}

impl DispatchPool {
    /// Validate settings and build a stopped pool.
    pub fn new(settings: &SchedulerSettings) -> Result<Self, EngineError> {
        validate(settings)?;
        Ok(Self {
            settings: settings.clone(),
            sender: None,
            workers: Vec::new(),
            executed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Queue a job for the next free dispatch thread.
    pub fn submit(&self, job: Job) -> Result<(), EngineError> {
        let sender = self.sender.as_ref().ok_or(EngineError::NotRunning)?;
        sender.send(job).map_err(|_| EngineError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Jobs completed (or panicked) since construction.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }
}

impl SchedulerEngine for DispatchPool {
    fn name(&self) -> &str {
        &self.settings.scheduler_class
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.sender.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..self.settings.thread_pool_size {
            let receiver = Arc::clone(&receiver);
            let executed = Arc::clone(&self.executed);
            let spawned = thread::Builder::new()
                .name(format!("dispatch-{id}"))
                .spawn(move || dispatch_loop(id, receiver, executed));

            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    // Unwind the threads already running before reporting.
                    drop(sender);
                    self.join_workers();
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        self.sender = Some(sender);
        info!(
            threads = self.settings.thread_pool_size,
            datastore = %self.settings.datastore_class,
            timezone = %self.settings.timezone,
            "Scheduler dispatch started"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if self.sender.take().is_none() {
            return Ok(());
        }
        self.join_workers();
        info!(executed = self.executed(), "Scheduler dispatch stopped");
        Ok(())
    }
}

impl DispatchPool {
    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Dispatch thread panicked");
            }
        }
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn dispatch_loop(id: usize, receiver: Arc<Mutex<Receiver<Job>>>, executed: Arc<AtomicU64>) {
    debug!(thread = id, "Dispatch thread started");
    loop {
        // The guard is dropped before the job runs so other threads can pick up work.
        let next = {
            let guard = receiver.lock().unwrap_or_else(|e| e.into_inner());
            guard.recv()
        };
        let job = match next {
            Ok(job) => job,
            Err(_) => break,
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(thread = id, "Job panicked");
        }
        executed.fetch_add(1, Ordering::AcqRel);
    }
    debug!(thread = id, "Dispatch thread exiting");
}

fn validate(settings: &SchedulerSettings) -> Result<(), EngineError> {
    if settings.scheduler_class.trim().is_empty() {
        return Err(EngineError::Misconfigured("scheduler_class is empty".into()));
    }
    if settings.datastore_class.trim().is_empty() {
        return Err(EngineError::Misconfigured("datastore_class is empty".into()));
    }
    if settings.datastore.is_empty() {
        return Err(EngineError::Misconfigured(
            "datastore has no connection parameters".into(),
        ));
    }
    if let Some(missing) = REQUIRED_TABLES
        .iter()
        .find(|key| !settings.tablenames.contains_key(**key))
    {
        return Err(EngineError::Misconfigured(format!(
            "tablenames is missing '{}'",
            missing
        )));
    }
    if settings.thread_pool_size == 0 {
        return Err(EngineError::Misconfigured(
            "thread_pool_size must be at least 1".into(),
        ));
    }
    if settings.job_max_instances == 0 {
        return Err(EngineError::Misconfigured(
            "job_max_instances must be at least 1".into(),
        ));
    }
    if settings.timezone.trim().is_empty() {
        return Err(EngineError::Misconfigured("timezone is empty".into()));
    }
    Ok(())
}

/// Factory producing [`DispatchPool`] engines.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchPoolFactory;

impl EngineFactory for DispatchPoolFactory {
    fn build(&self, settings: &SchedulerSettings) -> Result<Box<dyn SchedulerEngine>, EngineError> {
        Ok(Box::new(DispatchPool::new(settings)?))
    }
}
