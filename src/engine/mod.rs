//! Scheduler engine seam.
//!
//! The supervisor drives an engine through two calls: `start()` begins
//! dispatching due jobs, `stop()` halts dispatch and releases whatever the
//! engine holds (datastore connection, threads). Job persistence and
//! trigger logic live behind this trait.

mod dispatch;

pub use dispatch::{DispatchPool, DispatchPoolFactory, Job};

use crate::config::SchedulerSettings;
use std::fmt;

/// A job-dispatching engine driven by the supervisor.
pub trait SchedulerEngine: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Begin dispatching jobs.
    fn start(&mut self) -> Result<(), EngineError>;

    /// Halt dispatch. Must not return until no job can start anymore.
    fn stop(&mut self) -> Result<(), EngineError>;
}

/// Builds an engine from the pass-through scheduler settings.
///
/// Construction is where misconfiguration must surface, before the
/// supervisor binds its listener.
pub trait EngineFactory: Send + Sync {
    fn build(&self, settings: &SchedulerSettings) -> Result<Box<dyn SchedulerEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(&SchedulerSettings) -> Result<Box<dyn SchedulerEngine>, EngineError> + Send + Sync,
{
    fn build(&self, settings: &SchedulerSettings) -> Result<Box<dyn SchedulerEngine>, EngineError> {
        self(settings)
    }
}

/// Scheduler engine errors
#[derive(Debug)]
pub enum EngineError {
    /// Settings rejected at construction.
    Misconfigured(String),
    /// Dispatch thread could not be spawned.
    Spawn(std::io::Error),
    /// Engine is not dispatching.
    NotRunning,
    /// Engine-specific start/stop failure.
    Failed(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Misconfigured(msg) => write!(f, "scheduler misconfigured: {}", msg),
            EngineError::Spawn(e) => write!(f, "failed to spawn dispatch thread: {}", e),
            EngineError::NotRunning => write!(f, "scheduler is not running"),
            EngineError::Failed(msg) => write!(f, "scheduler failure: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}
