//! Host-facing service controller.
//!
//! A managed-service host calls three things: a start handler that must
//! return quickly, a stop handler, and a main routine that blocks the
//! controlling thread until the service should exit. [`ServiceController`]
//! implements them on top of a [`ServerSupervisor`]: the blocking
//! `run()` happens on a dedicated `server` thread, and the controlling
//! thread parks on a [`StopEvent`].

use crate::supervisor::{RunOutcome, ServerSupervisor, StopOutcome, SupervisorError};
use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WORKER_THREAD_NAME: &str = "server";

/// Status transitions reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    StopPending,
    Stopped { exit_code: u32 },
}

/// Host callback receiving status transitions.
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: ServiceStatus);
}

impl<F> StatusReporter for F
where
    F: Fn(ServiceStatus) + Send + Sync,
{
    fn report(&self, status: ServiceStatus) {
        self(status)
    }
}

/// Reporter for hosts without a status channel: logs the transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, status: ServiceStatus) {
        info!(status = ?status, "Service status");
    }
}

/// The capability set a service host drives.
pub trait ManagedService: Send + Sync {
    /// Start the service. Must return promptly.
    fn on_start(&self) -> Result<(), ServiceError>;

    /// Stop the service. Returns once shutdown work is complete.
    fn on_stop(&self) -> Result<(), ServiceError>;

    /// Block the controlling thread until the service is told to exit.
    fn main_loop(&self) -> Result<(), ServiceError>;
}

/// Manual-reset event the controlling thread blocks on.
#[derive(Debug, Default)]
pub struct StopEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake every waiter.
    pub fn set(&self) {
        *self.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.lock()
    }

    /// Wait up to `timeout`; returns whether the event is signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.signaled.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs a [`ServerSupervisor`] as a host-managed service.
pub struct ServiceController {
    name: String,
    display_name: String,
    description: String,
    supervisor: Arc<ServerSupervisor>,
    stop_event: Arc<StopEvent>,
    poll_interval: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<ServiceError>>>,
    reporter: Arc<dyn StatusReporter>,
}

impl ServiceController {
    pub fn new(supervisor: Arc<ServerSupervisor>, reporter: Arc<dyn StatusReporter>) -> Self {
        let service = &supervisor.config().service;
        Self {
            name: service.name.clone(),
            display_name: service.display_name.clone(),
            description: service.description.clone(),
            poll_interval: service.poll_interval(),
            supervisor,
            stop_event: Arc::new(StopEvent::new()),
            worker: Mutex::new(None),
            failure: Arc::new(Mutex::new(None)),
            reporter,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn supervisor(&self) -> &Arc<ServerSupervisor> {
        &self.supervisor
    }

    pub fn stop_event(&self) -> &Arc<StopEvent> {
        &self.stop_event
    }

    /// Spawn the worker thread that runs the supervisor.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            debug!(service = %self.name, "Worker already started");
            return Ok(());
        }

        let supervisor = Arc::clone(&self.supervisor);
        let failure = Arc::clone(&self.failure);
        let stop_event = Arc::clone(&self.stop_event);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let cause = match panic::catch_unwind(AssertUnwindSafe(|| supervisor.run())) {
                    Ok(Ok(RunOutcome::Completed)) => {
                        debug!("Server worker finished");
                        return;
                    }
                    Ok(Ok(outcome)) => {
                        error!(outcome = ?outcome, "Server worker did not serve");
                        ServiceError::NotServed(outcome)
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "Server worker failed");
                        ServiceError::Server(e)
                    }
                    Err(payload) => {
                        error!(panic = panic_message(&*payload), "Server worker panicked");
                        ServiceError::WorkerPanicked
                    }
                };
                *failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(cause);
                // Unblock main_loop so the failure is escalated.
                stop_event.set();
            })
            .map_err(ServiceError::Spawn)?;

        *worker = Some(handle);
        Ok(())
    }

    /// Stop the supervisor and wait for the worker thread to exit.
    ///
    /// There is no timeout on the join; a loop that never returns is left
    /// to the host's watchdog.
    pub fn stop(&self) -> Result<(), ServiceError> {
        let stopped = self.supervisor.stop();
        match &stopped {
            Ok(StopOutcome::NotRunning) => debug!(service = %self.name, "Server was not running"),
            Ok(outcome) => debug!(service = %self.name, outcome = ?outcome, "Server stop requested"),
            Err(e) => warn!(service = %self.name, error = %e, "Server stop reported an error"),
        }

        self.join_worker()?;
        stopped.map(|_| ()).map_err(ServiceError::Server)
    }

    fn join_worker(&self) -> Result<(), ServiceError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => handle.join().map_err(|_| ServiceError::WorkerPanicked),
            None => Ok(()),
        }
    }
}

impl ManagedService for ServiceController {
    fn on_start(&self) -> Result<(), ServiceError> {
        info!(
            service = %self.name,
            display_name = %self.display_name,
            description = %self.description,
            "Start service"
        );
        self.start()?;
        self.reporter.report(ServiceStatus::Running);
        Ok(())
    }

    fn on_stop(&self) -> Result<(), ServiceError> {
        info!(service = %self.name, "Stop service");
        let stopped = self.stop();
        self.reporter.report(ServiceStatus::StopPending);
        self.stop_event.set();
        stopped
    }

    fn main_loop(&self) -> Result<(), ServiceError> {
        debug!(service = %self.name, "Service main");
        while !self.stop_event.wait_timeout(self.poll_interval) {}

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match failure {
            Some(e) => {
                self.join_worker()?;
                Err(e)
            }
            None => Ok(()),
        }
    }
}

/// Service controller errors
#[derive(Debug)]
pub enum ServiceError {
    /// Worker thread could not be spawned.
    Spawn(io::Error),
    /// The supervised server failed.
    Server(SupervisorError),
    /// Worker thread panicked.
    WorkerPanicked,
    /// The worker found the supervisor already busy or retired.
    NotServed(RunOutcome),
    /// Host integration failed.
    Host(String),
}

impl ServiceError {
    /// Service-specific exit code reported to the host.
    pub fn exit_code(&self) -> u32 {
        match self {
            ServiceError::Spawn(_) => 1,
            ServiceError::Server(SupervisorError::Resolve { .. })
            | ServiceError::Server(SupervisorError::Bind { .. }) => 2,
            ServiceError::Server(SupervisorError::Engine(_)) => 3,
            ServiceError::Server(SupervisorError::EventLoop(_)) => 4,
            ServiceError::WorkerPanicked => 5,
            ServiceError::Host(_) => 6,
            ServiceError::NotServed(_) => 7,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Spawn(e) => write!(f, "failed to spawn server thread: {}", e),
            ServiceError::Server(e) => write!(f, "server failed: {}", e),
            ServiceError::WorkerPanicked => write!(f, "server thread panicked"),
            ServiceError::Host(msg) => write!(f, "service host error: {}", msg),
            ServiceError::NotServed(outcome) => {
                write!(f, "server did not start serving: {:?}", outcome)
            }
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Spawn(e) => Some(e),
            ServiceError::Server(e) => Some(e),
            _ => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Instant;

    #[test]
    fn test_stop_event_times_out_until_set() {
        let event = StopEvent::new();
        assert!(!event.is_set());

        let started = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));

        event.set();
        assert!(event.is_set());
        // stays signaled for every later waiter
        assert!(event.wait_timeout(Duration::from_secs(5)));
        assert!(event.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_stop_event_wakes_waiter() {
        let event = Arc::new(StopEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_on_stop_before_start_unblocks_main() {
        let supervisor = Arc::new(ServerSupervisor::with_dispatch_pool(Config::default()));
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let reporter = move |status: ServiceStatus| sink.lock().unwrap().push(status);
        let controller = ServiceController::new(supervisor, Arc::new(reporter))
            .with_poll_interval(Duration::from_millis(10));

        controller.on_stop().unwrap();
        controller.main_loop().unwrap();
        assert_eq!(*reported.lock().unwrap(), vec![ServiceStatus::StopPending]);
    }

    #[test]
    fn test_identity_comes_from_config() {
        let mut config = Config::default();
        config.service.display_name = "Scheduler".into();
        config.service.description = "Runs scheduled jobs".into();
        let supervisor = Arc::new(ServerSupervisor::with_dispatch_pool(config));
        let controller = ServiceController::new(supervisor, Arc::new(LogReporter));

        assert_eq!(controller.name(), "NDSchedulerService");
        assert_eq!(controller.display_name(), "Scheduler");
        assert_eq!(controller.description(), "Runs scheduled jobs");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }

    #[test]
    fn test_exit_codes_distinguish_failures() {
        let bind = ServiceError::Server(SupervisorError::Bind {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        });
        assert_eq!(bind.exit_code(), 2);
        assert_eq!(ServiceError::WorkerPanicked.exit_code(), 5);
        assert_eq!(ServiceError::NotServed(RunOutcome::Retired).exit_code(), 7);
        assert!(bind.to_string().contains("127.0.0.1:1"));
    }
}
