//! Server lifecycle supervisor.
//!
//! Owns the single scheduler-engine + web-server pair for the process.
//! `run()` builds, starts and serves on the calling thread until the event
//! loop stops; `stop()` may be called from any other thread. Both are
//! idempotent.
//!
//! Lifecycle slot:
//!
//! ```text
//! Idle ──run()──► Starting ──published──► Active ──stop()──► Stopping ──loop returns──► Retired
//!   ▲                │
//!   └─start failure──┘
//! ```
//!
//! A supervisor serves exactly one start/stop cycle. A host that needs to
//! serve again starts a new process.

use crate::config::Config;
use crate::engine::{DispatchPoolFactory, EngineError, EngineFactory, SchedulerEngine};
use crate::runtime::{EventLoop, LoopHandle, LoopState, StatusApplication};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use tracing::{debug, error, info, warn};

/// Observable lifecycle phase of a [`ServerSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Active,
    Stopping,
    Retired,
}

/// What a call to [`ServerSupervisor::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Served until stopped.
    Completed,
    /// Another caller is already starting or serving; nothing was done.
    AlreadyActive,
    /// The single cycle already finished; nothing was done.
    Retired,
}

/// What a call to [`ServerSupervisor::stop`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Engine stopped and loop stop posted.
    Requested,
    /// Startup in progress; the stop is applied as soon as the server is up.
    Pending,
    /// Nothing was running.
    NotRunning,
}

struct ActiveServer {
    engine: Box<dyn SchedulerEngine>,
    handle: LoopHandle,
    local_addr: SocketAddr,
}

enum Slot {
    Idle,
    Starting { stop_requested: bool },
    Active(ActiveServer),
    Stopping { handle: LoopHandle, local_addr: SocketAddr },
    Retired { local_addr: Option<SocketAddr> },
}

/// Supervises one scheduler engine and the event loop serving its web front.
///
/// Shared between the service controller and the worker thread via `Arc`.
pub struct ServerSupervisor {
    config: Config,
    factory: Box<dyn EngineFactory>,
    slot: Mutex<Slot>,
}

impl ServerSupervisor {
    pub fn new(config: Config, factory: impl EngineFactory + 'static) -> Self {
        Self {
            config,
            factory: Box::new(factory),
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Supervisor using the built-in dispatch pool engine.
    pub fn with_dispatch_pool(config: Config) -> Self {
        Self::new(config, DispatchPoolFactory)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the engine, bind the listener and serve until stopped.
    ///
    /// Blocks the calling thread for the whole active lifetime. Returns
    /// immediately with a no-op outcome if a server is already starting,
    /// serving, or has already served.
    pub fn run(&self) -> Result<RunOutcome, SupervisorError> {
        {
            let mut slot = self.lock();
            match *slot {
                Slot::Idle => *slot = Slot::Starting { stop_requested: false },
                Slot::Retired { .. } => {
                    debug!("Server already served its cycle, ignoring run");
                    return Ok(RunOutcome::Retired);
                }
                _ => {
                    debug!("Server already active, ignoring run");
                    return Ok(RunOutcome::AlreadyActive);
                }
            }
        }

        let _unwind = UnwindGuard(self);

        let event_loop = match self.start_server() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                *self.lock() = Slot::Idle;
                error!(error = %e, "Server failed to start");
                return Err(e);
            }
        };
        let local_addr = event_loop.local_addr();

        let result = event_loop.run();

        // The engine is still here only if the loop ended without stop().
        let leftover = match std::mem::replace(
            &mut *self.lock(),
            Slot::Retired {
                local_addr: Some(local_addr),
            },
        ) {
            Slot::Active(active) => Some(active.engine),
            _ => None,
        };
        if let Some(mut engine) = leftover {
            warn!("Event loop exited without a stop request, stopping scheduler");
            if let Err(e) = engine.stop() {
                error!(error = %e, "Scheduler failed to stop");
            }
        }

        match result {
            Ok(()) => {
                info!(addr = %local_addr, "Server stopped");
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                error!(error = %e, "Event loop failed");
                Err(SupervisorError::EventLoop(e))
            }
        }
    }

    fn start_server(&self) -> Result<EventLoop<StatusApplication>, SupervisorError> {
        let addr = self.resolve_listen_addr()?;

        // Misconfiguration surfaces here, before the port is taken.
        let mut engine = self
            .factory
            .build(&self.config.scheduler)
            .map_err(SupervisorError::Engine)?;
        engine.start().map_err(SupervisorError::Engine)?;

        let app = StatusApplication::new(self.config.service.name.clone(), engine.name());
        let event_loop = match EventLoop::bind(addr, self.config.max_connections, app) {
            Ok(event_loop) => event_loop,
            Err(source) => {
                if let Err(e) = engine.stop() {
                    warn!(error = %e, "Scheduler failed to stop after bind failure");
                }
                return Err(SupervisorError::Bind { addr, source });
            }
        };

        let handle = event_loop.handle();
        let local_addr = event_loop.local_addr();
        info!(addr = %local_addr, engine = engine.name(), "Running server");
        info!(
            "*** You can access scheduler web ui at http://localhost:{} ***",
            local_addr.port()
        );

        let mut slot = self.lock();
        if matches!(*slot, Slot::Starting { stop_requested: true }) {
            *slot = Slot::Stopping {
                handle: handle.clone(),
                local_addr,
            };
            drop(slot);

            info!("Stop was requested during startup");
            if let Err(e) = engine.stop() {
                error!(error = %e, "Scheduler failed to stop");
            }
            let _ = handle.stop();
        } else {
            *slot = Slot::Active(ActiveServer {
                engine,
                handle,
                local_addr,
            });
        }

        Ok(event_loop)
    }

    /// Stop the scheduler, then ask the event loop to stop.
    ///
    /// Safe to call from any thread and any number of times. The loop is
    /// only ever reached through its handle.
    pub fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let mut slot = self.lock();
        let active = match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Active(active) => active,
            Slot::Starting { .. } => {
                *slot = Slot::Starting {
                    stop_requested: true,
                };
                debug!("Stop deferred until startup completes");
                return Ok(StopOutcome::Pending);
            }
            other => {
                *slot = other;
                debug!("Server not running, ignoring stop");
                return Ok(StopOutcome::NotRunning);
            }
        };

        let ActiveServer {
            mut engine,
            handle,
            local_addr,
        } = active;
        *slot = Slot::Stopping {
            handle: handle.clone(),
            local_addr,
        };
        drop(slot);

        info!(addr = %local_addr, "Stopping server");

        // Dispatch must be down before the loop is told to stop.
        let stopped = engine.stop();
        drop(engine);
        if handle.stop().is_err() {
            debug!("Event loop already closed");
        }

        stopped.map_err(SupervisorError::Engine)?;
        Ok(StopOutcome::Requested)
    }

    pub fn state(&self) -> SupervisorState {
        match *self.lock() {
            Slot::Idle => SupervisorState::Idle,
            Slot::Starting { .. } => SupervisorState::Starting,
            Slot::Active(_) => SupervisorState::Active,
            Slot::Stopping { .. } => SupervisorState::Stopping,
            Slot::Retired { .. } => SupervisorState::Retired,
        }
    }

    /// Event loop phase, once a loop exists.
    pub fn loop_state(&self) -> Option<LoopState> {
        match &*self.lock() {
            Slot::Active(active) => Some(active.handle.state()),
            Slot::Stopping { handle, .. } => Some(handle.state()),
            Slot::Retired {
                local_addr: Some(_),
            } => Some(LoopState::Stopped),
            _ => None,
        }
    }

    /// Handle to the running loop, for posting work onto it.
    pub fn loop_handle(&self) -> Option<LoopHandle> {
        match &*self.lock() {
            Slot::Active(active) => Some(active.handle.clone()),
            Slot::Stopping { handle, .. } => Some(handle.clone()),
            _ => None,
        }
    }

    /// Address the listener is (or was) bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            Slot::Active(active) => Some(active.local_addr),
            Slot::Stopping { local_addr, .. } => Some(*local_addr),
            Slot::Retired { local_addr } => *local_addr,
            _ => None,
        }
    }

    /// Leave the slot usable after a panic unwound out of `run()`.
    ///
    /// A panic during startup returns the slot to `Idle`; one while serving
    /// stops the engine it left behind and retires the slot.
    fn recover_from_panic(&self) {
        let leftover = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Starting { .. } => None,
                Slot::Active(active) => {
                    *slot = Slot::Retired {
                        local_addr: Some(active.local_addr),
                    };
                    Some(active.engine)
                }
                Slot::Stopping { local_addr, .. } => {
                    *slot = Slot::Retired {
                        local_addr: Some(local_addr),
                    };
                    None
                }
                other => {
                    *slot = other;
                    None
                }
            }
        };
        error!("Server panicked, lifecycle slot released");

        if let Some(mut engine) = leftover {
            // A second panic while unwinding would abort the process.
            match panic::catch_unwind(AssertUnwindSafe(|| engine.stop())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Scheduler failed to stop"),
                Err(_) => error!("Scheduler panicked while stopping"),
            }
        }
    }

    fn resolve_listen_addr(&self) -> Result<SocketAddr, SupervisorError> {
        let address = self.config.listen_display();
        let resolve_error = |source: io::Error| SupervisorError::Resolve {
            address: address.clone(),
            source,
        };
        (self.config.address.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(resolve_error)?
            .next()
            .ok_or_else(|| {
                resolve_error(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address resolved to nothing",
                ))
            })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases the lifecycle slot if `run()` unwinds.
struct UnwindGuard<'a>(&'a ServerSupervisor);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.recover_from_panic();
        }
    }
}

/// Supervisor errors
#[derive(Debug)]
pub enum SupervisorError {
    /// Listen address could not be resolved.
    Resolve { address: String, source: io::Error },
    /// Engine construction, start or stop failed.
    Engine(EngineError),
    /// Listener could not be bound.
    Bind { addr: SocketAddr, source: io::Error },
    /// The event loop failed while serving.
    EventLoop(io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Resolve { address, source } => {
                write!(f, "cannot resolve listen address '{}': {}", address, source)
            }
            SupervisorError::Engine(e) => write!(f, "{}", e),
            SupervisorError::Bind { addr, source } => {
                write!(f, "cannot bind {}: {}", addr, source)
            }
            SupervisorError::EventLoop(e) => write!(f, "event loop failed: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Resolve { source, .. } => Some(source),
            SupervisorError::Engine(e) => Some(e),
            SupervisorError::Bind { source, .. } => Some(source),
            SupervisorError::EventLoop(e) => Some(e),
        }
    }
}
