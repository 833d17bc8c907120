//! Shared fakes for lifecycle tests.

#![allow(dead_code)]

use sched_service::config::{Config, SchedulerSettings};
use sched_service::engine::{EngineError, SchedulerEngine};
use sched_service::runtime::{LoopHandle, LoopState};
use sched_service::supervisor::{ServerSupervisor, SupervisorState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Records what the supervisor did to the engines it built.
#[derive(Default)]
pub struct Probe {
    pub built: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    /// Set by the test once the loop exists; read by the engine's stop().
    pub loop_handle: Mutex<Option<LoopHandle>>,
    /// Loop state observed when engine stop() finished.
    pub loop_state_at_stop: Mutex<Option<LoopState>>,
}

impl Probe {
    pub fn stops(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

pub struct RecordingEngine {
    probe: Arc<Probe>,
    stop_delay: Duration,
}

impl SchedulerEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        // Give a wrongly ordered loop stop time to land before we look.
        thread::sleep(self.stop_delay);
        let state = self
            .probe
            .loop_handle
            .lock()
            .unwrap()
            .as_ref()
            .map(LoopHandle::state);
        *self.probe.loop_state_at_stop.lock().unwrap() = state;
        self.probe.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Supervisor whose engines report into the returned probe.
pub fn recording_supervisor(config: Config, stop_delay: Duration) -> (Arc<ServerSupervisor>, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let factory_probe = Arc::clone(&probe);
    let factory = move |_: &SchedulerSettings| -> Result<Box<dyn SchedulerEngine>, EngineError> {
        factory_probe.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingEngine {
            probe: Arc::clone(&factory_probe),
            stop_delay,
        }))
    };
    (Arc::new(ServerSupervisor::new(config, factory)), probe)
}

pub fn config_on(address: &str, port: u16) -> Config {
    Config {
        address: address.to_string(),
        port,
        ..Config::default()
    }
}

/// A port that was free a moment ago.
pub fn free_port(address: &str) -> u16 {
    let listener = std::net::TcpListener::bind((address, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn wait_for_state(supervisor: &ServerSupervisor, state: SupervisorState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while supervisor.state() != state {
        assert!(
            Instant::now() < deadline,
            "supervisor stuck in {:?}, expected {:?}",
            supervisor.state(),
            state
        );
        thread::sleep(Duration::from_millis(5));
    }
}
