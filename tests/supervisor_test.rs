mod common;

use common::{config_on, free_port, recording_supervisor, wait_for_state};
use sched_service::config::SchedulerSettings;
use sched_service::engine::{EngineError, SchedulerEngine};
use sched_service::runtime::LoopState;
use sched_service::supervisor::{
    RunOutcome, ServerSupervisor, StopOutcome, SupervisorError, SupervisorState,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn serves_on_configured_address() {
    let port = free_port("0.0.0.0");
    let (supervisor, probe) = recording_supervisor(config_on("0.0.0.0", port), Duration::ZERO);

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };
    wait_for_state(&supervisor, SupervisorState::Active);

    let expected: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    assert_eq!(supervisor.local_addr(), Some(expected));
    assert_eq!(supervisor.loop_state(), Some(LoopState::Running));
    assert_eq!(probe.started.load(std::sync::atomic::Ordering::SeqCst), 1);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("\"service\":\"NDSchedulerService\""));
    assert!(response.contains("\"engine\":\"recording\""));

    supervisor.stop().unwrap();
    assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Completed);
}

#[test]
fn stop_from_second_thread_stops_engine_first() {
    let (supervisor, probe) =
        recording_supervisor(config_on("127.0.0.1", 0), Duration::from_millis(50));

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };
    wait_for_state(&supervisor, SupervisorState::Active);
    *probe.loop_handle.lock().unwrap() = supervisor.loop_handle();

    let stopper = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.stop())
    };
    assert_eq!(stopper.join().unwrap().unwrap(), StopOutcome::Requested);
    assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Completed);

    // engine stop completed while the loop was still running
    assert_eq!(*probe.loop_state_at_stop.lock().unwrap(), Some(LoopState::Running));
    assert_eq!(probe.stops(), 1);
    assert_eq!(supervisor.loop_state(), Some(LoopState::Stopped));
    assert_eq!(supervisor.state(), SupervisorState::Retired);
}

#[test]
fn run_twice_is_a_noop() {
    let (supervisor, probe) = recording_supervisor(config_on("127.0.0.1", 0), Duration::ZERO);

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };
    wait_for_state(&supervisor, SupervisorState::Active);
    let addr = supervisor.local_addr();

    // returns at once instead of blocking or binding again
    assert_eq!(supervisor.run().unwrap(), RunOutcome::AlreadyActive);
    assert_eq!(supervisor.local_addr(), addr);
    assert_eq!(probe.builds(), 1);

    supervisor.stop().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn stop_twice_stops_engine_once() {
    let (supervisor, probe) = recording_supervisor(config_on("127.0.0.1", 0), Duration::ZERO);

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };
    wait_for_state(&supervisor, SupervisorState::Active);

    assert_eq!(supervisor.stop().unwrap(), StopOutcome::Requested);
    assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
    worker.join().unwrap().unwrap();
    assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);

    assert_eq!(probe.stops(), 1);
}

#[test]
fn concurrent_runs_bind_once() {
    let port = free_port("127.0.0.1");
    let (supervisor, probe) = recording_supervisor(config_on("127.0.0.1", port), Duration::ZERO);

    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();
    let racers: Vec<_> = (0..2)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            thread::spawn(move || {
                barrier.wait();
                let _ = tx.send(supervisor.run().map_err(|e| e.to_string()));
            })
        })
        .collect();

    // the loser returns while the winner is still serving
    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, Ok(RunOutcome::AlreadyActive));

    wait_for_state(&supervisor, SupervisorState::Active);
    supervisor.stop().unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, Ok(RunOutcome::Completed));

    for racer in racers {
        racer.join().unwrap();
    }
    assert_eq!(probe.builds(), 1);
    assert_eq!(probe.stops(), 1);
}

#[test]
fn posted_work_runs_on_loop_thread() {
    let (supervisor, _probe) = recording_supervisor(config_on("127.0.0.1", 0), Duration::ZERO);

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::Builder::new()
            .name("owner".into())
            .spawn(move || supervisor.run())
            .unwrap()
    };
    wait_for_state(&supervisor, SupervisorState::Active);

    let (tx, rx) = mpsc::channel();
    let handle = supervisor.loop_handle().unwrap();
    handle
        .post(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap().as_deref(),
        Some("owner")
    );

    supervisor.stop().unwrap();
    worker.join().unwrap().unwrap();
    assert_eq!(handle.state(), LoopState::Stopped);
    assert!(handle.stop().is_err());
}

struct FailingStopEngine;

impl SchedulerEngine for FailingStopEngine {
    fn name(&self) -> &str {
        "failing-stop"
    }

    fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        Err(EngineError::Failed("jobs still running".into()))
    }
}

#[test]
fn engine_stop_error_still_stops_loop() {
    let factory = |_: &SchedulerSettings| -> Result<Box<dyn SchedulerEngine>, EngineError> {
        Ok(Box::new(FailingStopEngine))
    };
    let supervisor = Arc::new(ServerSupervisor::new(config_on("127.0.0.1", 0), factory));

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };
    wait_for_state(&supervisor, SupervisorState::Active);
    let handle = supervisor.loop_handle().unwrap();

    let err = supervisor.stop().unwrap_err();
    assert!(matches!(err, SupervisorError::Engine(EngineError::Failed(_))));

    // the loop stop was posted regardless
    assert_eq!(worker.join().unwrap().unwrap(), RunOutcome::Completed);
    assert_eq!(handle.state(), LoopState::Stopped);
    assert_eq!(supervisor.state(), SupervisorState::Retired);
    assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
}
