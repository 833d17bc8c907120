//! Windows service host: runs the service under the Service Control Manager.

use crate::config::Config;
use crate::logging;
use crate::service::{
    ManagedService, ServiceController, ServiceError, ServiceStatus, StatusReporter,
};
use crate::supervisor::ServerSupervisor;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info};
use windows_service::{
    define_windows_service,
    service::{
        ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState,
        ServiceStatus as ScmStatus, ServiceType,
    },
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
};

const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;
const STOP_WAIT_HINT: Duration = Duration::from_secs(30);

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Hand the process to the SCM dispatcher.
///
/// Fails immediately when the process was not launched by the SCM, which
/// is how `main` decides to fall back to the console host.
pub fn run_dispatcher(config: Config) -> windows_service::Result<()> {
    let name = config.service.name.clone();
    let _ = CONFIG.set(config);
    service_dispatcher::start(name, ffi_service_main)
}

define_windows_service!(ffi_service_main, service_main);

fn service_main(_arguments: Vec<OsString>) {
    let Some(config) = CONFIG.get() else {
        return;
    };

    // No console under the SCM.
    let log_file = config.log_file.clone().unwrap_or_else(default_log_file);
    if let Err(e) = logging::init(&config.log_level, Some(&log_file)) {
        eprintln!("Failed to init service logging: {}", e);
        return;
    }
    info!(service = %config.service.name, "Service entry point started");

    if let Err(e) = run_service(config.clone()) {
        error!(error = %e, "Service error");
    }
}

/// Forwards status transitions to the SCM once the handle is registered.
struct ScmReporter {
    handle: Arc<OnceLock<ServiceStatusHandle>>,
}

impl StatusReporter for ScmReporter {
    fn report(&self, status: ServiceStatus) {
        let (current_state, controls_accepted, exit_code, wait_hint) = match status {
            ServiceStatus::Running => (
                ServiceState::Running,
                ServiceControlAccept::STOP,
                ServiceExitCode::Win32(0),
                Duration::default(),
            ),
            ServiceStatus::StopPending => (
                ServiceState::StopPending,
                ServiceControlAccept::empty(),
                ServiceExitCode::Win32(0),
                STOP_WAIT_HINT,
            ),
            ServiceStatus::Stopped { exit_code: 0 } => (
                ServiceState::Stopped,
                ServiceControlAccept::empty(),
                ServiceExitCode::Win32(0),
                Duration::default(),
            ),
            ServiceStatus::Stopped { exit_code } => (
                ServiceState::Stopped,
                ServiceControlAccept::empty(),
                ServiceExitCode::ServiceSpecific(exit_code),
                Duration::default(),
            ),
        };

        let Some(handle) = self.handle.get() else {
            return;
        };
        let result = handle.set_service_status(ScmStatus {
            service_type: SERVICE_TYPE,
            current_state,
            controls_accepted,
            exit_code,
            checkpoint: 0,
            wait_hint,
            process_id: None,
        });
        if let Err(e) = result {
            error!(error = %e, status = ?status, "Failed to report service status");
        }
    }
}

fn run_service(config: Config) -> Result<(), ServiceError> {
    let status_cell: Arc<OnceLock<ServiceStatusHandle>> = Arc::new(OnceLock::new());
    let reporter = Arc::new(ScmReporter {
        handle: Arc::clone(&status_cell),
    });
    let supervisor = Arc::new(ServerSupervisor::with_dispatch_pool(config));
    let controller = Arc::new(ServiceController::new(supervisor, reporter.clone()));
    let name = controller.name().to_string();

    let stopper = Arc::clone(&controller);
    let stop_reporter = Arc::clone(&reporter);
    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        match control_event {
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            ServiceControl::Stop => {
                // Report STOP_PENDING so the SCM waits, then join off the dispatcher thread.
                stop_reporter.report(ServiceStatus::StopPending);
                let stopper = Arc::clone(&stopper);
                std::thread::spawn(move || {
                    if let Err(e) = stopper.on_stop() {
                        error!(error = %e, "Stop failed");
                    }
                });
                ServiceControlHandlerResult::NoError
            }
            _ => ServiceControlHandlerResult::NotImplemented,
        }
    };

    let handle = service_control_handler::register(&name, event_handler)
        .map_err(|e| ServiceError::Host(e.to_string()))?;
    let _ = status_cell.set(handle);

    let result = controller
        .on_start()
        .and_then(|()| controller.main_loop());

    let exit_code = match &result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Service failed");
            if let Err(e) = controller.on_stop() {
                error!(error = %e, "Stop after failure did not complete cleanly");
            }
            e.exit_code()
        }
    };
    reporter.report(ServiceStatus::Stopped { exit_code });
    result
}

fn default_log_file() -> PathBuf {
    let program_data = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".into());
    [program_data, "sched-service".into(), "service.log".into()]
        .iter()
        .collect()
}
