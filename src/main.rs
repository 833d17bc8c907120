//! sched-service: job scheduler web server as a managed service.
//!
//! - Launched by the Windows Service Control Manager: runs as a service.
//! - Otherwise: runs in the foreground until Ctrl+C.
//!
//! Configuration via CLI arguments or TOML file.

use sched_service::config::Config;
use sched_service::host;
use sched_service::logging;
use sched_service::service::{LogReporter, ServiceController};
use sched_service::supervisor::ServerSupervisor;
use std::sync::Arc;
use tracing::{error, info};

fn main() {
    if let Err(code) = run() {
        std::process::exit(code);
    }
}

fn run() -> Result<(), i32> {
    // Load configuration
    let config = Config::load().map_err(|e| {
        eprintln!("{}", e);
        2
    })?;

    #[cfg(windows)]
    let config = match host::windows::run_dispatcher(config.clone()) {
        Ok(()) => return Ok(()),
        Err(_) => config,
    };

    run_console(config)
}

fn run_console(config: Config) -> Result<(), i32> {
    // Initialize logging
    if let Err(e) = logging::init(&config.log_level, config.log_file.as_deref()) {
        eprintln!("Failed to init logging: {}", e);
        return Err(1);
    }

    info!(
        service = %config.service.name,
        listen = %config.listen_display(),
        scheduler = %config.scheduler.scheduler_class,
        datastore = %config.scheduler.datastore_class,
        thread_pool_size = config.scheduler.thread_pool_size,
        timezone = %config.scheduler.timezone,
        "Starting scheduler service"
    );

    let supervisor = Arc::new(ServerSupervisor::with_dispatch_pool(config));
    let controller = Arc::new(ServiceController::new(supervisor, Arc::new(LogReporter)));

    host::run_console(controller).map_err(|e| {
        error!(error = %e, "Service exited with failure");
        e.exit_code() as i32
    })
}
