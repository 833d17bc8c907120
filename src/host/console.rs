//! Console host: runs a service in the foreground until Ctrl+C.

use crate::service::{ManagedService, ServiceError};
use std::sync::Arc;
use tracing::{error, info};

/// Start `service`, block until Ctrl+C stops it, and return its outcome.
pub fn run_console<S>(service: Arc<S>) -> Result<(), ServiceError>
where
    S: ManagedService + 'static,
{
    let stopper = Arc::clone(&service);
    ctrlc::set_handler(move || {
        info!("Interrupt received, stopping");
        // Runs on the signal-handling thread, never on the controlling one.
        if let Err(e) = stopper.on_stop() {
            error!(error = %e, "Stop failed");
        }
    })
    .map_err(|e| ServiceError::Host(e.to_string()))?;

    info!("Running in console mode (press Ctrl+C to stop)");
    service.on_start()?;
    let result = service.main_loop();

    // A worker failure ends main_loop without on_stop; tear down the rest.
    if result.is_err() {
        if let Err(e) = service.on_stop() {
            error!(error = %e, "Stop after failure did not complete cleanly");
        }
    }

    info!("Console mode finished");
    result
}
