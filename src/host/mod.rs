//! Service hosts: whatever delivers start/stop to a [`ManagedService`].
//!
//! [`ManagedService`]: crate::service::ManagedService

mod console;
#[cfg(windows)]
pub mod windows;

pub use console::run_console;
