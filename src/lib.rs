//! sched-service: runs a job-scheduler web server as a host-managed service.
//!
//! - [`supervisor`]: single start/stop cycle of scheduler engine + web server
//! - [`service`]: host-facing controller (start handler, stop handler, main wait)
//! - [`runtime`]: mio event loop the server runs on
//! - [`engine`]: scheduler engine seam and the built-in dispatch pool
//! - [`host`]: console and Windows service hosts

pub mod config;
pub mod engine;
pub mod host;
pub mod logging;
pub mod runtime;
pub mod service;
pub mod supervisor;
