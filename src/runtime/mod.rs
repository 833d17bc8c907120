//! Event loop runtime for the scheduler web server.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS, IOCP on
//! Windows). One loop owns the listener and every accepted connection;
//! other threads reach it only through a [`LoopHandle`].

mod connection;
mod event_loop;
pub mod http;
mod status;

pub use event_loop::{EventLoop, LoopClosed, LoopHandle, LoopState};
pub use status::StatusApplication;

use self::http::{RequestHead, Response};

/// Produces the response for each request the loop receives.
///
/// Called on the loop thread only.
pub trait Application {
    fn handle(&mut self, request: &RequestHead) -> Response;
}

impl<F> Application for F
where
    F: FnMut(&RequestHead) -> Response,
{
    fn handle(&mut self, request: &RequestHead) -> Response {
        self(request)
    }
}
