//! mio event loop with a thread-safe control handle.
//!
//! The loop is created on, and only ever driven by, the thread that calls
//! [`EventLoop::run`]. Other threads hold a [`LoopHandle`]: messages go into
//! a channel and a `mio::Waker` interrupts the blocking poll so the loop
//! thread picks them up. Nothing outside the loop thread touches the poll
//! instance, the listener or the connections.
//!
//! ```text
//! Created ──run()──► Running ──Stop processed──► Stopping ──run() returns──► Stopped
//! ```

use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, ReadOutcome};
use crate::runtime::http::Response;
use crate::runtime::Application;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 256;
const LISTEN_BACKLOG: i32 = 1024;

/// Lifecycle of an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Created,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Created => "created",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Call(Callback),
    Stop,
}

/// The loop has stopped; nothing will consume the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopClosed;

impl fmt::Display for LoopClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("event loop is closed")
    }
}

impl std::error::Error for LoopClosed {}

/// Cross-thread handle to a running [`EventLoop`].
///
/// The only operations offered are posting work and requesting a stop;
/// both are delivered on the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    sender: Sender<Message>,
    waker: Arc<Waker>,
    state: Arc<SharedState>,
}

impl LoopHandle {
    /// Run `callback` on the loop thread.
    pub fn post<F>(&self, callback: F) -> Result<(), LoopClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Message::Call(Box::new(callback)))
    }

    /// Ask the loop to stop after draining what is already queued.
    pub fn stop(&self) -> Result<(), LoopClosed> {
        self.send(Message::Stop)
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    fn send(&self, message: Message) -> Result<(), LoopClosed> {
        if self.state.get() == LoopState::Stopped {
            return Err(LoopClosed);
        }
        self.sender.send(message).map_err(|_| LoopClosed)?;
        self.waker.wake().map_err(|_| LoopClosed)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("state", &self.state.get())
            .finish()
    }
}

/// Single-threaded readiness loop serving one listener.
///
/// Not `Send`: the thread that binds the loop is the thread that drives it.
pub struct EventLoop<A: Application> {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    receiver: Receiver<Message>,
    handle: LoopHandle,
    connections: ConnectionRegistry,
    app: A,
    _owner: PhantomData<*const ()>,
}

impl<A: Application> EventLoop<A> {
    /// Bind `addr` and prepare a loop in the `Created` state.
    pub fn bind(addr: SocketAddr, max_connections: usize, app: A) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let (sender, receiver) = mpsc::channel();
        let handle = LoopHandle {
            sender,
            waker,
            state: Arc::new(SharedState(AtomicU8::new(LoopState::Created as u8))),
        };

        debug!(addr = %local_addr, "Listener bound");

        Ok(Self {
            poll,
            listener,
            local_addr,
            receiver,
            handle,
            connections: ConnectionRegistry::new(max_connections),
            app,
            _owner: PhantomData,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drive the loop on the calling thread until a stop request is processed.
    ///
    /// The listener and all connections are closed before this returns, and
    /// the state is `Stopped` whether the loop ended by request or by error.
    pub fn run(mut self) -> io::Result<()> {
        self.handle.state.set(LoopState::Running);
        info!(addr = %self.local_addr, "Event loop running");

        let result = self.drive();

        let open = self.connections.len();
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        let state = Arc::clone(&self.handle.state);
        drop(self);
        state.set(LoopState::Stopped);

        info!(dropped_connections = open, "Event loop stopped");
        result
    }

    fn drive(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        // Messages posted before the loop started are already waiting.
        if self.drain_messages() {
            return Ok(());
        }

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut stop = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => stop |= self.drain_messages(),
                    Token(conn_id) => {
                        if let Err(e) = self.handle_connection_event(conn_id, event) {
                            debug!(conn_id, error = %e, "Connection error");
                            self.close_connection(conn_id);
                        }
                    }
                }
            }

            if stop {
                return Ok(());
            }
        }
    }

    /// Run queued callbacks; returns `true` once a stop request was seen.
    fn drain_messages(&mut self) -> bool {
        let mut stop = false;
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                Message::Call(callback) => callback(),
                Message::Stop => {
                    if !stop {
                        debug!("Stop request received");
                        self.handle.state.set(LoopState::Stopping);
                    }
                    stop = true;
                }
            }
        }
        stop
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Some(conn_id) = self.track_connection(Connection::new(stream, peer)) {
                        debug!(conn_id, peer = %peer, "Accepted connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    return;
                }
            }
        }
    }

    /// Insert into the registry and register for reads.
    ///
    /// A connection that cannot be tracked is dropped on its own; the
    /// loop keeps serving the others.
    fn track_connection(&mut self, conn: Connection) -> Option<usize> {
        let peer = conn.peer;
        let conn_id = match self.connections.insert(conn) {
            Ok(id) => id,
            Err(_) => {
                warn!(peer = %peer, "Connection limit reached");
                return None;
            }
        };

        // Re-borrow after insert
        let conn = self.connections.get_mut(conn_id)?;
        let registered =
            self.poll
                .registry()
                .register(&mut conn.stream, Token(conn_id), Interest::READABLE);
        if let Err(e) = registered {
            warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
            self.close_connection(conn_id);
            return None;
        }
        Some(conn_id)
    }

    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return Ok(());
        };

        if event.is_readable() && matches!(conn.state, ConnState::Reading) {
            let encoded = match conn.read_request()? {
                ReadOutcome::NeedData => return Ok(()),
                ReadOutcome::Closed => {
                    self.close_connection(conn_id);
                    return Ok(());
                }
                ReadOutcome::Malformed(reason) => {
                    debug!(conn_id, reason = %reason, "Malformed request");
                    Response::text(reason.status(), reason.reason()).encode()
                }
                ReadOutcome::Request(head) => {
                    debug!(conn_id, method = %head.method, path = %head.path, "Request");
                    let response = self.app.handle(&head);
                    if head.method == "HEAD" {
                        response.encode_head()
                    } else {
                        response.encode()
                    }
                }
            };

            let Some(conn) = self.connections.get_mut(conn_id) else {
                return Ok(());
            };
            conn.start_writing(encoded);
            if conn.flush()? {
                self.close_connection(conn_id);
            } else {
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
            }
            return Ok(());
        }

        if event.is_writable() && conn.flush()? {
            self.close_connection(conn_id);
        }

        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(conn_id, peer = %conn.peer, "Connection closed");
        }
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // On Windows SO_REUSEADDR lets a second process steal the port.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}
