//! Connection state machine for HTTP clients of the event loop.
//!
//! Each connection reads a request head, writes exactly one response and
//! is closed.

use crate::runtime::http::{parse_request_head, ParseError, ParseResult, RequestHead};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

const READ_CHUNK: usize = 4 * 1024;

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Accumulating the request head.
    Reading,
    /// Writing the response.
    Writing {
        response: Bytes,
        /// Bytes already written.
        written: usize,
    },
    /// Response flushed or peer gone.
    Closing,
}

/// Outcome of draining a readable socket.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    NeedData,
    Request(RequestHead),
    Malformed(ParseError),
    Closed,
}

/// A single client connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    buf: BytesMut,
}

impl Connection {
    /// Create a new connection in initial reading state.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Reading,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read until the socket would block, then look for a full request head.
    pub fn read_request(&mut self) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(match parse_request_head(&self.buf) {
            ParseResult::NeedData => ReadOutcome::NeedData,
            ParseResult::Complete(head) => ReadOutcome::Request(head),
            ParseResult::Error(reason) => ReadOutcome::Malformed(reason),
        })
    }

    /// Transition to writing state.
    pub fn start_writing(&mut self, response: Bytes) {
        self.buf.clear();
        self.state = ConnState::Writing {
            response,
            written: 0,
        };
    }

    /// Write as much of the pending response as the socket accepts.
    ///
    /// Returns `true` once the whole response is written.
    pub fn flush(&mut self) -> io::Result<bool> {
        let ConnState::Writing { response, written } = &mut self.state else {
            return Ok(true);
        };

        while *written < response.len() {
            match self.stream.write(&response[*written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => *written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.state = ConnState::Closing;
        Ok(true)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.connections.drain()
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
