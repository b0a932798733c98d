//! Per-socket state machine.
//!
//! ```text
//!  Initial ─establish─▶ Connecting ─on_connect ok─▶ Established ─close─▶ Closing
//!                           │                           │                  │
//!                           └──────── destroy ──────────┴──── drained ─────┴─▶ Closed
//! ```
//!
//! Connections live in the worker's [`ConnectionTable`]. Each reactor callback
//! checks its connection out of the table, runs one operation and puts it
//! back unless the operation destroyed it, so a destroyed connection leaves
//! the table exactly once.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    io::{self, Read, Write},
    mem,
    net::{IpAddr, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::Arc,
};

use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::{
    error::{is_peer_reset, Hook, NetworkError, Result},
    event::Direction,
    logger::{LogLevel, Logger},
    protocol::{Decoded, Framer, Protocol},
};

use super::{config::ServerConfig, handler::Handler, NetReactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reads per readiness event before yielding to other connections.
const READ_BUDGET: usize = 16;

enum Chunk {
    Data,
    Interrupted,
    Drained,
    Eof,
    Failed(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Initial,
    Connecting,
    Established,
    Closing,
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    stream: Option<TcpStream>,
    fd: RawFd,
    local: SocketAddr,
    remote: SocketAddr,
    status: Status,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    framer: Framer,
    paused: bool,
    delivering: bool,
    read_chunk: usize,
    protocol: Option<Arc<dyn Protocol>>,
    handler: Rc<dyn Handler>,
    logger: Arc<dyn Logger>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        remote: SocketAddr,
        handler: Rc<dyn Handler>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        let local = stream.local_addr()?;
        Ok(Self {
            id,
            fd: stream.as_raw_fd(),
            stream: Some(stream),
            local,
            remote,
            status: Status::Initial,
            inbound: Vec::new(),
            outbound: Vec::new(),
            framer: Framer::new(),
            paused: false,
            delivering: false,
            read_chunk: config.read_chunk.max(1),
            protocol: config.protocol.clone(),
            handler,
            logger: Arc::clone(&config.logger),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Bytes read but not yet delivered.
    pub fn buffered_input(&self) -> &[u8] {
        &self.inbound
    }

    /// Bytes queued for writing.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn establish(&mut self, reactor: &mut NetReactor) {
        if self.status != Status::Initial {
            return;
        }
        self.status = Status::Connecting;
        trace!(id = %self.id, remote = %self.remote, "connection connecting");

        if !self.trigger(reactor, Hook::Connect, |handler, conn| handler.on_connect(conn)) {
            return;
        }
        // closed from inside the connect hook
        if self.status != Status::Connecting {
            return;
        }
        self.status = Status::Established;
        if !self.paused {
            if let Err(e) = self.watch_read(reactor) {
                self.fail(reactor, &e);
            }
        }
    }

    /// Reads and delivers one chunk at a time until the socket would block,
    /// the peer hangs up or the connection stops reading. After
    /// `READ_BUDGET` chunks the registration is re-armed instead, so one
    /// busy peer cannot starve the others.
    pub(crate) fn read(&mut self, reactor: &mut NetReactor) {
        for _ in 0..READ_BUDGET {
            if self.status != Status::Established || self.paused {
                return;
            }
            match self.read_once() {
                Chunk::Data => self.deliver(reactor),
                Chunk::Interrupted => {}
                Chunk::Drained => return,
                Chunk::Eof => {
                    trace!(id = %self.id, "peer closed");
                    self.destroy(reactor);
                    return;
                }
                Chunk::Failed(e) => {
                    self.io_failure(reactor, e);
                    return;
                }
            }
        }
        // edge-triggered readiness will not report what is still pending
        if self.status == Status::Established && !self.paused {
            if let Err(e) = reactor.rearm(self.fd) {
                self.fail(reactor, &e);
            }
        }
    }

    /// One bounded non-blocking read appended to the inbound buffer.
    fn read_once(&mut self) -> Chunk {
        let Some(stream) = self.stream.as_mut() else {
            return Chunk::Drained;
        };
        let start = self.inbound.len();
        self.inbound.resize(start + self.read_chunk, 0);
        let result = stream.read(&mut self.inbound[start..]);
        let filled = match &result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        self.inbound.truncate(start + filled);
        match result {
            Ok(0) => Chunk::Eof,
            Ok(_) => Chunk::Data,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Chunk::Drained,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Chunk::Interrupted,
            Err(e) => Chunk::Failed(e),
        }
    }

    /// Hands buffered messages to the message hook until the buffer runs dry,
    /// the connection is paused or it stops being established.
    fn deliver(&mut self, reactor: &mut NetReactor) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        while !self.paused && self.status == Status::Established {
            let protocol = self.protocol.clone();
            let frame = match &protocol {
                None if self.inbound.is_empty() => break,
                None => mem::take(&mut self.inbound),
                Some(protocol) => match self.next_frame(protocol.as_ref()) {
                    Ok(Decoded::Frame(frame)) => frame,
                    Ok(Decoded::Incomplete) => break,
                    Ok(Decoded::Reject(reply)) => {
                        debug!(id = %self.id, reply = reply.len(), "framing rejected input");
                        self.close(reactor, &reply);
                        break;
                    }
                    Err(error) => {
                        self.logger.log(
                            LogLevel::Error,
                            &format!("Connection {} failed: {}", self.id, error),
                        );
                        self.fail(reactor, &error);
                        break;
                    }
                },
            };
            let payload = match &protocol {
                Some(protocol) => protocol.payload(&frame),
                None => &frame[..],
            };
            if !self.trigger(reactor, Hook::Message, |handler, conn| {
                handler.on_message(conn, payload)
            }) {
                break;
            }
        }
        self.delivering = false;
    }

    /// Runs the framer, turning a panicking protocol into a connection error.
    fn next_frame(&mut self, protocol: &dyn Protocol) -> Result<Decoded> {
        let (framer, inbound) = (&mut self.framer, &mut self.inbound);
        panic::catch_unwind(AssertUnwindSafe(|| framer.next(protocol, inbound))).map_err(|panic| {
            NetworkError::Protocol(format!(
                "framing panicked: {}",
                panic_message(panic.as_ref())
            ))
        })
    }

    /// Writes `data` now, or queues it behind output that is already waiting.
    /// Returns false when the connection no longer accepts output.
    pub(crate) fn send(&mut self, reactor: &mut NetReactor, data: &[u8]) -> bool {
        if matches!(self.status, Status::Closing | Status::Closed) {
            trace!(id = %self.id, len = data.len(), "send after close dropped");
            return false;
        }
        if data.is_empty() {
            return true;
        }
        if !self.outbound.is_empty() {
            self.outbound.extend_from_slice(data);
            return true;
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        let (written, failure) = write_some(stream, data);
        if let Some(error) = failure {
            self.io_failure(reactor, error);
            return false;
        }
        if written < data.len() {
            self.outbound.extend_from_slice(&data[written..]);
            self.watch_write(reactor);
        }
        true
    }

    pub(crate) fn write(&mut self, reactor: &mut NetReactor) {
        if self.status == Status::Closed {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let (written, failure) = write_some(stream, &self.outbound);
        self.outbound.drain(..written);
        if let Some(error) = failure {
            self.io_failure(reactor, error);
            return;
        }
        if !self.outbound.is_empty() {
            return;
        }
        if let Err(e) = reactor.del(self.fd, Direction::Write) {
            self.fail(reactor, &e);
            return;
        }
        if self.status == Status::Closing {
            self.destroy(reactor);
        }
    }

    pub(crate) fn pause(&mut self, reactor: &mut NetReactor) {
        if self.paused || self.status == Status::Closed {
            return;
        }
        self.paused = true;
        if let Err(e) = reactor.del(self.fd, Direction::Read) {
            self.fail(reactor, &e);
        }
    }

    pub(crate) fn resume(&mut self, reactor: &mut NetReactor) {
        if !self.paused || self.status == Status::Closed {
            return;
        }
        self.paused = false;
        if self.status != Status::Established {
            return;
        }
        if let Err(e) = self.watch_read(reactor) {
            self.fail(reactor, &e);
            return;
        }
        self.deliver(reactor);
    }

    /// Sends `data` as a final reply and closes once the output has drained.
    pub(crate) fn close(&mut self, reactor: &mut NetReactor, data: &[u8]) {
        match self.status {
            Status::Initial | Status::Connecting => self.destroy(reactor),
            Status::Closing | Status::Closed => {}
            Status::Established => {
                self.send(reactor, data);
                if self.status == Status::Closed {
                    return;
                }
                self.status = Status::Closing;
                if let Err(e) = reactor.del(self.fd, Direction::Read) {
                    debug!(id = %self.id, error = %e, "failed to stop reading");
                }
                if self.outbound.is_empty() {
                    self.destroy(reactor);
                }
            }
        }
    }

    pub(crate) fn destroy(&mut self, reactor: &mut NetReactor) {
        if self.status == Status::Closed {
            return;
        }
        self.status = Status::Closed;
        for direction in [Direction::Read, Direction::Write] {
            if let Err(e) = reactor.del(self.fd, direction) {
                debug!(id = %self.id, error = %e, "failed to remove watcher");
            }
        }
        self.stream = None;
        self.outbound.clear();
        self.framer.reset();
        trace!(id = %self.id, "connection destroyed");

        self.trigger(reactor, Hook::Close, |handler, conn| handler.on_close(conn));
    }

    fn fail(&mut self, reactor: &mut NetReactor, error: &NetworkError) {
        if self.status == Status::Closed {
            return;
        }
        // no further output or reads from inside the error hook
        self.status = Status::Closing;
        self.trigger(reactor, Hook::Error, |handler, conn| handler.on_error(conn, error));
        self.destroy(reactor);
    }

    fn io_failure(&mut self, reactor: &mut NetReactor, error: io::Error) {
        if is_peer_reset(&error) {
            debug!(id = %self.id, %error, "peer went away");
            self.destroy(reactor);
            return;
        }
        let error = NetworkError::Io(error);
        self.logger.log(
            LogLevel::Error,
            &format!("Connection {} ({}) failed: {}", self.id, self.remote, error),
        );
        self.fail(reactor, &error);
    }

    /// Runs one handler hook. Errors and panics are reported to the logger;
    /// outside the close and error hooks they also fail the connection.
    /// Returns whether the hook succeeded.
    fn trigger<F>(&mut self, reactor: &mut NetReactor, hook: Hook, f: F) -> bool
    where
        F: FnOnce(&dyn Handler, &mut Conn<'_>) -> anyhow::Result<()>,
    {
        let handler = Rc::clone(&self.handler);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut conn = Conn {
                connection: &mut *self,
                reactor: &mut *reactor,
            };
            f(handler.as_ref(), &mut conn)
        }));
        let reason = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        self.logger.log(
            LogLevel::Error,
            &format!("Connection {} {} callback failed: {}", self.id, hook, reason),
        );
        if !matches!(hook, Hook::Close | Hook::Error) {
            self.fail(reactor, &NetworkError::Handler { hook, reason });
        }
        false
    }

    fn watch_read(&mut self, reactor: &mut NetReactor) -> Result<()> {
        let id = self.id;
        reactor.add(
            self.fd,
            Direction::Read,
            move |reactor: &mut NetReactor, table: &mut ConnectionTable, _| {
                table.dispatch(id, reactor, |connection, reactor| connection.read(reactor));
            },
        )
    }

    fn watch_write(&mut self, reactor: &mut NetReactor) {
        if reactor.is_watching(self.fd, Direction::Write) {
            return;
        }
        let id = self.id;
        let watched = reactor.add(
            self.fd,
            Direction::Write,
            move |reactor: &mut NetReactor, table: &mut ConnectionTable, _| {
                table.dispatch(id, reactor, |connection, reactor| connection.write(reactor));
            },
        );
        if let Err(e) = watched {
            self.fail(reactor, &e);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("remote", &self.remote)
            .field("status", &self.status)
            .field("buffered", &self.inbound.len())
            .field("pending", &self.outbound.len())
            .field("paused", &self.paused)
            .finish()
    }
}

/// Writes as much of `data` as the socket accepts without blocking.
fn write_some(stream: &mut TcpStream, data: &[u8]) -> (usize, Option<io::Error>) {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return (written, Some(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return (written, Some(e)),
        }
    }
    (written, None)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle passed to [`Handler`] hooks: the connection plus the worker's
/// reactor, for registering timers or other watchers.
pub struct Conn<'a> {
    connection: &'a mut Connection,
    reactor: &'a mut NetReactor,
}

impl Conn<'_> {
    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn status(&self) -> Status {
        self.connection.status
    }

    pub fn fd(&self) -> RawFd {
        self.connection.fd
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connection.local
    }

    pub fn local_ip(&self) -> IpAddr {
        self.connection.local.ip()
    }

    pub fn local_port(&self) -> u16 {
        self.connection.local.port()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.connection.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.connection.remote.port()
    }

    /// Queues raw bytes. Returns false once the connection is closing.
    pub fn send(&mut self, data: &[u8]) -> bool {
        self.connection.send(self.reactor, data)
    }

    /// Wraps `payload` in the connection's framing before sending it.
    pub fn send_message(&mut self, payload: &[u8]) -> bool {
        match self.connection.protocol.clone() {
            Some(protocol) => self.send(&protocol.encode(payload)),
            None => self.send(payload),
        }
    }

    pub fn close(&mut self) {
        self.connection.close(self.reactor, &[]);
    }

    /// Sends `data` as a last reply, then closes.
    pub fn close_with(&mut self, data: &[u8]) {
        self.connection.close(self.reactor, data);
    }

    pub fn pause(&mut self) {
        self.connection.pause(self.reactor);
    }

    pub fn resume(&mut self) {
        self.connection.resume(self.reactor);
    }

    pub fn is_paused(&self) -> bool {
        self.connection.paused
    }

    /// Bytes read but not yet delivered.
    pub fn receive(&self) -> &[u8] {
        &self.connection.inbound
    }

    pub fn pending_output(&self) -> usize {
        self.connection.outbound.len()
    }

    pub fn reactor(&mut self) -> &mut NetReactor {
        self.reactor
    }
}

/// The worker's connections, keyed by id.
#[derive(Default)]
pub struct ConnectionTable {
    connections: HashMap<ConnectionId, Connection>,
    last_id: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> ConnectionId {
        self.last_id += 1;
        ConnectionId(self.last_id)
    }

    /// Starts `connection` and keeps it unless it was closed while connecting.
    pub(crate) fn establish(&mut self, reactor: &mut NetReactor, mut connection: Connection) {
        let id = connection.id;
        connection.establish(reactor);
        if connection.status != Status::Closed {
            self.connections.insert(id, connection);
        }
    }

    /// Checks a connection out for one operation; it goes back unless the
    /// operation destroyed it.
    pub(crate) fn dispatch<F>(&mut self, id: ConnectionId, reactor: &mut NetReactor, f: F)
    where
        F: FnOnce(&mut Connection, &mut NetReactor),
    {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };
        f(&mut connection, reactor);
        if connection.status != Status::Closed {
            self.connections.insert(id, connection);
        }
    }

    /// Runs `f` against a live connection, e.g. from a timer callback.
    pub fn with_conn<F, R>(&mut self, id: ConnectionId, reactor: &mut NetReactor, f: F) -> Option<R>
    where
        F: FnOnce(&mut Conn<'_>) -> R,
    {
        let mut result = None;
        self.dispatch(id, reactor, |connection, reactor| {
            let mut conn = Conn {
                connection,
                reactor,
            };
            result = Some(f(&mut conn));
        });
        result
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Live connection ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Gracefully closes every connection; those with pending output stay
    /// until it drains.
    pub fn close_all(&mut self, reactor: &mut NetReactor) {
        for id in self.ids() {
            self.dispatch(id, reactor, |connection, reactor| connection.close(reactor, &[]));
        }
    }

    pub fn destroy_all(&mut self, reactor: &mut NetReactor) {
        for id in self.ids() {
            self.dispatch(id, reactor, |connection, reactor| connection.destroy(reactor));
        }
    }
}
