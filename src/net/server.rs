use std::{
    cell::{Cell, RefCell},
    fmt, io,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, trace};

use crate::{
    error::{NetworkError, Result},
    event::Direction,
    logger::LogLevel,
};

use super::{
    config::ServerConfig,
    connection::{Connection, ConnectionTable},
    handler::Handler,
    NetReactor,
};

static NEXT_SERVER_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub usize);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A listening socket and the handler its connections are wired to.
///
/// Servers are created before forking; every worker process calls
/// [`Server::listen`] on its own reactor, binding its own listener with
/// SO_REUSEPORT.
///
/// ## Example
///
/// ```rust,no_run
/// use rush_net::net::{ConnectionTable, Conn, Handler, NetReactor, Server, ServerConfig};
/// use rush_net::protocol::LineDelimited;
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn on_message(&self, conn: &mut Conn<'_>, payload: &[u8]) -> anyhow::Result<()> {
///         conn.send_message(payload);
///         Ok(())
///     }
/// }
///
/// # fn main() -> rush_net::error::Result<()> {
/// let config = ServerConfig::builder()
///     .url("tcp://127.0.0.1:7000")?
///     .protocol(LineDelimited::default())
///     .build();
/// let server = Server::new(config, Echo)?;
///
/// let mut reactor = NetReactor::new()?;
/// let mut table = ConnectionTable::new();
/// server.listen(&mut reactor)?;
/// reactor.run(&mut table)?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    id: ServerId,
    config: ServerConfig,
    handler: Rc<dyn Handler>,
    listener: RefCell<Option<TcpListener>>,
    accepting: Cell<bool>,
}

impl Server {
    pub fn new<H: Handler>(config: ServerConfig, handler: H) -> Result<Rc<Self>> {
        config.validate()?;
        Ok(Rc::new(Self {
            id: ServerId(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed)),
            config,
            handler: Rc::new(handler),
            listener: RefCell::new(None),
            accepting: Cell::new(false),
        }))
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Process title for this server's workers.
    pub fn title(&self) -> String {
        self.config
            .name
            .clone()
            .unwrap_or_else(|| format!("rush-{}", self.id))
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.get()
    }

    /// Address of the bound listener, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .borrow()
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Binds the listener and starts accepting on `reactor`. Returns the
    /// bound address, which differs from the configured one for port 0.
    pub fn listen(self: &Rc<Self>, reactor: &mut NetReactor) -> Result<SocketAddr> {
        let address = self.config.address;
        let bind_error = |source: io::Error| NetworkError::Bind { address, source };

        let socket = Socket::new(
            Domain::for_address(address),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
        if self.config.reuse_port {
            socket.set_reuse_port(true).map_err(bind_error)?;
        }
        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&address.into()).map_err(bind_error)?;
        socket.listen(self.config.backlog).map_err(bind_error)?;

        let listener = TcpListener::from_std(socket.into());
        let local = listener.local_addr()?;
        *self.listener.borrow_mut() = Some(listener);
        self.resume_accept(reactor)?;
        debug!(server = %self.id, %local, "listening");
        Ok(local)
    }

    /// Stops accepting new connections; the listener stays bound.
    pub fn pause_accept(&self, reactor: &mut NetReactor) -> Result<()> {
        let Some(fd) = self.listener_fd() else {
            return Ok(());
        };
        self.accepting.set(false);
        reactor.del(fd, Direction::Read)
    }

    pub fn resume_accept(self: &Rc<Self>, reactor: &mut NetReactor) -> Result<()> {
        let Some(fd) = self.listener_fd() else {
            return Ok(());
        };
        if self.accepting.get() {
            return Ok(());
        }
        let server = Rc::clone(self);
        reactor.add(
            fd,
            Direction::Read,
            move |reactor: &mut NetReactor, table: &mut ConnectionTable, _| {
                server.accept(reactor, table)
            },
        )?;
        self.accepting.set(true);
        Ok(())
    }

    /// Stops accepting and releases the listening socket.
    pub fn close(&self, reactor: &mut NetReactor) -> Result<()> {
        self.pause_accept(reactor)?;
        if self.listener.borrow_mut().take().is_some() {
            debug!(server = %self.id, "listener closed");
        }
        Ok(())
    }

    fn listener_fd(&self) -> Option<RawFd> {
        self.listener.borrow().as_ref().map(|listener| listener.as_raw_fd())
    }

    fn accept(&self, reactor: &mut NetReactor, table: &mut ConnectionTable) {
        loop {
            let accepted = match self.listener.borrow().as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, remote)) => {
                    if let Some(max) = self.config.max_connections {
                        if table.len() >= max {
                            self.config.logger.log(
                                LogLevel::Warn,
                                &format!("Max connections reached, rejecting {}", remote),
                            );
                            continue;
                        }
                    }
                    self.configure(&stream);

                    let id = table.next_id();
                    match Connection::new(id, stream, remote, Rc::clone(&self.handler), &self.config)
                    {
                        Ok(connection) => {
                            trace!(server = %self.id, %id, %remote, "accepted");
                            table.establish(reactor, connection);
                        }
                        Err(e) => self.config.logger.log(
                            LogLevel::Warn,
                            &format!("Dropping connection from {}: {}", remote, e),
                        ),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.config
                        .logger
                        .log(LogLevel::Error, &NetworkError::Accept(e).to_string());
                    break;
                }
            }
        }
    }

    fn configure(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            self.config.logger.log(
                LogLevel::Error,
                &format!("Failed to set TCP_NODELAY: {}", e),
            );
        }
        if let Some(time) = self.config.keep_alive {
            let keep_alive = TcpKeepalive::new().with_time(time);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keep_alive) {
                self.config.logger.log(
                    LogLevel::Error,
                    &format!("Failed to set SO_KEEPALIVE: {}", e),
                );
            }
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("address", &self.config.address)
            .field("workers", &self.config.workers)
            .field("accepting", &self.accepting.get())
            .finish()
    }
}
