use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use signal_hook::consts::SIGTERM;

use crate::{
    error::{NetworkError, Result},
    logger::{Logger, NoOpLogger},
    protocol::Protocol,
};

pub const DEFAULT_READ_CHUNK: usize = 65535;
pub const DEFAULT_BACKLOG: i32 = 1024;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Transport a server listens on. Only byte-stream TCP is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            other => Err(NetworkError::Configuration(format!(
                "unsupported transport: {other}"
            ))),
        }
    }
}

/// Configuration for one listening server.
///
/// Controls the bind address, worker count, socket options and the framing
/// applied to accepted connections. Use [`ServerConfig::builder`] for
/// ergonomic construction.
///
/// ## Socket Options
///
/// - reuse_port: lets every worker bind its own listener on the same port so
///   the kernel spreads new connections across them
/// - no_delay: When enabled (default), disables Nagle's algorithm for lower latency
/// - keep_alive: Configures SO_KEEPALIVE to detect dead connections
///
/// ## Resource Limits
///
/// - read_chunk: upper bound of a single read from a connection
/// - max_connections: Hard limit on concurrent connections per worker (None for unlimited)
#[derive(Clone)]
pub struct ServerConfig {
    /// Process title for this server's workers
    pub name: Option<String>,
    /// Address to bind to
    pub address: SocketAddr,
    pub transport: Transport,
    /// Number of worker processes
    pub workers: usize,
    pub read_chunk: usize,
    pub backlog: i32,
    pub reuse_port: bool,
    pub max_connections: Option<usize>,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// SO_KEEPALIVE setting
    pub keep_alive: Option<Duration>,
    /// Framing for accepted connections; raw delivery when unset
    pub protocol: Option<Arc<dyn Protocol>>,
    /// Logger for connection failures
    pub logger: Arc<dyn Logger>,
}

impl ServerConfig {
    /// Create a new builder for ServerConfig
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// Parses `transport://ip:port`, e.g. `tcp://0.0.0.0:8080`.
    pub fn parse_url(url: &str) -> Result<(Transport, SocketAddr)> {
        let (transport, rest) = url
            .split_once("://")
            .ok_or_else(|| NetworkError::Configuration(format!("missing transport in {url}")))?;
        let transport = transport.parse()?;
        let address = rest
            .parse()
            .map_err(|e| NetworkError::Configuration(format!("invalid address {rest}: {e}")))?;
        Ok((transport, address))
    }

    /// Default configuration listening on `url`.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::builder().url(url)?.build())
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.transport, self.address)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(NetworkError::Configuration(
                "workers must be at least 1".into(),
            ));
        }
        if self.read_chunk == 0 {
            return Err(NetworkError::Configuration(
                "read_chunk must be greater than 0".into(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(NetworkError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            transport: Transport::Tcp,
            workers: 1,
            read_chunk: DEFAULT_READ_CHUNK,
            backlog: DEFAULT_BACKLOG,
            reuse_port: true,
            max_connections: None,
            no_delay: true,
            keep_alive: None,
            protocol: None,
            logger: Arc::new(NoOpLogger),
        }
    }
}

/// Builder for ServerConfig using the builder pattern.
///
/// All fields are optional and will use defaults from ServerConfig::default()
/// if not explicitly set.
#[derive(Default)]
pub struct ServerConfigBuilder {
    name: Option<String>,
    ip: Option<IpAddr>,
    port: Option<u16>,
    transport: Option<Transport>,
    workers: Option<usize>,
    read_chunk: Option<usize>,
    backlog: Option<i32>,
    reuse_port: Option<bool>,
    max_connections: Option<usize>,
    no_delay: Option<bool>,
    keep_alive: Option<Option<Duration>>,
    protocol: Option<Arc<dyn Protocol>>,
    logger: Option<Arc<dyn Logger>>,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the process title used by the server's workers
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.ip = Some(address.ip());
        self.port = Some(address.port());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set transport and address from a `tcp://ip:port` url
    pub fn url(mut self, url: &str) -> Result<Self> {
        let (transport, address) = ServerConfig::parse_url(url)?;
        self.transport = Some(transport);
        Ok(self.address(address))
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the number of worker processes
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set the size of a single read
    pub fn read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = Some(size);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    /// Set the maximum number of connections per worker
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set SO_KEEPALIVE duration
    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Set the framing protocol for accepted connections
    pub fn protocol<P: Protocol>(mut self, protocol: P) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    /// Set the logger implementation
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the ServerConfig
    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        let address = SocketAddr::new(
            self.ip.unwrap_or(default.address.ip()),
            self.port.unwrap_or(default.address.port()),
        );
        ServerConfig {
            name: self.name.or(default.name),
            address,
            transport: self.transport.unwrap_or(default.transport),
            workers: self.workers.unwrap_or(default.workers),
            read_chunk: self.read_chunk.unwrap_or(default.read_chunk),
            backlog: self.backlog.unwrap_or(default.backlog),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            max_connections: self.max_connections.or(default.max_connections),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            protocol: self.protocol.or(default.protocol),
            logger: self.logger.unwrap_or(default.logger),
        }
    }
}

/// Settings of the main process that forks and supervises workers.
#[derive(Clone)]
pub struct SupervisorConfig {
    /// Title of the main process
    pub title: String,
    /// Signal that starts a graceful shutdown of the whole process tree
    pub shutdown_signal: i32,
    /// How long a stopping worker keeps flushing connections
    pub grace: Duration,
    /// Pause between reaping attempts while children are alive
    pub reap_interval: Duration,
    pub logger: Arc<dyn Logger>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            title: "rush".to_string(),
            shutdown_signal: SIGTERM,
            grace: DEFAULT_GRACE,
            reap_interval: DEFAULT_REAP_INTERVAL,
            logger: Arc::new(NoOpLogger),
        }
    }
}

impl SupervisorConfig {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn shutdown_signal(mut self, signal: i32) -> Self {
        self.shutdown_signal = signal;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}
