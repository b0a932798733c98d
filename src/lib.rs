//! # rush-net
//! A pre-forking, single-threaded-per-process server runtime for Rust, built on a small
//! readiness reactor over [`mio`] and without an async runtime.
//! A main process forks workers; every worker runs its own [`Reactor`](reactor::Reactor),
//! accepts on a SO_REUSEPORT listener and drives each connection through a state machine
//! that frames inbound bytes with a pluggable [`Protocol`](protocol::Protocol).
//! ## Core Philosophy
//! rush-net was designed for servers that want:
//! - **Process isolation**: a crashing worker takes down its own connections only
//! - **No locks in the hot path**: one thread per process owns every connection
//! - **Protocol independence**: line, length-prefixed and HTTP framing share one read path
//! ## Features
//! - **Reactor**: read, write, signal and timer watchers with closure callbacks
//! - **Connections**: buffered non-blocking writes, backpressure via pause/resume,
//!   graceful close that flushes pending output
//! - **Supervisor**: fork, signal relay, graceful drain with a grace period, reaping
//! - **Containment**: handler errors and panics close one connection, never the worker
//! ## Architecture Overview
//! ```text
//! ┌────────────┐  fork  ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ Supervisor │──────▶│ Reactor<C>  │───▶│  PollHandle  │───▶│ mio::Poll   │
//! └────────────┘        └─────────────┘    └──────────────┘    └─────────────┘
//!                              │ callbacks
//!                              ▼
//!                       ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//!                       │   Server    │───▶│  Connection  │───▶│  Protocol   │
//!                       └─────────────┘    └──────────────┘    └─────────────┘
//!                                                  │
//!                                                  ▼
//!                                           ┌──────────────┐
//!                                           │   Handler    │
//!                                           └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use rush_net::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &mut Conn<'_>, payload: &[u8]) -> anyhow::Result<()> {
//!         conn.send_message(payload);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::builder()
//!         .url("tcp://127.0.0.1:8080")?
//!         .workers(2)
//!         .protocol(LineDelimited::default())
//!         .build();
//!
//!     let mut supervisor = Supervisor::new(SupervisorConfig::default());
//!     supervisor.add(Server::new(config, Echo)?);
//!     supervisor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! - [`reactor`]: the event loop and its watcher kinds
//! - [`protocol`]: framing contract and the built-in protocols
//! - [`net`]: connections, servers and the process supervisor
//! - [`error`]: error types and result handling
//! - [`logger`]: pluggable sink for connection failures

pub mod error;
pub mod event;
pub mod logger;
pub mod net;
pub mod poll;
pub mod process;
pub mod protocol;
pub mod reactor;
mod signal;
pub mod timer;

pub use error::{NetworkError, Result};
pub use reactor::Reactor;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use rush_net::prelude::*;
/// ```
pub mod prelude {
    pub use crate::event::Direction;
    pub use crate::logger::{LogLevel, Logger, NoOpLogger, TracingLogger};
    pub use crate::net::{
        Conn, ConnectionId, ConnectionTable, Handler, NetReactor, Server, ServerConfig, Status,
        Supervisor, SupervisorConfig,
    };
    pub use crate::protocol::{Frame, HttpFraming, LengthPrefixed, LineDelimited, Protocol};
    pub use crate::reactor::Reactor;
    pub use crate::timer::{TimerId, TimerMode};
}
