//! TCP servers on top of the reactor.
//!
//! This module turns the [`Reactor`](crate::reactor::Reactor) into a
//! pre-forking server runtime. Application code implements [`Handler`] and
//! picks a [`Protocol`](crate::protocol::Protocol); the runtime accepts,
//! buffers, frames and writes.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 main process (Supervisor)                   │
//! │   shutdown signal ──▶ flag ──▶ relay to workers, waitpid    │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ fork                 │ fork
//!              ▼                      ▼
//! ┌──────────────────────────┐  ┌──────────────────────────┐
//! │ worker: NetReactor       │  │ worker: NetReactor       │
//! │  Server (listener)       │  │  Server (listener)       │
//! │  ConnectionTable         │  │  ConnectionTable         │
//! │   Connection ─▶ Handler  │  │   Connection ─▶ Handler  │
//! └──────────────────────────┘  └──────────────────────────┘
//! ```
//!
//! Each worker is single-threaded: the reactor, its connections and the
//! handler hooks all run on one thread, so handlers need no locking.
//!
//! # Example
//!
//! ```rust,no_run
//! use rush_net::net::{Conn, Handler, Server, ServerConfig, Supervisor, SupervisorConfig};
//! use rush_net::protocol::LengthPrefixed;
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
//! # fn main() -> rush_net::error::Result<()> {
//! let config = ServerConfig::builder()
//!     .url("tcp://0.0.0.0:9000")?
//!     .workers(4)
//!     .protocol(LengthPrefixed::default())
//!     .build();
//!
//! let mut supervisor = Supervisor::new(SupervisorConfig::default());
//! supervisor.add(Server::new(config, Echo)?);
//! for exit in supervisor.run()? {
//!     println!("worker {} {}", exit.pid, exit.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod handler;
pub mod server;
pub mod supervisor;

use crate::reactor::Reactor;

pub use config::{ServerConfig, ServerConfigBuilder, SupervisorConfig, Transport};
pub use connection::{Conn, Connection, ConnectionId, ConnectionTable, Status};
pub use handler::{Handler, NoopHandler};
pub use server::{Server, ServerId};
pub use supervisor::{
    run_worker, shutdown_worker, StopHandle, Supervisor, WorkerExit, WorkerStatus,
};

/// Reactor of a worker process; its context is the worker's connections.
pub type NetReactor = Reactor<ConnectionTable>;
