//! Line echo server: `nc 127.0.0.1 7000`, type lines, get them back.
//! Lines are echoed until `quit`; idle connections are closed after 30s.

use std::{cell::RefCell, collections::HashMap, sync::Arc, time::Duration};

use rush_net::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const IDLE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct EchoHandler {
    idle_timers: RefCell<HashMap<ConnectionId, TimerId>>,
}

impl EchoHandler {
    /// Restarts the idle countdown of `conn`.
    fn touch(&self, conn: &mut Conn<'_>) {
        let id = conn.id();
        let timer = conn.reactor().add_timer(
            IDLE,
            TimerMode::Once,
            move |reactor: &mut NetReactor, table: &mut ConnectionTable, _| {
                table.with_conn(id, reactor, |conn| {
                    info!(id = %conn.id(), "idle, closing");
                    conn.close_with(b"bye (idle)\n");
                });
            },
        );
        if let Some(previous) = self.idle_timers.borrow_mut().insert(id, timer) {
            conn.reactor().del_timer(previous);
        }
    }
}

impl Handler for EchoHandler {
    fn on_connect(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        info!(id = %conn.id(), remote = %conn.remote_addr(), "connected");
        conn.send_message(b"welcome to rush-net echo");
        self.touch(conn);
        Ok(())
    }

    fn on_message(&self, conn: &mut Conn<'_>, line: &[u8]) -> anyhow::Result<()> {
        if line == b"quit" {
            conn.close_with(b"bye\n");
            return Ok(());
        }
        conn.send_message(line);
        self.touch(conn);
        Ok(())
    }

    fn on_close(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        if let Some(timer) = self.idle_timers.borrow_mut().remove(&conn.id()) {
            conn.reactor().del_timer(timer);
        }
        info!(id = %conn.id(), "closed");
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::builder()
        .url("tcp://127.0.0.1:7000")?
        .workers(2)
        .protocol(LineDelimited::default())
        .logger(Arc::new(TracingLogger))
        .build();
    info!(url = %config.url(), "echo server starting");

    let mut supervisor = Supervisor::new(SupervisorConfig::default().title("rush-echo"));
    supervisor.add(Server::new(config, EchoHandler::default())?);
    supervisor.run()?;
    Ok(())
}
