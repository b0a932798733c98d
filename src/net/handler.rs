use crate::error::NetworkError;

use super::connection::Conn;

/// Application hooks invoked by a connection's state machine.
///
/// Every method is optional. The connection catches errors and panics raised
/// by a hook: they are reported to the configured logger and the connection
/// is torn down, while the worker and its other connections keep running.
///
/// ## Execution Context
///
/// Hooks run on the worker's reactor thread, one at a time. A hook must not
/// block; queue output with [`Conn::send`] and return.
pub trait Handler: 'static {
    /// Called once, before the first byte is read. Returning an error or
    /// calling [`Conn::close`] rejects the connection.
    fn on_connect(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called once per complete message, in stream order.
    fn on_message(&self, conn: &mut Conn<'_>, payload: &[u8]) -> anyhow::Result<()> {
        let _ = (conn, payload);
        Ok(())
    }

    /// Called exactly once when the connection is destroyed.
    fn on_close(&self, conn: &mut Conn<'_>) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }

    /// Called on fatal I/O failures and failed hooks, before the close hook.
    fn on_error(&self, conn: &mut Conn<'_>, error: &NetworkError) -> anyhow::Result<()> {
        let _ = (conn, error);
        Ok(())
    }
}

/// Handler with every hook left at its default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
