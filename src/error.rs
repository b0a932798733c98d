use std::{fmt, io, net::SocketAddr, os::fd::RawFd, result::Result as StdResult};

use thiserror::Error;

use crate::event::Direction;

pub type Result<T> = StdResult<T, NetworkError>;

/// Lifecycle hook a callback failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Connect,
    Message,
    Close,
    Error,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::Connect => "connect",
            Hook::Message => "message",
            Hook::Close => "close",
            Hook::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Bind Error: {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Accept Error: {0}")]
    Accept(#[source] io::Error),

    #[error("Register Error: fd {fd} ({direction}): {source}")]
    Register {
        fd: RawFd,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("Signal Error: signal {signal}: {source}")]
    Signal {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("Fork Error: {0}")]
    Fork(#[source] nix::Error),

    #[error("Wait Error: {0}")]
    Wait(#[source] nix::Error),

    #[error("Configuration Error: {0}")]
    Configuration(String),

    #[error("Handler Error: {hook} callback failed: {reason}")]
    Handler { hook: Hook, reason: String },

    #[error("Protocol Error: {0}")]
    Protocol(String),
}

impl NetworkError {
    /// Whether the error is the peer going away rather than a local fault.
    pub fn is_peer_reset(&self) -> bool {
        match self {
            NetworkError::Io(e) => is_peer_reset(e),
            _ => false,
        }
    }
}

pub(crate) fn is_peer_reset(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = NetworkError::Handler {
            hook: Hook::Message,
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "Handler Error: message callback failed: boom");

        let err = NetworkError::Configuration("workers must be at least 1".into());
        assert_eq!(
            err.to_string(),
            "Configuration Error: workers must be at least 1"
        );
    }

    #[test]
    fn test_peer_reset_classification() {
        let reset = NetworkError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_peer_reset());

        let other = NetworkError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!other.is_peer_reset());
    }
}
