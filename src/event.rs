use mio::{event::Event, Interest, Token};
use std::{fmt, os::fd::RawFd};

/// Which half of a socket a watcher is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Readiness of one descriptor, flattened out of mio's platform event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    fd: RawFd,
    is_readable: bool,
    is_writable: bool,
    is_read_closed: bool,
    is_write_closed: bool,
    is_error: bool,
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready")
            .field("fd", &self.fd)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .field("is_read_closed", &self.is_read_closed)
            .field("is_write_closed", &self.is_write_closed)
            .field("is_error", &self.is_error)
            .finish()
    }
}

impl Ready {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read watchers run on data, on hang-up and on socket errors, so a
    /// read can observe EOF or the pending error.
    pub fn wants_read(&self) -> bool {
        self.is_readable || self.is_read_closed || self.is_error
    }

    pub fn wants_write(&self) -> bool {
        self.is_writable || self.is_write_closed || self.is_error
    }
}

pub(crate) fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Self {
            fd: event.token().0 as RawFd,
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
            is_read_closed: event.is_read_closed(),
            is_write_closed: event.is_write_closed(),
            is_error: event.is_error(),
        }
    }
}
