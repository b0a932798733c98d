//! Self-pipe delivery of OS signals into the reactor.
//!
//! `signal-hook` writes one byte into the pipe from the signal handler; the
//! read end is polled like any other descriptor.

use std::{
    io::{self, Read},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use signal_hook::{consts::FORBIDDEN, low_level, SigId};

pub(crate) struct SignalPipe {
    signal: i32,
    id: SigId,
    reader: UnixStream,
}

impl SignalPipe {
    pub(crate) fn install(signal: i32) -> io::Result<Self> {
        if FORBIDDEN.contains(&signal) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("signal {signal} cannot be watched"),
            ));
        }
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        let id = low_level::pipe::register(signal, writer)?;
        Ok(Self { signal, id, reader })
    }

    pub(crate) fn signal(&self) -> i32 {
        self.signal
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Empties the pipe; several deliveries of one signal collapse into one.
    pub(crate) fn drain(&mut self) -> usize {
        let mut scratch = [0u8; 64];
        let mut total = 0;
        loop {
            match self.reader.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        total
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        low_level::unregister(self.id);
    }
}
