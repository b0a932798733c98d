use std::{collections::HashMap, io, os::fd::RawFd, time::Duration};

use mio::{unix::SourceFd, Events, Interest, Poll};

use crate::event::token_for;

/// Owns the OS multiplexer and the interest currently registered per descriptor.
///
/// mio registers a source once with a combined interest, so read and write
/// watchers on the same descriptor are folded into one registration here and
/// split apart again by the reactor.
pub struct PollHandle {
    poller: Poll,
    interests: HashMap<RawFd, Interest>,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        Ok(PollHandle {
            poller: Poll::new()?,
            interests: HashMap::new(),
        })
    }

    /// Moves `fd` to `interest`, registering, re-registering or deregistering
    /// as needed. `None` removes the descriptor from the poller.
    pub fn set(&mut self, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let registry = self.poller.registry();
        match (self.interests.get(&fd).copied(), interest) {
            (None, None) => Ok(()),
            (None, Some(next)) => {
                registry.register(&mut SourceFd(&fd), token_for(fd), next)?;
                self.interests.insert(fd, next);
                Ok(())
            }
            (Some(_), Some(next)) => {
                registry.reregister(&mut SourceFd(&fd), token_for(fd), next)?;
                self.interests.insert(fd, next);
                Ok(())
            }
            (Some(_), None) => {
                self.interests.remove(&fd);
                registry.deregister(&mut SourceFd(&fd))
            }
        }
    }

    /// Re-arms an edge-triggered registration so readiness that is still
    /// pending is reported again on the next poll.
    pub fn rearm(&mut self, fd: RawFd) -> io::Result<()> {
        match self.interests.get(&fd).copied() {
            Some(interest) => {
                self.poller
                    .registry()
                    .reregister(&mut SourceFd(&fd), token_for(fd), interest)
            }
            None => Ok(()),
        }
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }

    pub fn registered(&self) -> usize {
        self.interests.len()
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops every registration and replaces the poller with a fresh one.
    pub fn reinit(&mut self) -> io::Result<()> {
        for fd in self.interests.keys() {
            let _ = self.poller.registry().deregister(&mut SourceFd(fd));
        }
        self.interests.clear();
        self.poller = Poll::new()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Events;
    use std::{io::Write, os::fd::AsRawFd, os::unix::net::UnixStream};

    #[test]
    fn test_poll() {
        let mut poller = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(1024);
        let n = poller
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_set_folds_interests() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        let mut poller = PollHandle::new().unwrap();

        poller.set(fd, Some(Interest::READABLE)).unwrap();
        assert_eq!(poller.interest(fd), Some(Interest::READABLE));

        poller
            .set(fd, Some(Interest::READABLE | Interest::WRITABLE))
            .unwrap();
        assert_eq!(
            poller.interest(fd),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        poller.set(fd, None).unwrap();
        assert_eq!(poller.interest(fd), None);
        assert_eq!(poller.registered(), 0);

        // removing twice is not an error
        poller.set(fd, None).unwrap();
    }

    #[test]
    fn test_readable_event() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        let mut poller = PollHandle::new().unwrap();
        poller.set(fd, Some(Interest::READABLE)).unwrap();

        b.write_all(b"ping").unwrap();

        let mut events = Events::with_capacity(16);
        let n = poller
            .poll(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 1);
        let event = events.iter().next().unwrap();
        assert_eq!(event.token(), token_for(fd));
        assert!(event.is_readable());
    }

    #[test]
    fn test_reinit_clears_registrations() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut poller = PollHandle::new().unwrap();
        poller.set(a.as_raw_fd(), Some(Interest::READABLE)).unwrap();
        poller.reinit().unwrap();
        assert_eq!(poller.registered(), 0);
    }
}
