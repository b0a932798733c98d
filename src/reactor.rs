//! Single-threaded readiness reactor.
//!
//! One `Reactor` runs per OS process. Watchers are plain closures that receive
//! the reactor itself and a caller-supplied context `C` (the worker's
//! [`ConnectionTable`](crate::net::ConnectionTable) in the networking layer),
//! so a callback may add or remove watchers, including its own, while it runs.
//!
//! ```text
//!  add(fd, Read, cb) ──┐
//!  add(fd, Write, cb) ─┼─▶ (fd, Direction) → cb ──▶ PollHandle (mio::Poll)
//!  add_signal(sig, cb) ┼─▶ signal → SignalPipe ────▶ self-pipe fd
//!  add_timer(d, m, cb) ┘─▶ TimerQueue ─────────────▶ poll timeout
//! ```

use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use mio::{Events, Interest};
use tracing::{debug, trace, warn};

use crate::{
    error::{NetworkError, Result},
    event::{Direction, Ready},
    poll::PollHandle,
    signal::SignalPipe,
    timer::{TimerId, TimerMode, TimerQueue},
};

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

pub type IoCallback<C> = Rc<dyn Fn(&mut Reactor<C>, &mut C, RawFd)>;
pub type SignalCallback<C> = Rc<dyn Fn(&mut Reactor<C>, &mut C, i32)>;
pub type TimerCallback<C> = Rc<dyn Fn(&mut Reactor<C>, &mut C, TimerId)>;

struct SignalWatcher<C> {
    pipe: SignalPipe,
    callback: SignalCallback<C>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Running,
    Draining { deadline: Instant },
    Stopping,
}

pub struct Reactor<C> {
    poll_handle: PollHandle,
    events: Events,
    io: HashMap<(RawFd, Direction), IoCallback<C>>,
    signals: HashMap<i32, SignalWatcher<C>>,
    signal_fds: HashMap<RawFd, i32>,
    timers: TimerQueue<TimerCallback<C>>,
    state: State,
    poll_timeout: Duration,
}

impl<C> Reactor<C> {
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY, DEFAULT_POLL_TIMEOUT_MS)
    }

    pub fn with_capacity(events_capacity: usize, poll_timeout_ms: u64) -> Result<Self> {
        Ok(Self {
            poll_handle: PollHandle::new()?,
            events: Events::with_capacity(events_capacity),
            io: HashMap::new(),
            signals: HashMap::new(),
            signal_fds: HashMap::new(),
            timers: TimerQueue::new(),
            state: State::Idle,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
        })
    }

    /// Watches `fd` for readiness in `direction`, replacing any watcher
    /// already registered for the same descriptor and direction.
    pub fn add<F>(&mut self, fd: RawFd, direction: Direction, callback: F) -> Result<()>
    where
        F: Fn(&mut Reactor<C>, &mut C, RawFd) + 'static,
    {
        let interest = match self.poll_handle.interest(fd) {
            Some(current) => current | direction.interest(),
            None => direction.interest(),
        };
        self.poll_handle
            .set(fd, Some(interest))
            .map_err(|source| NetworkError::Register {
                fd,
                direction,
                source,
            })?;
        self.io.insert((fd, direction), Rc::new(callback));
        trace!(fd, %direction, "watcher added");
        Ok(())
    }

    /// Stops watching `fd` in `direction`. Removing an absent watcher is a no-op.
    pub fn del(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if self.io.remove(&(fd, direction)).is_none() {
            return Ok(());
        }
        let remaining = self
            .poll_handle
            .interest(fd)
            .and_then(|current| current.remove(direction.interest()));
        trace!(fd, %direction, "watcher removed");
        self.poll_handle
            .set(fd, remaining)
            .map_err(|source| NetworkError::Register {
                fd,
                direction,
                source,
            })
    }

    /// Asks for pending readiness on `fd` to be reported again.
    pub fn rearm(&mut self, fd: RawFd) -> Result<()> {
        Ok(self.poll_handle.rearm(fd)?)
    }

    pub fn add_signal<F>(&mut self, signal: i32, callback: F) -> Result<()>
    where
        F: Fn(&mut Reactor<C>, &mut C, i32) + 'static,
    {
        let callback: SignalCallback<C> = Rc::new(callback);
        if let Some(watcher) = self.signals.get_mut(&signal) {
            watcher.callback = callback;
            return Ok(());
        }

        let signal_error = |source: io::Error| NetworkError::Signal { signal, source };
        let pipe = SignalPipe::install(signal).map_err(signal_error)?;
        let fd = pipe.fd();
        self.poll_handle
            .set(fd, Some(Interest::READABLE))
            .map_err(signal_error)?;
        self.signal_fds.insert(fd, signal);
        self.signals.insert(signal, SignalWatcher { pipe, callback });
        debug!(signal, "signal watcher added");
        Ok(())
    }

    pub fn del_signal(&mut self, signal: i32) -> Result<()> {
        let Some(watcher) = self.signals.remove(&signal) else {
            return Ok(());
        };
        let fd = watcher.pipe.fd();
        self.signal_fds.remove(&fd);
        debug!(signal = watcher.pipe.signal(), "signal watcher removed");
        self.poll_handle
            .set(fd, None)
            .map_err(|source| NetworkError::Signal { signal, source })
    }

    pub fn add_timer<F>(&mut self, after: Duration, mode: TimerMode, callback: F) -> TimerId
    where
        F: Fn(&mut Reactor<C>, &mut C, TimerId) + 'static,
    {
        self.timers
            .insert(Instant::now(), after, mode, Rc::new(callback))
    }

    pub fn del_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    pub fn is_watching(&self, fd: RawFd, direction: Direction) -> bool {
        self.io.contains_key(&(fd, direction))
    }

    pub fn io_watchers(&self) -> usize {
        self.io.len()
    }

    pub fn signal_watchers(&self) -> usize {
        self.signals.len()
    }

    pub fn timers(&self) -> usize {
        self.timers.len()
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Dispatches events until [`destroy`](Self::destroy) is called.
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        self.state = State::Running;
        debug!("reactor loop started");
        loop {
            match self.state {
                State::Stopping => break,
                State::Draining { deadline } => {
                    if self.io.is_empty() || Instant::now() >= deadline {
                        break;
                    }
                }
                State::Running | State::Idle => {}
            }
            if let Err(e) = self.turn(ctx, Some(self.poll_timeout)) {
                self.state = State::Idle;
                return Err(e);
            }
        }
        self.teardown()?;
        debug!("reactor loop stopped");
        Ok(())
    }

    /// One poll iteration: waits at most `timeout` (shortened by pending
    /// timers), then runs every ready watcher and every due timer.
    pub fn turn(&mut self, ctx: &mut C, timeout: Option<Duration>) -> Result<usize> {
        let now = Instant::now();
        let mut wait = timeout;
        if let Some(deadline) = self.timers.next_deadline() {
            wait = Some(shorter(wait, deadline.saturating_duration_since(now)));
        }
        if let State::Draining { deadline } = self.state {
            wait = Some(shorter(wait, deadline.saturating_duration_since(now)));
        }

        self.poll_handle.poll(&mut self.events, wait)?;
        let ready: Vec<Ready> = self.events.iter().map(Ready::from).collect();
        let mut dispatched = 0;

        for event in &ready {
            dispatched += self.dispatch(ctx, event);
        }

        // one at a time: a callback may cancel a timer that is also due
        let now = Instant::now();
        while let Some((id, callback)) = self.timers.pop_due(now) {
            callback(self, ctx, id);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn dispatch(&mut self, ctx: &mut C, event: &Ready) -> usize {
        let fd = event.fd();

        if let Some(signal) = self.signal_fds.get(&fd).copied() {
            let callback = match self.signals.get_mut(&signal) {
                Some(watcher) => {
                    watcher.pipe.drain();
                    Rc::clone(&watcher.callback)
                }
                None => return 0,
            };
            debug!(signal, "signal received");
            callback(self, ctx, signal);
            return 1;
        }

        let mut dispatched = 0;
        if event.wants_read() {
            // looked up per direction: the read callback may remove the write watcher
            if let Some(callback) = self.io.get(&(fd, Direction::Read)).cloned() {
                callback(self, ctx, fd);
                dispatched += 1;
            }
        }
        if event.wants_write() {
            if let Some(callback) = self.io.get(&(fd, Direction::Write)).cloned() {
                callback(self, ctx, fd);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Tears the reactor down. Signal and timer watchers are dropped at once.
    /// With a non-zero `grace` a running loop keeps serving I/O watchers until
    /// none remain or the grace period elapses; then every watcher is removed
    /// and the multiplexer is recreated.
    pub fn destroy(&mut self, grace: Duration) -> Result<()> {
        self.clear_signals();
        self.timers.clear();

        match self.state {
            State::Idle => self.teardown(),
            _ if grace.is_zero() => {
                self.state = State::Stopping;
                Ok(())
            }
            State::Draining { .. } | State::Stopping => Ok(()),
            State::Running => {
                debug!(grace_ms = grace.as_millis() as u64, "reactor draining");
                self.state = State::Draining {
                    deadline: Instant::now() + grace,
                };
                Ok(())
            }
        }
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.io.is_empty() {
            warn!(watchers = self.io.len(), "dropping watchers at teardown");
        }
        self.io.clear();
        self.clear_signals();
        self.timers.clear();
        self.state = State::Idle;
        self.poll_handle.reinit()?;
        Ok(())
    }

    fn clear_signals(&mut self) {
        for (fd, _) in self.signal_fds.drain() {
            let _ = self.poll_handle.set(fd, None);
        }
        self.signals.clear();
    }
}

fn shorter(current: Option<Duration>, candidate: Duration) -> Duration {
    match current {
        Some(current) => current.min(candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::consts::SIGUSR2;
    use std::{
        io::Write,
        os::{fd::AsRawFd, unix::net::UnixStream},
    };

    #[derive(Default)]
    struct Log {
        entries: Vec<&'static str>,
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_reactor_creation() {
        let reactor = Reactor::<Log>::new();
        assert!(reactor.is_ok());
    }

    #[test]
    fn test_event_dispatch() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let (a, mut b) = pair();

        reactor
            .add(a.as_raw_fd(), Direction::Read, |_, log: &mut Log, _| {
                log.entries.push("read")
            })
            .unwrap();
        b.write_all(b"x").unwrap();

        reactor
            .turn(&mut log, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(log.entries, vec!["read"]);
    }

    #[test]
    fn test_add_replaces_watcher() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();

        reactor
            .add(fd, Direction::Read, |_, log: &mut Log, _| log.entries.push("first"))
            .unwrap();
        reactor
            .add(fd, Direction::Read, |_, log: &mut Log, _| log.entries.push("second"))
            .unwrap();
        assert_eq!(reactor.io_watchers(), 1);

        b.write_all(b"x").unwrap();
        reactor
            .turn(&mut log, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(log.entries, vec!["second"]);
    }

    #[test]
    fn test_read_and_write_watchers_share_descriptor() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();

        reactor
            .add(fd, Direction::Read, |_, log: &mut Log, _| log.entries.push("read"))
            .unwrap();
        reactor
            .add(fd, Direction::Write, |_, log: &mut Log, _| log.entries.push("write"))
            .unwrap();
        reactor
            .turn(&mut log, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(log.entries, vec!["write"]);

        reactor.del(fd, Direction::Write).unwrap();
        assert!(reactor.is_watching(fd, Direction::Read));
        assert!(!reactor.is_watching(fd, Direction::Write));
    }

    #[test]
    fn test_del_is_idempotent() {
        let mut reactor = Reactor::<Log>::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        reactor.del(fd, Direction::Read).unwrap();
        reactor.add(fd, Direction::Read, |_, _, _| {}).unwrap();
        reactor.del(fd, Direction::Read).unwrap();
        reactor.del(fd, Direction::Read).unwrap();
        assert_eq!(reactor.io_watchers(), 0);
    }

    #[test]
    fn test_callback_can_remove_itself() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let (a, mut b) = pair();
        let fd = a.as_raw_fd();

        reactor
            .add(fd, Direction::Read, |reactor: &mut Reactor<Log>, log: &mut Log, fd| {
                log.entries.push("once");
                reactor.del(fd, Direction::Read).unwrap();
            })
            .unwrap();
        b.write_all(b"x").unwrap();
        reactor
            .turn(&mut log, Some(Duration::from_secs(1)))
            .unwrap();
        b.write_all(b"y").unwrap();
        reactor
            .turn(&mut log, Some(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(log.entries, vec!["once"]);
    }

    #[test]
    fn test_timers() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();

        let once = reactor.add_timer(Duration::from_millis(5), TimerMode::Once, |_, log: &mut Log, _| {
            log.entries.push("once")
        });
        let tick = reactor.add_timer(
            Duration::from_millis(5),
            TimerMode::Periodic,
            |_, log: &mut Log, _| log.entries.push("tick"),
        );
        assert!(tick > once);

        let deadline = Instant::now() + Duration::from_secs(2);
        while log.entries.iter().filter(|e| **e == "tick").count() < 3 && Instant::now() < deadline {
            reactor
                .turn(&mut log, Some(Duration::from_millis(50)))
                .unwrap();
        }
        assert_eq!(log.entries.iter().filter(|e| **e == "once").count(), 1);
        assert!(log.entries.iter().filter(|e| **e == "tick").count() >= 3);

        reactor.del_timer(tick);
        assert_eq!(reactor.timers(), 0);
    }

    #[test]
    fn test_timer_cancelled_by_earlier_timer_does_not_fire() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let victim = Rc::new(std::cell::Cell::new(None));

        let target = Rc::clone(&victim);
        reactor.add_timer(
            Duration::from_millis(1),
            TimerMode::Once,
            move |reactor: &mut Reactor<Log>, log: &mut Log, _| {
                log.entries.push("canceller");
                if let Some(id) = target.get() {
                    reactor.del_timer(id);
                }
            },
        );
        let id = reactor.add_timer(Duration::from_millis(2), TimerMode::Once, |_, log: &mut Log, _| {
            log.entries.push("cancelled");
        });
        victim.set(Some(id));

        std::thread::sleep(Duration::from_millis(10));
        reactor
            .turn(&mut log, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(log.entries, vec!["canceller"]);
        assert_eq!(reactor.timers(), 0);
    }

    #[test]
    fn test_signal_watcher() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        reactor
            .add_signal(SIGUSR2, |_, log: &mut Log, _| log.entries.push("signal"))
            .unwrap();
        signal_hook::low_level::raise(SIGUSR2).unwrap();
        reactor
            .turn(&mut log, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(log.entries, vec!["signal"]);

        reactor.del_signal(SIGUSR2).unwrap();
        assert_eq!(reactor.signal_watchers(), 0);
    }

    #[test]
    fn test_destroy_from_callback_stops_loop() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        reactor.add_timer(Duration::from_millis(5), TimerMode::Once, |reactor: &mut Reactor<Log>, log: &mut Log, _| {
            log.entries.push("stop");
            reactor.destroy(Duration::ZERO).unwrap();
        });

        reactor.run(&mut log).unwrap();
        assert_eq!(log.entries, vec!["stop"]);
        assert!(!reactor.is_running());
    }

    #[test]
    fn test_destroy_grace_waits_for_io_watchers() {
        let mut reactor = Reactor::new().unwrap();
        let mut log = Log::default();
        let (a, _b) = pair();
        reactor.add(a.as_raw_fd(), Direction::Read, |_, _, _| {}).unwrap();
        reactor.add_timer(Duration::from_millis(1), TimerMode::Once, |reactor: &mut Reactor<Log>, _, _| {
            reactor.destroy(Duration::from_millis(100)).unwrap();
        });

        let started = Instant::now();
        reactor.run(&mut log).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(reactor.io_watchers(), 0);
    }

    #[test]
    fn test_destroy_when_idle_clears_everything() {
        let mut reactor = Reactor::<Log>::new().unwrap();
        let (a, _b) = pair();
        reactor.add(a.as_raw_fd(), Direction::Read, |_, _, _| {}).unwrap();
        reactor.add_timer(Duration::from_secs(10), TimerMode::Once, |_, _, _| {});
        reactor.destroy(Duration::from_secs(5)).unwrap();
        assert_eq!(reactor.io_watchers(), 0);
        assert_eq!(reactor.timers(), 0);

        // reusable after teardown
        reactor.add(a.as_raw_fd(), Direction::Read, |_, _, _| {}).unwrap();
        assert_eq!(reactor.io_watchers(), 1);
    }
}
