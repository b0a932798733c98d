//! Pre-fork process supervisor.
//!
//! ```text
//!   main process ──fork──▶ worker (server A) ─▶ Reactor::run
//!        │        ├─fork─▶ worker (server A) ─▶ Reactor::run
//!        │        └─fork─▶ worker (server B) ─▶ Reactor::run
//!        │
//!   shutdown signal ──relay──▶ every worker: close listener, close
//!        │                     connections, destroy(grace), exit 0
//!        └── waitpid until no worker is left
//! ```
//!
//! The main process never runs a reactor. It watches a signal-hook flag and
//! polls `waitpid` every `reap_interval`.

use std::{
    collections::HashMap,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{kill, SigSet, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use signal_hook::{flag, low_level, SigId};
use tracing::{debug, info, warn};

use crate::{
    error::{NetworkError, Result},
    logger::LogLevel,
    process::{set_title, Os},
};

use super::{
    config::SupervisorConfig,
    connection::ConnectionTable,
    server::{Server, ServerId},
    NetReactor,
};

/// Exit code of a worker whose loop or startup failed.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code of a worker that panicked.
pub const EXIT_PANIC: i32 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Exited(i32),
    Signaled(i32),
}

impl WorkerStatus {
    pub fn success(&self) -> bool {
        matches!(self, WorkerStatus::Exited(0))
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Exited(code) => write!(f, "exited with {code}"),
            WorkerStatus::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// A reaped worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub pid: i32,
    pub server: ServerId,
    pub status: WorkerStatus,
}

/// Requests a shutdown from any thread, as if the shutdown signal arrived.
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    servers: Vec<Rc<Server>>,
    workers: HashMap<Pid, ServerId>,
    stop_requested: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            servers: Vec::new(),
            workers: HashMap::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add(&mut self, server: Rc<Server>) -> &mut Self {
        self.servers.push(server);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: Arc::clone(&self.stop_requested),
        }
    }

    /// Pids of the live workers.
    pub fn workers(&self) -> Vec<i32> {
        self.workers.keys().map(|pid| pid.as_raw()).collect()
    }

    /// Forks every server's workers and blocks until all of them have
    /// exited. Returns one entry per reaped worker.
    pub fn run(&mut self) -> Result<Vec<WorkerExit>> {
        if self.servers.is_empty() {
            return Err(NetworkError::Configuration("no servers to run".into()));
        }
        if let Err(e) = set_title(&self.config.title) {
            debug!(error = %e, "failed to set process title");
        }

        let os = Os::current();
        info!(%os, servers = self.servers.len(), "supervisor starting");
        if !os.balances_reuse_port() && self.servers.iter().any(|s| s.config().workers > 1) {
            warn!(%os, "SO_REUSEPORT does not balance connections here; workers may be uneven");
        }

        let signal = self.config.shutdown_signal;
        let mask = shutdown_mask(signal)?;
        let sig_id = flag::register(signal, Arc::clone(&self.stop_requested))
            .map_err(|source| NetworkError::Signal { signal, source })?;

        // children inherit the blocked mask and unblock once their pipe
        // watcher is in place, so a relay sent while they start stays pending
        if let Err(errno) = mask.thread_block() {
            low_level::unregister(sig_id);
            return Err(mask_error(signal, errno));
        }
        let spawned = self.spawn_all(sig_id);
        if let Err(errno) = mask.thread_unblock() {
            warn!(error = %errno, signal, "failed to unblock shutdown signal");
        }

        let result = match spawned {
            Ok(()) => self.reap(),
            Err(e) => {
                self.config.logger.log(
                    LogLevel::Error,
                    &format!("Failed to start workers: {}", e),
                );
                if let Err(stop_error) = self.stop() {
                    warn!(error = %stop_error, "failed to stop workers");
                }
                if let Err(reap_error) = self.reap() {
                    warn!(error = %reap_error, "failed to reap workers");
                }
                Err(e)
            }
        };
        low_level::unregister(sig_id);
        info!("supervisor stopped");
        result
    }

    /// Relays the shutdown signal to every live worker.
    pub fn stop(&self) -> Result<()> {
        let signal = shutdown_signal(self.config.shutdown_signal)?;
        for pid in self.workers.keys() {
            match kill(*pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => self.config.logger.log(
                    LogLevel::Warn,
                    &format!("Failed to signal worker {}: {}", pid, e),
                ),
            }
        }
        Ok(())
    }

    fn spawn_all(&mut self, sig_id: SigId) -> Result<()> {
        let servers = self.servers.clone();
        for server in &servers {
            for _ in 0..server.config().workers {
                // SAFETY: the child builds its own reactor, never returns into
                // the caller and leaves through `process::exit`.
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        low_level::unregister(sig_id);
                        let code = worker_main(server, &self.config);
                        std::process::exit(code);
                    }
                    Ok(ForkResult::Parent { child }) => {
                        debug!(pid = child.as_raw(), server = %server.id(), "worker started");
                        self.workers.insert(child, server.id());
                    }
                    Err(e) => return Err(NetworkError::Fork(e)),
                }
            }
        }
        Ok(())
    }

    fn reap(&mut self) -> Result<Vec<WorkerExit>> {
        let mut exits = Vec::with_capacity(self.workers.len());
        while !self.workers.is_empty() {
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                info!(workers = self.workers.len(), "shutdown requested");
                self.stop()?;
            }

            let mut reaped = false;
            let pids: Vec<Pid> = self.workers.keys().copied().collect();
            for pid in pids {
                let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => WorkerStatus::Exited(code),
                    Ok(WaitStatus::Signaled(_, signal, _)) => WorkerStatus::Signaled(signal as i32),
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        warn!(pid = pid.as_raw(), "worker vanished before it was reaped");
                        self.workers.remove(&pid);
                        continue;
                    }
                    Err(e) => return Err(NetworkError::Wait(e)),
                };
                if let Some(server) = self.workers.remove(&pid) {
                    let exit = WorkerExit {
                        pid: pid.as_raw(),
                        server,
                        status,
                    };
                    if status.success() {
                        debug!(pid = exit.pid, %server, "worker exited");
                    } else {
                        self.config.logger.log(
                            LogLevel::Warn,
                            &format!("Worker {} of server {} {}", exit.pid, server, status),
                        );
                    }
                    exits.push(exit);
                    reaped = true;
                }
            }

            if !reaped && !self.workers.is_empty() {
                thread::sleep(self.config.reap_interval);
            }
        }
        Ok(exits)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("title", &self.config.title)
            .field("servers", &self.servers.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn shutdown_signal(signal: i32) -> Result<Signal> {
    Signal::try_from(signal).map_err(|e| {
        NetworkError::Configuration(format!("invalid shutdown signal {signal}: {e}"))
    })
}

fn shutdown_mask(signal: i32) -> Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(shutdown_signal(signal)?);
    Ok(mask)
}

fn mask_error(signal: i32, errno: Errno) -> NetworkError {
    NetworkError::Signal {
        signal,
        source: io::Error::from(errno),
    }
}

fn worker_main(server: &Rc<Server>, config: &SupervisorConfig) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(|| run_worker(server, config))) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            config.logger.log(
                LogLevel::Error,
                &format!("Worker {} failed: {}", std::process::id(), e),
            );
            EXIT_FAILURE
        }
        Err(_) => {
            config.logger.log(
                LogLevel::Error,
                &format!("Worker {} panicked", std::process::id()),
            );
            EXIT_PANIC
        }
    }
}

/// Body of one worker process: listens on `server` with a fresh reactor and
/// serves until the shutdown signal arrives. Also usable without forking.
pub fn run_worker(server: &Rc<Server>, config: &SupervisorConfig) -> Result<()> {
    if let Err(e) = set_title(&server.title()) {
        debug!(error = %e, "failed to set worker title");
    }

    let mut reactor = NetReactor::new()?;
    let mut table = ConnectionTable::new();

    let stopping = Rc::clone(server);
    let grace = config.grace;
    reactor.add_signal(
        config.shutdown_signal,
        move |reactor: &mut NetReactor, table: &mut ConnectionTable, signal| {
            debug!(signal, server = %stopping.id(), "worker stopping");
            shutdown_worker(&stopping, reactor, table, grace);
        },
    )?;
    // a shutdown relayed since the fork has been pending until here
    shutdown_mask(config.shutdown_signal)?
        .thread_unblock()
        .map_err(|errno| mask_error(config.shutdown_signal, errno))?;

    let address = server.listen(&mut reactor)?;
    info!(server = %server.id(), %address, pid = std::process::id(), "worker listening");
    reactor.run(&mut table)?;

    // whatever outlived the grace period
    table.destroy_all(&mut reactor);
    Ok(())
}

/// Stops a worker gracefully: no new connections, every live connection
/// closed after its pending output, and the reactor destroyed with `grace`.
pub fn shutdown_worker(
    server: &Server,
    reactor: &mut NetReactor,
    table: &mut ConnectionTable,
    grace: Duration,
) {
    if let Err(e) = server.close(reactor) {
        server.config().logger.log(
            LogLevel::Warn,
            &format!("Failed to close listener of server {}: {}", server.id(), e),
        );
    }
    table.close_all(reactor);
    if let Err(e) = reactor.destroy(grace) {
        server.config().logger.log(
            LogLevel::Error,
            &format!("Failed to destroy reactor: {}", e),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{NoopHandler, ServerConfig};

    #[test]
    fn test_worker_status() {
        assert!(WorkerStatus::Exited(0).success());
        assert!(!WorkerStatus::Exited(EXIT_FAILURE).success());
        assert!(!WorkerStatus::Signaled(9).success());
        assert_eq!(WorkerStatus::Exited(101).to_string(), "exited with 101");
    }

    #[test]
    fn test_run_without_servers_fails() {
        let mut supervisor = Supervisor::new(SupervisorConfig::default());
        assert!(matches!(
            supervisor.run(),
            Err(NetworkError::Configuration(_))
        ));
    }

    #[test]
    fn test_stop_with_no_workers_is_noop() {
        let mut supervisor = Supervisor::new(SupervisorConfig::default());
        let server = Server::new(ServerConfig::default(), NoopHandler).unwrap();
        supervisor.add(server);
        supervisor.stop().unwrap();
        supervisor.stop_handle().stop();
        assert!(supervisor.workers().is_empty());
    }

    #[test]
    fn test_shutdown_mask_holds_only_the_shutdown_signal() {
        let mask = shutdown_mask(signal_hook::consts::SIGTERM).unwrap();
        assert!(mask.contains(Signal::SIGTERM));
        assert!(!mask.contains(Signal::SIGINT));
        assert!(shutdown_mask(0).is_err());
    }

    #[test]
    fn test_invalid_shutdown_signal() {
        let supervisor = Supervisor::new(SupervisorConfig::default().shutdown_signal(-3));
        assert!(supervisor.stop().is_err());
    }
}
