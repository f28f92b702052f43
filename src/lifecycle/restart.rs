//! Restart coordination: spawn a successor, wait for it, commit to drain.
//!
//! # State Machine
//! ```text
//! Idle → Spawning → AwaitingChildReady → Draining → Stopped
//!          │                │
//!          └──── failure ───┴──→ Idle (parent keeps serving)
//! ```
//!
//! # Descriptor Layout in the Child
//! ```text
//! 0, 1, 2        stdio
//! 3 .. 3+N       listeners, in address order (same order as GEM_SERVER_ADDRS)
//! 3+N            write end of the readiness pipe
//! ```
//!
//! # Design Decisions
//! - One cycle at a time; a restart request outside `Idle` is a no-op
//! - Failures only abort the attempt: the child is killed, state returns to `Idle`
//! - Once `Draining`, nothing moves the state back
//! - A stop that lands mid-cycle wins: the half-started child is killed

use std::ffi::OsString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::fd_table::fd_for_offset;
use crate::lifecycle::handshake::build_child_environment;
use crate::net::ListenerSet;
use crate::observability::metrics;

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Restart cycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle = 0,
    Spawning = 1,
    AwaitingChildReady = 2,
    Draining = 3,
    Stopped = 4,
}

impl From<u8> for RestartState {
    fn from(val: u8) -> Self {
        match val {
            1 => RestartState::Spawning,
            2 => RestartState::AwaitingChildReady,
            3 => RestartState::Draining,
            4 => RestartState::Stopped,
            _ => RestartState::Idle,
        }
    }
}

impl RestartState {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartState::Idle => "idle",
            RestartState::Spawning => "spawning",
            RestartState::AwaitingChildReady => "awaiting_child_ready",
            RestartState::Draining => "draining",
            RestartState::Stopped => "stopped",
        }
    }
}

/// Program and arguments used to launch the successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl RestartCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-run this process the way it was started.
    ///
    /// argv[0] is preferred over `current_exe` so that a binary replaced on
    /// disk by a deploy is picked up.
    pub fn current() -> Self {
        let mut argv = std::env::args_os();
        let argv0 = argv.next().map(PathBuf::from);
        let program = match argv0 {
            Some(path) if path.components().count() > 1 => path,
            _ => std::env::current_exe().unwrap_or_else(|_| PathBuf::from("gem")),
        };
        Self {
            program,
            args: argv.collect(),
        }
    }
}

/// Drives restart cycles for one process generation.
#[derive(Debug, Clone)]
pub struct RestartCoordinator {
    state: Arc<AtomicU8>,
    /// Flips to true once draining starts; cuts a pending readiness wait short.
    draining: Arc<watch::Sender<bool>>,
    command: RestartCommand,
    readiness_grace: Duration,
}

impl RestartCoordinator {
    pub fn new(command: RestartCommand, readiness_grace: Duration) -> Self {
        let (draining, _) = watch::channel(false);
        Self {
            state: Arc::new(AtomicU8::new(RestartState::Idle as u8)),
            draining: Arc::new(draining),
            command,
            readiness_grace,
        }
    }

    pub fn state(&self) -> RestartState {
        RestartState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn readiness_grace(&self) -> Duration {
        self.readiness_grace
    }

    fn transition(&self, from: RestartState, to: RestartState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Commit to draining. Irreversible; returns the state it replaced.
    pub fn begin_drain(&self) -> RestartState {
        let mut current = self.state();
        while current != RestartState::Draining && current != RestartState::Stopped {
            if self.transition(current, RestartState::Draining) {
                self.draining.send_replace(true);
                tracing::info!(from = current.as_str(), "Restart coordinator draining");
                return current;
            }
            current = self.state();
        }
        current
    }

    pub fn mark_stopped(&self) {
        self.state.store(RestartState::Stopped as u8, Ordering::SeqCst);
    }

    /// Run one restart cycle.
    ///
    /// Returns `Ok(None)` when a cycle is already running, the parent is
    /// draining, or a stop overtook the cycle (the child is then killed).
    /// On `Ok(Some(child))` the state is `Draining` and the caller must drain
    /// the parent. On `Err` the state is back to `Idle`.
    pub async fn restart(&self, listeners: &ListenerSet) -> Result<Option<Child>, LifecycleError> {
        if !self.transition(RestartState::Idle, RestartState::Spawning) {
            tracing::info!(state = self.state().as_str(), "Restart already in progress, ignoring");
            metrics::record_restart("ignored");
            return Ok(None);
        }
        tracing::info!(program = ?self.command.program, "Restart requested, spawning child");

        let (child, ready) = match self.spawn_child(listeners) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.abandon(RestartState::Spawning, &e);
                return Err(e);
            }
        };

        if !self.transition(RestartState::Spawning, RestartState::AwaitingChildReady) {
            tracing::warn!("Stop requested while spawning, discarding child");
            discard_child(child).await;
            metrics::record_restart("cancelled");
            return Ok(None);
        }
        tracing::info!(
            child_pid = child.id(),
            grace = ?self.readiness_grace,
            "Child spawned, awaiting readiness"
        );

        let mut draining = self.draining.subscribe();
        let stopped = async move {
            let _ = draining.wait_for(|draining| *draining).await;
        };
        let ready = tokio::select! {
            ready = self.await_ready(ready) => ready,
            _ = stopped => {
                tracing::warn!(child_pid = child.id(), "Stop requested while awaiting child, discarding it");
                discard_child(child).await;
                metrics::record_restart("cancelled");
                return Ok(None);
            }
        };

        match ready {
            Ok(()) => {
                if !self.transition(RestartState::AwaitingChildReady, RestartState::Draining) {
                    tracing::warn!(child_pid = child.id(), "Stop requested while awaiting child, discarding it");
                    discard_child(child).await;
                    metrics::record_restart("cancelled");
                    return Ok(None);
                }
                self.draining.send_replace(true);
                tracing::info!(child_pid = child.id(), "Child ready, handing over");
                metrics::record_restart("handed_over");
                Ok(Some(child))
            }
            Err(e) => {
                discard_child(child).await;
                self.abandon(RestartState::AwaitingChildReady, &e);
                Err(e)
            }
        }
    }

    fn abandon(&self, from: RestartState, error: &LifecycleError) {
        self.transition(from, RestartState::Idle);
        tracing::error!(error = %error, "Restart aborted, parent keeps serving");
        metrics::record_restart("failed");
    }

    fn spawn_child(&self, listeners: &ListenerSet) -> Result<(Child, OwnedFd), LifecycleError> {
        let (ready_rx, ready_tx) = readiness_pipe().map_err(LifecycleError::SpawnFailure)?;

        let child = listeners.with_descriptors(|addrs, fds| {
            let env = build_child_environment(std::env::vars_os(), addrs);

            let mut sources: Vec<RawFd> = fds.to_vec();
            sources.push(ready_tx.as_raw_fd());
            let mut staged: Vec<RawFd> = vec![-1; sources.len()];

            let mut cmd = Command::new(&self.command.program);
            cmd.args(&self.command.args)
                .env_clear()
                .envs(env)
                .stdin(Stdio::null())
                .kill_on_drop(false);

            // SAFETY: the closure runs between fork and exec and only calls
            // fcntl/dup2 on descriptors that stay open while `with_descriptors`
            // holds the set; `staged` is preallocated so nothing allocates.
            unsafe {
                cmd.pre_exec(move || place_descriptors(&sources, &mut staged));
            }

            tracing::debug!(
                addrs = ?addrs,
                fds = ?fds,
                "Passing listeners to child"
            );
            cmd.spawn()
        });
        // The child holds its own copy of the write end; ours must go so that
        // a dying child shows up as EOF.
        drop(ready_tx);

        let child = child.map_err(LifecycleError::SpawnFailure)?;
        Ok((child, ready_rx))
    }

    /// Wait for the readiness byte, bounded by the grace interval.
    async fn await_ready(&self, ready: OwnedFd) -> Result<(), LifecycleError> {
        let mut receiver = pipe::Receiver::from_owned_fd(ready).map_err(LifecycleError::SpawnFailure)?;
        let mut buf = [0u8; 1];

        match tokio::time::timeout(self.readiness_grace, receiver.read(&mut buf)).await {
            Ok(Ok(1)) => Ok(()),
            Ok(Ok(_)) => Err(LifecycleError::ChildExited),
            Ok(Err(e)) => Err(LifecycleError::SpawnFailure(e)),
            Err(_) => Err(LifecycleError::ReadinessTimeout(self.readiness_grace)),
        }
    }
}

/// Kill a child that will not take over, and reap it.
async fn discard_child(mut child: Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Child already gone");
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => tracing::warn!(status = %status, "Child terminated"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to reap child"),
        Err(_) => tracing::warn!(child_pid = child.id(), "Child did not exit after kill"),
    }
}

/// Create the readiness pipe, both ends close-on-exec.
fn readiness_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` is a valid buffer for two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, both descriptors are fresh and owned by us.
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
        // SAFETY: fd is open for the lifetime of `rx`/`tx`.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok((rx, tx))
}

/// Move `sources[i]` to descriptor `3 + i` in the forked child.
///
/// Sources are first duplicated above the target range so that placing one
/// never clobbers another; the temporaries are close-on-exec. Must only call
/// async-signal-safe functions.
fn place_descriptors(sources: &[RawFd], staged: &mut [RawFd]) -> std::io::Result<()> {
    let floor = fd_for_offset(sources.len());
    for (slot, src) in staged.iter_mut().zip(sources) {
        // SAFETY: `src` is an open descriptor inherited across fork.
        let tmp = unsafe { libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, floor) };
        if tmp < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *slot = tmp;
    }
    for (offset, tmp) in staged.iter().enumerate() {
        // SAFETY: `tmp` is open and the target differs from it, so dup2 clears
        // close-on-exec on the new descriptor.
        if unsafe { libc::dup2(*tmp, fd_for_offset(offset)) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> RestartCoordinator {
        RestartCoordinator::new(
            RestartCommand::new("/nonexistent/gem", Vec::<String>::new()),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            RestartState::Idle,
            RestartState::Spawning,
            RestartState::AwaitingChildReady,
            RestartState::Draining,
            RestartState::Stopped,
        ] {
            assert_eq!(RestartState::from(state as u8), state);
        }
    }

    #[test]
    fn drain_is_irreversible() {
        let coordinator = coordinator();
        assert_eq!(coordinator.begin_drain(), RestartState::Idle);
        assert_eq!(coordinator.state(), RestartState::Draining);
        assert!(!coordinator.transition(RestartState::Idle, RestartState::Spawning));

        assert_eq!(coordinator.begin_drain(), RestartState::Draining);
        coordinator.mark_stopped();
        assert_eq!(coordinator.begin_drain(), RestartState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_returns_to_idle() {
        let coordinator = coordinator();
        let listeners = ListenerSet::bind(&["127.0.0.1:0"]).unwrap();

        let err = coordinator.restart(&listeners).await.unwrap_err();
        assert!(matches!(err, LifecycleError::SpawnFailure(_)));
        assert_eq!(coordinator.state(), RestartState::Idle);
        assert_eq!(listeners.len(), 1);
    }

    #[tokio::test]
    async fn restart_while_draining_is_ignored() {
        let coordinator = coordinator();
        let listeners = ListenerSet::bind(&["127.0.0.1:0"]).unwrap();
        coordinator.begin_drain();

        assert!(coordinator.restart(&listeners).await.unwrap().is_none());
        assert_eq!(coordinator.state(), RestartState::Draining);
    }

    #[test]
    fn argv0_with_path_is_used() {
        let command = RestartCommand::current();
        assert!(command.program.components().count() > 1);
    }
}
