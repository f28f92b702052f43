//! Error taxonomy for the lifecycle subsystem.
//!
//! # Propagation
//! - `InvalidAction` / `ReservedSignal` are returned synchronously to whoever
//!   registers a signal action; the registry is left untouched.
//! - `SpawnFailure` / `ReadinessTimeout` / `ChildExited` abort one restart
//!   attempt only. The coordinator logs them and the parent keeps serving.
//! - `ListenerClose` is logged during drain and never blocks process exit.

use std::convert::Infallible;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::signals::Signal;

/// Errors produced by signal registration, restart and drain.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Action value outside the `{Restart, Ignore}` enumeration.
    #[error("invalid signal action: {0}")]
    InvalidAction(String),

    /// Attempt to remap a signal whose action is hard-wired.
    #[error("the signal {0} is not allowed to be customized")]
    ReservedSignal(Signal),

    /// The OS refused to route the signal to us.
    #[error("failed to install handler for {signal}: {source}")]
    SignalInstall {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    /// The replacement process could not be created.
    #[error("failed to spawn child process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    /// The child did not confirm readiness within the grace interval.
    #[error("child process did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// The child exited before confirming readiness.
    #[error("child process exited before becoming ready")]
    ChildExited,

    /// Fresh bind of a listen address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An inherited descriptor is missing or is not the expected listener.
    #[error("inherited descriptor {fd} for {addr} is unusable: {reason}")]
    Inherit { addr: String, fd: i32, reason: String },

    /// I/O failure while closing a listener during shutdown.
    #[error("failed to close listener: {0}")]
    ListenerClose(#[source] std::io::Error),
}

impl From<Infallible> for LifecycleError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}
