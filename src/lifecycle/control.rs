//! In-process control of a running server.
//!
//! Signals are the external interface; [`Control`] gives the embedding
//! application the same two levers without going through the kernel.

use std::fmt;

use tokio::sync::mpsc;

/// What a [`Control`] handle can ask of the lifecycle loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Drain and exit without a successor, like `SIGTERM`.
    Stop { reason: String },
    /// Start a restart cycle, like a signal bound to `restart`.
    Restart,
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::Stop { reason } => write!(f, "stop ({})", reason),
            ControlRequest::Restart => write!(f, "restart"),
        }
    }
}

/// Cloneable handle into one server's lifecycle loop.
///
/// Requests sent before `run` starts are queued and handled once it does.
#[derive(Debug, Clone)]
pub struct Control {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl Control {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Ask the server to stop. Returns false once the server is gone.
    pub fn stop(&self, reason: impl Into<String>) -> bool {
        self.send(ControlRequest::Stop { reason: reason.into() })
    }

    /// Ask the server to restart. Returns false once the server is gone.
    pub fn restart(&self) -> bool {
        self.send(ControlRequest::Restart)
    }

    fn send(&self, request: ControlRequest) -> bool {
        tracing::debug!(request = %request, "Control request");
        self.tx.send(request).is_ok()
    }
}
