//! Graceful drain of the current generation.
//!
//! # Sequence
//! ```text
//! stop keep-alive → stop accepting → wait for in-flight (≤ wait timeout)
//!     → force-close leftovers → join serve tasks → close listeners
//! ```
//!
//! # Data Loss
//! Requests still running when the wait timeout expires are cut off: their
//! connections are closed without a response. Clients see a reset and must
//! retry. A longer wait timeout trades slower exits for fewer cut requests.
//!
//! Listener close errors are logged and never block exit.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::http::HttpServer;
use crate::lifecycle::error::LifecycleError;
use crate::net::ListenerSet;
use crate::observability::metrics;

/// How long serve tasks get to wind down after connections are gone.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight request finished in time.
    Completed,
    /// The wait timeout expired with requests still running.
    Forced { remaining: u64 },
}

#[derive(Debug)]
pub struct DrainReport {
    pub outcome: DrainOutcome,
    pub elapsed: Duration,
    pub close_errors: Vec<LifecycleError>,
}

impl DrainReport {
    pub fn is_forced(&self) -> bool {
        matches!(self.outcome, DrainOutcome::Forced { .. })
    }
}

/// Stops one generation's engine and releases its listeners.
pub struct DrainController {
    server: Arc<HttpServer>,
    tasks: Vec<JoinHandle<io::Result<()>>>,
    listeners: Arc<ListenerSet>,
}

impl DrainController {
    pub fn new(
        server: Arc<HttpServer>,
        tasks: Vec<JoinHandle<io::Result<()>>>,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        Self {
            server,
            tasks,
            listeners,
        }
    }

    /// Drain, waiting at most `wait_timeout` for in-flight requests.
    pub async fn stop(self, wait_timeout: Duration) -> DrainReport {
        let started = Instant::now();
        let tracker = self.server.tracker().clone();

        self.server.policy().begin_drain();
        self.server.stop_accepting(wait_timeout);
        tracing::info!(
            in_flight = tracker.in_flight(),
            connections = self.server.connection_count(),
            wait_timeout = ?wait_timeout,
            "Draining"
        );

        let outcome = match tokio::time::timeout(wait_timeout, tracker.wait_idle()).await {
            Ok(()) => DrainOutcome::Completed,
            Err(_) => {
                let remaining = tracker.in_flight();
                tracing::warn!(remaining, "Wait timeout expired, closing remaining connections");
                self.server.force_close();
                DrainOutcome::Forced { remaining }
            }
        };

        for task in self.tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(JOIN_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Serve task ended with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Serve task panicked"),
                Err(_) => {
                    tracing::warn!("Serve task did not stop, aborting");
                    abort.abort();
                }
            }
        }

        let close_errors = self.listeners.close();
        for error in &close_errors {
            tracing::warn!(error = %error, "Listener close failed");
        }

        let elapsed = started.elapsed();
        let forced = matches!(outcome, DrainOutcome::Forced { .. });
        metrics::record_drain(elapsed, forced);
        tracing::info!(elapsed = ?elapsed, forced, "Drain finished");

        DrainReport {
            outcome,
            elapsed,
            close_errors,
        }
    }
}
