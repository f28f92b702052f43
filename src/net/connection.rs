//! In-flight request tracking and connection reuse policy.
//!
//! # Responsibilities
//! - Count requests currently being handled, across all listeners
//! - Let the drain wait for that count to reach zero without polling
//! - Decide whether responses may advertise connection reuse
//! - Cap concurrent requests per peer IP
//!
//! # Design Decisions
//! - Count lives in a watch channel: increments and decrements notify waiters
//! - Guards decrement on drop, so a panicking handler still releases its slot
//! - Keep-alive policy is a pair of atomic flags, read on every response

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for request IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-local identifier for a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestSlot(u64);

impl RequestSlot {
    fn next() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Tracks in-flight requests for the drain.
#[derive(Debug, Clone)]
pub struct InFlightTracker {
    count: Arc<watch::Sender<u64>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Record a new in-flight request. Returns a guard that decrements on drop.
    pub fn track(&self) -> RequestGuard {
        let mut now = 0;
        self.count.send_modify(|c| {
            *c += 1;
            now = *c;
        });
        metrics::set_in_flight(now);
        RequestGuard {
            count: Arc::clone(&self.count),
            slot: RequestSlot::next(),
        }
    }

    /// Current number of in-flight requests.
    pub fn in_flight(&self) -> u64 {
        *self.count.borrow()
    }

    /// Resolve once no request is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

impl Default for InFlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard held for the duration of one request.
#[derive(Debug)]
pub struct RequestGuard {
    count: Arc<watch::Sender<u64>>,
    slot: RequestSlot,
}

impl RequestGuard {
    pub fn slot(&self) -> RequestSlot {
        self.slot
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let mut now = 0;
        self.count.send_modify(|c| {
            *c = c.saturating_sub(1);
            now = *c;
        });
        metrics::set_in_flight(now);
        tracing::trace!(request = %self.slot, "Request finished");
    }
}

/// Whether responses may leave the connection open for reuse.
#[derive(Debug, Clone, Default)]
pub struct KeepAlivePolicy {
    disabled: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
}

impl KeepAlivePolicy {
    pub fn new(disabled: bool) -> Self {
        Self {
            disabled: Arc::new(AtomicBool::new(disabled)),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// From now on every response tells the client not to reuse the connection.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn allows_reuse(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst) && !self.is_draining()
    }
}

/// Per-peer concurrent request cap.
#[derive(Debug, Clone)]
pub struct PeerLimiter {
    limit: usize,
    active: Arc<DashMap<IpAddr, usize>>,
}

impl PeerLimiter {
    /// `limit == 0` disables the cap.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Take a slot for `ip`, or `None` when it is at its limit.
    pub fn try_acquire(&self, ip: IpAddr) -> Option<PeerPermit> {
        let mut entry = self.active.entry(ip).or_insert(0);
        if self.is_enabled() && *entry >= self.limit {
            return None;
        }
        *entry += 1;
        Some(PeerPermit {
            ip,
            active: Arc::clone(&self.active),
        })
    }

    pub fn active(&self, ip: IpAddr) -> usize {
        self.active.get(&ip).map(|v| *v).unwrap_or(0)
    }
}

/// Releases a peer slot on drop.
#[derive(Debug)]
pub struct PeerPermit {
    ip: IpAddr,
    active: Arc<DashMap<IpAddr, usize>>,
}

impl Drop for PeerPermit {
    fn drop(&mut self) {
        self.active.remove_if_mut(&self.ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}
