//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! First launch:  configured addrs → listener.rs (fresh bind)
//! Restart:       GEM_SERVER_ADDRS → fd table → listener.rs (inherited fds)
//!     → serving copies handed to the HTTP engine
//!     → tls.rs (optional TLS acceptor)
//!     → connection.rs (in-flight tracking, keep-alive policy, per-peer cap)
//! ```
//!
//! # Design Decisions
//! - Listeners are opened once per process generation, in address order
//! - Each request is tracked for graceful drain
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{InFlightTracker, KeepAlivePolicy, PeerLimiter};
pub use listener::ListenerSet;
