//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     GEM_GRACEFUL_RESTART / GEM_SERVER_ADDRS (handshake.rs)
//!     → fd offset table (fd_table.rs) → bind or inherit listeners
//!     → serve → notify parent on the readiness slot
//!
//! Signals (signals.rs):
//!     OS signal → forwarding thread → lifecycle loop → registry resolves
//!     SIGTERM (reserved) → stop, no handoff
//!     Restart            → restart.rs
//!     Ignore             → nothing
//!
//! Control (control.rs):
//!     Control::stop / Control::restart → same paths as the signals
//!
//! Restart (restart.rs):
//!     Idle → Spawning → AwaitingChildReady → Draining → Stopped
//!
//! Drain (drain.rs):
//!     Stop keep-alive → stop accepting → wait in-flight ≤ wait timeout
//!     → force close → close listeners → exit
//! ```
//!
//! # Design Decisions
//! - Address order is the one contract shared by table, environment and
//!   descriptor slots
//! - Signal handling only forwards; spawning and draining run on the runtime
//! - A failed restart never touches the serving parent

pub mod control;
pub mod drain;
pub mod error;
pub mod fd_table;
pub mod handshake;
pub mod restart;
pub mod signals;
pub mod startup;

pub use control::{Control, ControlRequest};
pub use drain::{DrainController, DrainOutcome, DrainReport};
pub use error::LifecycleError;
pub use fd_table::FdOffsetTable;
pub use handshake::Handshake;
pub use restart::{RestartCommand, RestartCoordinator, RestartState};
pub use signals::{Signal, SignalAction, SignalRegistry};
