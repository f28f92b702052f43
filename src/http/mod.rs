//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Listener (fresh or inherited)
//!     → server.rs (axum-server per listener, HTTP/1.1 and HTTP/2)
//!     → middleware.rs (in-flight tracking, keep-alive policy, limits)
//!     → application router (dispatch is the application's concern)
//!     → status.rs (built-in lifecycle routes)
//! ```

pub mod middleware;
pub mod server;
pub mod status;

pub use server::HttpServer;
