//! Gem: an HTTP server front-end with signal-driven graceful restart.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;

/// Framework name.
pub const NAME: &str = "gem";

/// Framework version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::schema::GemConfig;
pub use http::HttpServer;
pub use lifecycle::{Control, LifecycleError, Signal, SignalAction};
pub use server::Server;
