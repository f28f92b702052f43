//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! gem.toml
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, signal map resolution)
//!     → GemConfig (validated, immutable)
//!     → ServerConfig applied wholesale to the engine
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes ship with a graceful restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::GemConfig;
pub use schema::LifecycleConfig;
pub use schema::LogFormat;
pub use schema::ObservabilityConfig;
pub use schema::ServerConfig;
