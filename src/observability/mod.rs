//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, generation id and pid as fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → /_gem/metrics on the served app (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
