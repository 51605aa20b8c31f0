#![deny(missing_docs)]

//! Structured logging to a size-rotated file, with per-handle thresholds.
//!
//! [`Logger::new`] turns a [`Config`] into an immutable handle. Handles never
//! touch the global `tracing` subscriber, so loggers built with different
//! levels filter independently. A misconfigured or unusable log location never
//! fails construction: the handle falls back to stderr instead.
//!
//! ```rust,no_run
//! use rotalog::{Config, Logger};
//!
//! let logger = Logger::new(Config {
//!     level: "debug".into(),
//!     log_dir: "./logs".into(),
//!     filename: "service.log".into(),
//!     ..Config::default()
//! });
//!
//! let request = logger.with_field("request_id", 42);
//! request.info("handling request");
//! logger.close().ok();
//! ```

/// Logger configuration, defaults and path validation.
pub mod config;
/// Record formatters for file, stderr and console sinks.
pub mod format;
/// Logger handles, field attachment and emission.
pub mod logging;
/// Rotating file sink and directory provisioning.
pub mod sink;

pub use config::{Config, ConfigError, Settings};
pub use logging::Logger;
pub use sink::SinkError;
pub use tracing::Level;
pub use tracing::level_filters::LevelFilter;
