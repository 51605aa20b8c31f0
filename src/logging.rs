//! Logger handles and the pipeline behind them.
//!
//! Every [`Logger::new`] call builds one `tracing::Dispatch` from a registry,
//! a `LevelFilter` and one fmt layer per sink. Nothing is installed as the
//! global default subscriber, so the threshold of one logger never leaks into
//! another logger or into unrelated `tracing` users in the same process.
//! Handles derived from a logger share its dispatch and differ only in the
//! context fields bound around each emission.
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt as layer_fmt;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

use crate::config::{Config, ConfigError, Settings, parse_level};
use crate::format::{self, ConsoleRecord, Fields, JsonRecord};
use crate::sink::{self, MAX_BACKUP_AGE, RotatingFile, SinkError};

const RECORD_TARGET: &str = "rotalog";

/// Sinks, options and the dispatch shared by every handle derived from one
/// [`Logger::new`] call.
struct Pipeline {
    level: LevelFilter,
    caller: bool,
    file: Option<RotatingFile>,
    dispatch: Dispatch,
}

impl Pipeline {
    /// Without a file the pipeline is a fallback and records go to `fallback`.
    fn new(
        level: LevelFilter,
        caller: bool,
        console: bool,
        file: Option<RotatingFile>,
        fallback: BoxMakeWriter,
    ) -> Self {
        let offset = format::local_offset();
        let file_layer = file.clone().map(|file| {
            layer_fmt::layer()
                .event_format(JsonRecord::new(offset))
                .with_writer(file)
        });
        let console_layer = console.then(|| {
            layer_fmt::layer()
                .event_format(ConsoleRecord::new(offset))
                .with_writer(std::io::stdout)
        });
        let fallback_layer = file.is_none().then(|| {
            layer_fmt::layer()
                .event_format(JsonRecord::new(offset))
                .with_writer(fallback)
        });

        let subscriber = tracing_subscriber::registry()
            .with(level)
            .with(file_layer)
            .with(console_layer)
            .with(fallback_layer);
        Self {
            level,
            caller,
            file,
            dispatch: Dispatch::new(subscriber),
        }
    }
}

/// Immutable logging handle.
///
/// Cloning or deriving a handle (see [`Logger::with_field`]) never mutates the
/// original. Handles derived from one [`Logger::new`] call share the log file,
/// which is released by [`Logger::close`] or when the last handle is dropped.
#[derive(Clone)]
pub struct Logger {
    pipeline: Arc<Pipeline>,
    context: Arc<Fields>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.pipeline.level)
            .field("log_file", &self.log_file())
            .field("fields", &self.context)
            .finish()
    }
}

impl Logger {
    /// Build a logger from `config`.
    ///
    /// Never fails: a traversal attempt in the configured paths, a directory
    /// that cannot be created, or a file the rotation library cannot open each
    /// produce a record on stderr and a handle that logs to stderr only.
    pub fn new(config: Config) -> Self {
        Self::with_fallback(config, BoxMakeWriter::new(std::io::stderr))
    }

    /// As [`Logger::new`], with `fallback` standing in for stderr.
    pub(crate) fn with_fallback(config: Config, fallback: BoxMakeWriter) -> Self {
        let settings = match config.normalize() {
            Ok(settings) => settings,
            Err(err) => return Self::rejected(parse_level(&config.level), &err, fallback),
        };

        if let Err(err) = sink::provision_directory(&settings.log_dir, settings.dir_mode) {
            let logger = Self::fallback(settings.level, fallback);
            logger
                .with_error(Some(&err))
                .with_field("log_dir", settings.log_dir.display().to_string())
                .error("Failed to create log directory, falling back to stderr");
            return logger;
        }

        let file = match RotatingFile::open(&settings) {
            Ok(file) => file,
            Err(err) => {
                let logger = Self::fallback(settings.level, fallback);
                logger
                    .with_error(Some(&err))
                    .with_field("log_file", settings.log_file().display().to_string())
                    .error("Failed to open log file, falling back to stderr");
                return logger;
            }
        };

        let logger = Self::from_pipeline(Pipeline::new(
            settings.level,
            settings.caller,
            settings.console,
            Some(file),
            fallback,
        ));
        logger.prune_backups(&settings);
        logger
    }

    /// Handle that writes JSON records to stderr and owns no file.
    pub fn stderr(level: LevelFilter) -> Self {
        Self::fallback(level, BoxMakeWriter::new(std::io::stderr))
    }

    fn fallback(level: LevelFilter, writer: BoxMakeWriter) -> Self {
        Self::from_pipeline(Pipeline::new(level, false, false, None, writer))
    }

    fn rejected(level: LevelFilter, err: &ConfigError, writer: BoxMakeWriter) -> Self {
        let logger = Self::fallback(level, writer);
        logger
            .with_field("security_warning", err.to_string())
            .error("SECURITY: Invalid logger configuration, falling back to stderr");
        logger
    }

    fn from_pipeline(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            context: Arc::new(Fields::new()),
        }
    }

    fn prune_backups(&self, settings: &Settings) {
        match sink::prune_expired_backups(&settings.log_dir, &settings.filename, MAX_BACKUP_AGE) {
            Ok(0) => {}
            Ok(removed) => self
                .with_field("removed", removed)
                .debug("Removed expired log backups"),
            Err(err) => self
                .with_error(Some(&err))
                .warn("Failed to remove expired log backups"),
        }
    }

    fn derive(&self, context: Fields) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            context: Arc::new(context),
        }
    }

    /// Threshold bound to this handle.
    pub fn level(&self) -> LevelFilter {
        self.pipeline.level
    }

    /// Whether a record at `level` would be written.
    pub fn is_enabled(&self, level: Level) -> bool {
        self.pipeline.level >= level
    }

    /// Context fields attached to every record of this handle.
    pub fn fields(&self) -> &Fields {
        &self.context
    }

    /// Active log file, or `None` for a stderr-only handle.
    pub fn log_file(&self) -> Option<&Path> {
        self.pipeline.file.as_ref().map(RotatingFile::path)
    }

    /// New handle with `key` bound to `value` on every record.
    ///
    /// Values that fail to serialize are recorded as their serialization error.
    pub fn with_field(&self, key: impl Into<String>, value: impl Serialize) -> Self {
        let mut context = (*self.context).clone();
        context.insert(key.into(), to_value(value));
        self.derive(context)
    }

    /// New handle with every pair of `fields` bound to its records.
    pub fn with_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        let mut context = (*self.context).clone();
        for (key, value) in fields {
            context.insert(key.into(), to_value(value));
        }
        self.derive(context)
    }

    /// New handle with `err` bound under the `error` key. `None` binds nothing.
    pub fn with_error(&self, err: Option<&(dyn StdError + 'static)>) -> Self {
        let mut context = (*self.context).clone();
        if let Some(err) = err {
            context.insert("error".into(), Value::String(err.to_string()));
        }
        self.derive(context)
    }

    /// Emit a debug record.
    #[track_caller]
    pub fn debug(&self, message: impl fmt::Display) {
        let caller = self.caller();
        self.emit(|| {
            tracing::debug!(target: RECORD_TARGET, caller = caller.as_deref(), "{message}");
        });
    }

    /// Emit an info record.
    #[track_caller]
    pub fn info(&self, message: impl fmt::Display) {
        let caller = self.caller();
        self.emit(|| {
            tracing::info!(target: RECORD_TARGET, caller = caller.as_deref(), "{message}");
        });
    }

    /// Emit a warn record.
    #[track_caller]
    pub fn warn(&self, message: impl fmt::Display) {
        let caller = self.caller();
        self.emit(|| {
            tracing::warn!(target: RECORD_TARGET, caller = caller.as_deref(), "{message}");
        });
    }

    /// Emit an error record.
    #[track_caller]
    pub fn error(&self, message: impl fmt::Display) {
        let caller = self.caller();
        self.emit(|| {
            tracing::error!(target: RECORD_TARGET, caller = caller.as_deref(), "{message}");
        });
    }

    fn emit(&self, record: impl FnOnce()) {
        format::scoped(&self.context, || {
            tracing::dispatcher::with_default(&self.pipeline.dispatch, record)
        });
    }

    /// `file:line` of the logging call, read before any closure runs.
    #[track_caller]
    fn caller(&self) -> Option<String> {
        let location = Location::caller();
        self.pipeline
            .caller
            .then(|| format!("{}:{}", location.file(), location.line()))
    }

    /// Flush and release the log file shared by this handle's family.
    ///
    /// Later calls through any handle of the family are no-ops, as is closing
    /// a stderr-only handle. Records emitted after closing are discarded.
    pub fn close(&self) -> Result<(), SinkError> {
        match &self.pipeline.file {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value)
        .unwrap_or_else(|err| Value::String(format!("serialization error: {err}")))
}
