use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Directory used when `log_dir` is left empty.
pub const DEFAULT_LOG_DIR: &str = "./logs";
/// File name used when `filename` is left empty.
pub const DEFAULT_FILENAME: &str = "go.log";
/// Size threshold in megabytes used when `max_size_mb` is zero.
pub const DEFAULT_MAX_SIZE_MB: u64 = 10;
/// Number of rotated backups kept when `max_backups` is zero.
pub const DEFAULT_MAX_BACKUPS: u64 = 5;
/// Directory permissions used when `dir_mode` is zero (`rwxr-x---`).
pub const DEFAULT_DIR_MODE: u32 = 0o750;

/// Configuration hazards detected while normalizing a [`Config`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The cleaned log directory still walks above its starting point.
    #[error("path traversal detected in log directory: {}", dir.display())]
    DirectoryTraversal {
        /// Cleaned directory that was rejected.
        dir: PathBuf,
    },
    /// The file name contains path separators or names no file.
    #[error("invalid filename (contains path separators or traversal): {filename}")]
    InvalidFilename {
        /// File name as supplied by the caller.
        filename: String,
    },
}

/// Caller-supplied logger configuration.
///
/// Every field may be left at its zero value, in which case a default applies
/// during [`Config::normalize`]. The struct deserializes from any serde format
/// with all fields optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum severity: `debug`, `info`, `warn`/`warning` or `error`, case-insensitive.
    pub level: String,
    /// Directory holding the log file, created on demand.
    pub log_dir: String,
    /// Log file name; must not contain path separators.
    pub filename: String,
    /// Size in megabytes after which the file is rotated.
    pub max_size_mb: u64,
    /// Number of rotated files to retain.
    pub max_backups: u64,
    /// Mirror every record to stdout in a human-readable form.
    pub console: bool,
    /// Permission bits used when creating `log_dir`.
    pub dir_mode: u32,
    /// Omit the `file:line` call-site annotation from records.
    pub disable_caller: bool,
}

/// Normalized, validated form of a [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Threshold bound to the logger built from these settings.
    pub level: LevelFilter,
    /// Lexically cleaned log directory.
    pub log_dir: PathBuf,
    /// Validated file name.
    pub filename: String,
    /// Rotation threshold in megabytes.
    pub max_size_mb: u64,
    /// Rotated files to retain.
    pub max_backups: u64,
    /// Whether a stdout sink is attached.
    pub console: bool,
    /// Permission bits for directory creation.
    pub dir_mode: u32,
    /// Whether records carry the call site.
    pub caller: bool,
}

impl Settings {
    /// Full path of the active log file.
    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(&self.filename)
    }
}

impl Config {
    /// Apply defaults, clean both paths and reject traversal attempts.
    pub fn normalize(&self) -> Result<Settings, ConfigError> {
        let log_dir = clean_path(non_empty(&self.log_dir, DEFAULT_LOG_DIR));
        if has_parent_segment(&log_dir) {
            return Err(ConfigError::DirectoryTraversal { dir: log_dir });
        }

        let filename = non_empty(&self.filename, DEFAULT_FILENAME);
        let cleaned = clean_path(filename);
        if filename.contains(['/', '\\'])
            || has_parent_segment(&cleaned)
            || cleaned == Path::new(".")
        {
            return Err(ConfigError::InvalidFilename {
                filename: filename.to_string(),
            });
        }

        Ok(Settings {
            level: parse_level(&self.level),
            log_dir,
            filename: cleaned.to_string_lossy().into_owned(),
            max_size_mb: non_zero(self.max_size_mb, DEFAULT_MAX_SIZE_MB),
            max_backups: non_zero(self.max_backups, DEFAULT_MAX_BACKUPS),
            console: self.console,
            dir_mode: if self.dir_mode == 0 {
                DEFAULT_DIR_MODE
            } else {
                self.dir_mode
            },
            caller: !self.disable_caller,
        })
    }
}

/// Map a level name onto a threshold, falling back to `INFO` for anything unknown.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Lexically clean a path without touching the filesystem.
///
/// Repeated separators and `.` segments are dropped, `name/..` pairs cancel out,
/// and `..` directly under the root is discarded. Leading `..` segments of a
/// relative path survive, which is what [`Config::normalize`] looks for.
pub fn clean_path(path: impl AsRef<Path>) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

fn has_parent_segment(path: &Path) -> bool {
    path.components()
        .any(|component| component == Component::ParentDir)
}

fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

fn non_zero(value: u64, default: u64) -> u64 {
    if value == 0 { default } else { value }
}
