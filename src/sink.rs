//! Rotating file sink shared by every handle of one logger family.
//!
//! The active file is owned by a [`logroller::LogRoller`] kept behind an
//! `Arc<Mutex<Option<_>>>`. Handles clone the `Arc`, so closing through any
//! of them releases the file for all, and later closes find the slot empty.
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use logroller::{LogRoller, LogRollerBuilder, Rotation, RotationSize};
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Settings;

/// Rotated backups older than this are removed on open, periodically while
/// writing, and on close.
pub const MAX_BACKUP_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Minimum time between backup sweeps while the file is being written.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Failures raised while provisioning, opening or releasing the file sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The log directory could not be created.
    #[error("failed to create log directory {}: {source}", dir.display())]
    CreateDirectory {
        /// Directory that was being created.
        dir: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
    /// The rotation library refused to open the log file.
    #[error("failed to open log file {}: {reason}", path.display())]
    Open {
        /// Log file that was being opened.
        path: PathBuf,
        /// Error reported by the rotation library.
        reason: String,
    },
    /// Buffered records could not be flushed while closing.
    #[error("failed to flush log file: {0}")]
    Flush(#[source] io::Error),
    /// A writer panicked while holding the file lock.
    #[error("log file lock poisoned")]
    Poisoned,
}

/// Create `dir` and any missing ancestors.
///
/// On unix the directory is created with `mode`; when it did not exist before,
/// its permission bits are then set to exactly `mode` so the umask cannot
/// narrow them.
pub fn provision_directory(dir: &Path, mode: u32) -> Result<(), SinkError> {
    let existed = dir.is_dir();
    create_dir_all(dir, mode).map_err(|source| SinkError::CreateDirectory {
        dir: dir.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    if !existed {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(|source| {
            SinkError::CreateDirectory {
                dir: dir.to_path_buf(),
                source,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = existed;

    Ok(())
}

#[cfg(unix)]
fn create_dir_all(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(mode).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all(dir: &Path, _mode: u32) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Remove rotated siblings of `filename` in `dir` whose last modification is
/// older than `max_age`. The active file itself is never touched.
///
/// Returns the number of removed backups.
pub fn prune_expired_backups(dir: &Path, filename: &str, max_age: Duration) -> io::Result<usize> {
    let prefix = format!("{filename}.");
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if age > max_age {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}

struct Active {
    roller: LogRoller,
    last_sweep: Instant,
}

impl Active {
    /// Age out backups at most once per `interval`. Failures surface only at open.
    fn sweep_if_due(&mut self, dir: &Path, filename: &str, interval: Duration) {
        if self.last_sweep.elapsed() < interval {
            return;
        }
        self.last_sweep = Instant::now();
        let _ = prune_expired_backups(dir, filename, MAX_BACKUP_AGE);
    }
}

struct Shared {
    dir: PathBuf,
    filename: String,
    path: PathBuf,
    sweep_interval: Duration,
    slot: Mutex<Option<Active>>,
}

/// Shared, closable handle on the rotating log file.
#[derive(Clone)]
pub struct RotatingFile {
    shared: Arc<Shared>,
}

impl RotatingFile {
    /// Open the rotating file described by `settings`: size-based rotation at
    /// `max_size_mb`, at most `max_backups` backups, uncompressed.
    pub fn open(settings: &Settings) -> Result<Self, SinkError> {
        Self::open_with_sweep_interval(settings, SWEEP_INTERVAL)
    }

    pub(crate) fn open_with_sweep_interval(
        settings: &Settings,
        sweep_interval: Duration,
    ) -> Result<Self, SinkError> {
        let path = settings.log_file();
        let directory = settings.log_dir.to_string_lossy();
        // Rotation renames run on a worker thread; joining it on flush keeps close synchronous.
        let roller = LogRollerBuilder::new(directory.as_ref(), settings.filename.as_str())
            .rotation(Rotation::SizeBased(RotationSize::MB(settings.max_size_mb)))
            .max_keep_files(settings.max_backups)
            .graceful_shutdown(true)
            .build()
            .map_err(|err| SinkError::Open {
                path: path.clone(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                dir: settings.log_dir.clone(),
                filename: settings.filename.clone(),
                path,
                sweep_interval,
                slot: Mutex::new(Some(Active {
                    roller,
                    last_sweep: Instant::now(),
                })),
            }),
        })
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Whether the file has already been released.
    pub fn is_closed(&self) -> bool {
        self.shared
            .slot
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true)
    }

    /// Flush and release the file, then age out expired backups.
    /// Closing an already closed sink is a no-op.
    pub fn close(&self) -> Result<(), SinkError> {
        let active = self
            .shared
            .slot
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .take();

        let Some(mut active) = active else {
            return Ok(());
        };
        let flushed = active.roller.flush().map_err(SinkError::Flush);
        drop(active);
        let _ = prune_expired_backups(&self.shared.dir, &self.shared.filename, MAX_BACKUP_AGE);
        flushed
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Option<Active>>> {
        self.shared
            .slot
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))
    }
}

/// Writer handed out per record; writes after `close` are discarded.
pub struct FileWriter<'a> {
    file: &'a RotatingFile,
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self.file.lock()?;
        let Some(active) = slot.as_mut() else {
            return Ok(buf.len());
        };
        active.roller.write_all(buf)?;

        let shared = &self.file.shared;
        active.sweep_if_due(&shared.dir, &shared.filename, shared.sweep_interval);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock()?.as_mut() {
            Some(active) => active.roller.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = FileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter { file: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs::File;

    fn settings_in(dir: &Path) -> Settings {
        Config {
            log_dir: dir.to_string_lossy().into_owned(),
            filename: "sink.log".into(),
            ..Config::default()
        }
        .normalize()
        .unwrap()
    }

    fn read_logs(dir: &Path, filename: &str) -> String {
        let mut contents = String::new();
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_name().to_string_lossy().starts_with(filename) {
                contents.push_str(&fs::read_to_string(entry.path()).unwrap());
            }
        }
        contents
    }

    #[test]
    fn writes_then_discards_after_close() {
        let tmp = tempfile::tempdir().unwrap();
        let file = RotatingFile::open(&settings_in(tmp.path())).unwrap();

        file.make_writer().write_all(b"first\n").unwrap();
        file.close().unwrap();
        assert!(file.is_closed());
        file.make_writer().write_all(b"second\n").unwrap();

        let contents = read_logs(tmp.path(), "sink.log");
        assert!(contents.contains("first"));
        assert!(!contents.contains("second"));
    }

    #[test]
    fn close_is_shared_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = RotatingFile::open(&settings_in(tmp.path())).unwrap();
        let sibling = file.clone();

        file.close().unwrap();
        assert!(sibling.is_closed());
        sibling.close().unwrap();
        file.close().unwrap();
    }

    #[test]
    fn path_points_at_active_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = RotatingFile::open(&settings_in(tmp.path())).unwrap();

        assert_eq!(file.path(), tmp.path().join("sink.log"));
    }

    #[test]
    fn provision_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");

        provision_directory(&nested, 0o750).unwrap();
        assert!(nested.is_dir());
        provision_directory(&nested, 0o750).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn provision_applies_exact_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("private");
        provision_directory(&dir, 0o700).unwrap();

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn provision_reports_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        File::create(&blocker).unwrap();

        let err = provision_directory(&blocker.join("logs"), 0o750).unwrap_err();
        assert!(matches!(err, SinkError::CreateDirectory { .. }));
        assert!(err.to_string().contains("blocker"));
    }

    fn backdate(path: &Path) {
        let stale = SystemTime::now() - Duration::from_secs(31 * 24 * 60 * 60);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(stale)
            .unwrap();
    }

    #[test]
    fn writes_sweep_expired_backups_once_due() {
        let tmp = tempfile::tempdir().unwrap();
        let file =
            RotatingFile::open_with_sweep_interval(&settings_in(tmp.path()), Duration::ZERO)
                .unwrap();
        let backup = tmp.path().join("sink.log.7");
        File::create(&backup).unwrap();
        backdate(&backup);

        file.make_writer().write_all(b"record\n").unwrap();

        assert!(!backup.exists());
        file.close().unwrap();
    }

    #[test]
    fn writes_before_the_interval_leave_backups_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let file = RotatingFile::open(&settings_in(tmp.path())).unwrap();
        let backup = tmp.path().join("sink.log.7");
        File::create(&backup).unwrap();
        backdate(&backup);

        file.make_writer().write_all(b"record\n").unwrap();
        assert!(backup.exists());

        file.close().unwrap();
        assert!(!backup.exists());
    }

    #[test]
    fn prune_removes_only_expired_backups() {
        let tmp = tempfile::tempdir().unwrap();

        let active = tmp.path().join("app.log");
        let old_backup = tmp.path().join("app.log.1");
        let fresh_backup = tmp.path().join("app.log.2");
        let unrelated = tmp.path().join("other.log.1");
        for path in [&active, &old_backup, &fresh_backup, &unrelated] {
            File::create(path).unwrap();
        }
        for path in [&active, &old_backup, &unrelated] {
            backdate(path);
        }

        let removed = prune_expired_backups(tmp.path(), "app.log", MAX_BACKUP_AGE).unwrap();

        assert_eq!(removed, 1);
        assert!(active.exists());
        assert!(!old_backup.exists());
        assert!(fresh_backup.exists());
        assert!(unrelated.exists());
    }
}
