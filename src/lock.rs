//! Named, timeout-bounded mutual exclusion across processes.
//!
//! SQLite has weak concurrent-writer support, so multi-step write sequences
//! are serialized through an advisory file lock instead of relying on the
//! store's own isolation. Locks are named; unrelated sequences use different
//! names and do not contend.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::errors::ReservationError;

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// An exclusive lock on `<dir>/<name>.lock`, released on drop.
///
/// Acquisition is blocking; call from a blocking context (the database layer
/// already runs on tokio's blocking pool).
#[derive(Debug)]
pub struct NamedLock {
    file: File,
    path: PathBuf,
}

impl NamedLock {
    /// Acquire the lock, waiting up to `timeout`.
    pub fn acquire(dir: &Path, name: &str, timeout: Duration) -> Result<Self, ReservationError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| ReservationError::Database(anyhow::Error::new(e)))?;
        let path = dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ReservationError::Database(anyhow::Error::new(e)))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(RETRY_INTERVAL),
                Err(_) => {
                    return Err(ReservationError::LockTimeout {
                        name: name.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        // The OS releases the lock on close anyway; this just makes it prompt.
        let _ = FileExt::unlock(&self.file);
    }
}
