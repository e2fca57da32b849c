//! Run lock over the configuration directory
//!
//! Only one run may own the reverse proxy at a time. The lock is an
//! advisory `flock` on `.certpilot.lock` inside the configuration
//! directory, released when the [`RunLock`] is dropped or the process dies.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use certpilot_common::LOCK_FILE;

use crate::errors::OrchestratorError;

/// Held for the duration of one run
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without waiting.
    ///
    /// Fails with `LockContention` when another run holds it.
    pub fn acquire(config_dir: &Path) -> Result<Self, OrchestratorError> {
        let path = config_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| OrchestratorError::io(&path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let mut holder = String::new();
                let holder = file
                    .read_to_string(&mut holder)
                    .ok()
                    .map(|_| holder.trim().to_string())
                    .filter(|h| !h.is_empty());
                return Err(OrchestratorError::LockContention { path, holder });
            }
            return Err(OrchestratorError::io(&path, e));
        }

        // Record the holder for diagnostics of a contending run
        let stamp = format!("pid {}", std::process::id());
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(stamp.as_bytes()))
            .map_err(|e| OrchestratorError::io(&path, e))?;

        debug!(path = %path.display(), "Run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        } else {
            debug!(path = %self.path.display(), "Run lock released");
        }
    }
}
