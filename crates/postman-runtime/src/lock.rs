//! One daemon per context directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use postman_core::{PostmanError, Result};

pub const LOCK_FILE: &str = "postman.lock";

/// Exclusive advisory lock on `<context dir>/postman.lock`, held until drop.
#[derive(Debug)]
pub struct ContextLock {
    file: File,
    path: PathBuf,
}

impl ContextLock {
    /// Take the lock without waiting. A held lock is
    /// [`PostmanError::Locked`].
    pub fn acquire(context_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(context_dir)?;
        let path = context_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(PostmanError::Locked(context_dir.to_path_buf()));
        }

        // Record the owner for humans; the lock itself is what counts.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!(path = %path.display(), "context lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ContextLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release context lock");
        }
    }
}
