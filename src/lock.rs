//! File-based repository locks.
//!
//! A lock is a file created with `create_new` (fails if present) whose
//! body names the holder. [`LockGuard`] releases on drop, so a lock
//! can never outlive its scope on a clean exit; a stale file from a
//! crashed process is surfaced in the timeout error for the user to
//! remove.
//!
//! Two locks exist per repository: the working-copy lock (held for the
//! whole checking→recording sequence) and the store lock (commits).
//! Acquisition order is fixed — working copy before store — and the
//! repo layer's API makes the wrong order unrepresentable.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Timing knobs for lock acquisition.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Give up after this many seconds.
    pub timeout_secs: u64,
    /// Emit a "still waiting" warning after this many seconds.
    pub warn_after_secs: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self { timeout_secs: 60, warn_after_secs: 5 }
    }
}

/// A held lock; dropping it releases the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock at `path`, waiting up to the configured timeout.
    pub fn acquire(path: &Path, opts: LockOptions) -> Result<Self, LockError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| LockError::Io(format!("create dir {}: {e}", dir.display())))?;
        }

        let start = Instant::now();
        let mut warned = false;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let holder = format!("pid:{}", std::process::id());
                    let _ = file.write_all(holder.as_bytes());
                    debug!(path = %path.display(), "lock acquired");
                    return Ok(Self { path: path.to_owned() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let waited = start.elapsed();
                    if !warned && waited >= Duration::from_secs(opts.warn_after_secs) {
                        warn!(path = %path.display(), "waiting for lock held by another process");
                        warned = true;
                    }
                    if waited >= Duration::from_secs(opts.timeout_secs) {
                        let holder = fs::read_to_string(path).unwrap_or_default();
                        return Err(LockError::Timeout {
                            path: path.to_owned(),
                            waited_secs: waited.as_secs(),
                            holder,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    return Err(LockError::Io(format!("create {}: {e}", path.display())));
                }
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release lock");
            }
        } else {
            debug!(path = %self.path.display(), "lock released");
        }
    }
}

/// Errors from lock acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockError {
    /// Another process held the lock for the whole wait.
    Timeout {
        path: PathBuf,
        waited_secs: u64,
        holder: String,
    },
    /// I/O failure creating or inspecting the lock file.
    Io(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { path, waited_secs, holder } => {
                write!(
                    f,
                    "timed out after {waited_secs}s waiting for lock {}",
                    path.display()
                )?;
                if !holder.is_empty() {
                    write!(f, " (held by {holder})")?;
                }
                write!(
                    f,
                    "\n  If no other process is running, remove the stale lock file and retry."
                )
            }
            Self::Io(msg) => write!(f, "lock I/O error: {msg}"),
        }
    }
}

impl std::error::Error for LockError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_opts() -> LockOptions {
        LockOptions { timeout_secs: 1, warn_after_secs: 0 }
    }

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wlock");
        {
            let _guard = LockGuard::acquire(&path, fast_opts()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists(), "released on drop");
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wlock");
        let _held = LockGuard::acquire(&path, fast_opts()).unwrap();

        let err = LockGuard::acquire(&path, fast_opts()).unwrap_err();
        match err {
            LockError::Timeout { holder, .. } => {
                assert!(holder.starts_with("pid:"));
            }
            LockError::Io(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn reacquire_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wlock");
        drop(LockGuard::acquire(&path, fast_opts()).unwrap());
        let _second = LockGuard::acquire(&path, fast_opts()).unwrap();
    }
}
