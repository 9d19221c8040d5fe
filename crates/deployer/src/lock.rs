//! Exclusive deployment lock.
//!
//! Every mutating operation holds an advisory `flock` on
//! `<state-dir>/certshift.lock`. The holder writes its pid and start time into
//! the file so a waiting run can report who is in the way.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::LockError;

/// Lock file name inside the state directory
pub const LOCK_FILE: &str = "certshift.lock";

/// Delay between attempts while the lock is contended
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Factory for the deployment lock
#[derive(Debug, Clone)]
pub struct DeployLock {
    path: PathBuf,
    timeout: Duration,
}

/// Proof that the deployment lock is held. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    _flock: Flock<File>,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Released deployment lock");
    }
}

impl DeployLock {
    pub fn new(state_dir: &Path, timeout: Duration) -> Self {
        Self {
            path: state_dir.join(LOCK_FILE),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting. `Ok(None)` if another holder has it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                let mut handle: &File = &flock;
                handle.set_len(0)?;
                writeln!(
                    handle,
                    "pid={} since={}",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                )?;
                debug!(path = %self.path.display(), "Acquired deployment lock");
                Ok(Some(LockGuard {
                    _flock: flock,
                    path: self.path.clone(),
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(LockError::Io(std::io::Error::from(errno))),
        }
    }

    /// Take the lock, polling until the configured timeout.
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        let start = Instant::now();

        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                let holder = fs::read_to_string(&self.path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                let holder = if holder.is_empty() {
                    "unknown holder".to_string()
                } else {
                    holder
                };
                warn!(
                    path = %self.path.display(),
                    holder = %holder,
                    waited_ms = waited.as_millis() as u64,
                    "Deployment lock is held by another run"
                );
                return Err(LockError::Locked {
                    path: self.path.clone(),
                    holder,
                    waited,
                });
            }

            trace!(path = %self.path.display(), "Deployment lock contended, retrying");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
