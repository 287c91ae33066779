use fd_lock::RwLock;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{DuoError, Result};

/// Advisory, cross-process lock guarding one ledger directory.
///
/// Backed by `flock` through `fd-lock`, so it serializes separate processes as well as
/// separate open handles inside one process. Acquisition is a bounded retry loop:
/// contention is retried with jittered sleeps until `timeout`, then surfaces as
/// [`DuoError::LockTimeout`].
#[derive(Debug, Clone)]
pub struct LedgerLock {
    path: PathBuf,
    timeout: Duration,
    retry: Duration,
}

impl LedgerLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, retry: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            retry: retry.max(Duration::from_millis(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the exclusive lock.
    pub fn exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut lock = RwLock::new(self.open()?);
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match lock.try_write() {
                Ok(_guard) => {
                    if attempts > 1 {
                        debug!(
                            attempts,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Acquired contended ledger lock"
                        );
                    }
                    return f();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(DuoError::storage("acquiring ledger lock")(err)),
            }
            self.backoff(started)?;
        }
    }

    /// Run `f` while holding a shared lock; writers are excluded, other readers are not.
    pub fn shared<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = RwLock::new(self.open()?);
        let started = Instant::now();

        loop {
            match lock.try_read() {
                Ok(_guard) => return f(),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(DuoError::storage("acquiring shared ledger lock")(err)),
            }
            self.backoff(started)?;
        }
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(DuoError::storage("opening ledger lock file"))
    }

    fn backoff(&self, started: Instant) -> Result<()> {
        let waited = started.elapsed();
        if waited >= self.timeout {
            warn!(
                lock = %self.path.display(),
                waited_ms = waited.as_millis() as u64,
                "Gave up waiting for ledger lock"
            );
            return Err(DuoError::LockTimeout {
                path: self.path.clone(),
                waited_ms: waited.as_millis() as u64,
            });
        }

        let jitter_ms = rand::rng().random_range(0..=self.retry.as_millis() as u64);
        let delay = (self.retry + Duration::from_millis(jitter_ms)).min(self.timeout - waited);
        std::thread::sleep(delay);
        Ok(())
    }
}
