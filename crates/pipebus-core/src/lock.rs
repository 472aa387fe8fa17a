//! Cross-process advisory locks bound to a lock file.
//!
//! Two disciplines are supported:
//!
//! - [`LockMode::Exclusive`]: the lock *is* the existence of the lock file.
//!   Acquiring creates it with `O_CREAT | O_EXCL`, releasing deletes it.
//! - [`LockMode::ReadWrite`]: `flock(2)` shared/exclusive locks on a lock file
//!   that persists between acquisitions. Many readers, one writer.
//!
//! Neither discipline is reentrant: acquiring twice from the same owner
//! without releasing in between never succeeds. Without a configured
//! timeout acquisition retries forever. In exclusive mode a holder that
//! crashes leaves the lock file behind and every later acquirer spins until
//! the file is removed by hand; `flock` locks are dropped by the kernel when
//! the holder dies.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::LockError;
use crate::fifo::{lock_path_for, remove_if_exists};

/// Default delay between two acquisition attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Locking discipline for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Exclusive-create lock file; reads and writes both take the one lock.
    Exclusive,
    /// `flock` shared lock for readers, exclusive lock for writers.
    #[default]
    ReadWrite,
}

/// Acquisition behaviour shared by every lock of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub mode: LockMode,
    pub retry_interval: Duration,
    /// `None` retries forever.
    pub timeout: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mode: LockMode::default(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            timeout: None,
        }
    }
}

/// Advisory lock bound to one lock-file path.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
    config: LockConfig,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Shared,
    Exclusive,
}

impl AdvisoryLock {
    /// Creates a lock on an explicit lock-file path.
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    /// Creates the lock guarding `pipe`, at `<pipe>.lock`.
    pub fn for_pipe(pipe: &Path, config: LockConfig) -> Self {
        Self::new(lock_path_for(pipe), config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> LockConfig {
        self.config
    }

    /// Takes the lock exclusively.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        self.acquire_write()
    }

    /// Takes the lock for reading. Exclusive mode has no shared state, so
    /// this is the same as [`acquire_write`](Self::acquire_write) there.
    pub fn acquire_read(&self) -> Result<LockGuard, LockError> {
        match self.config.mode {
            LockMode::Exclusive => self.acquire_exclusive_file(),
            LockMode::ReadWrite => self.acquire_flock(Access::Shared),
        }
    }

    /// Takes the lock for writing.
    pub fn acquire_write(&self) -> Result<LockGuard, LockError> {
        match self.config.mode {
            LockMode::Exclusive => self.acquire_exclusive_file(),
            LockMode::ReadWrite => self.acquire_flock(Access::Exclusive),
        }
    }

    /// Deletes the lock file. A missing file is not an error.
    pub fn remove(&self) -> io::Result<()> {
        remove_if_exists(&self.path)
    }

    fn acquire_exclusive_file(&self) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    // Owner pid, for whoever has to clean up after a crash.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        held: Some(Held::LockFile),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    self.wait_or_timeout(started)?;
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
    }

    fn acquire_flock(&self, access: Access) -> Result<LockGuard, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;

        let op = match access {
            Access::Shared => libc::LOCK_SH,
            Access::Exclusive => libc::LOCK_EX,
        };

        let started = Instant::now();
        loop {
            let res = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
            if res == 0 {
                return Ok(LockGuard {
                    path: self.path.clone(),
                    held: Some(Held::Flock(file)),
                });
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
                    self.wait_or_timeout(started)?;
                }
                _ => {
                    return Err(LockError::Io {
                        path: self.path.clone(),
                        source: err,
                    })
                }
            }
        }
    }

    fn wait_or_timeout(&self, started: Instant) -> Result<(), LockError> {
        if let Some(limit) = self.config.timeout {
            let waited = started.elapsed();
            if waited >= limit {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                });
            }
        }
        trace!(path = %self.path.display(), "lock busy, retrying");
        thread::sleep(self.config.retry_interval);
        Ok(())
    }
}

#[derive(Debug)]
enum Held {
    /// Exclusive mode: we created the lock file and must delete it.
    LockFile,
    /// ReadWrite mode: the open description carrying the `flock`.
    Flock(File),
}

/// A held advisory lock.
///
/// Call [`release`](Self::release) to observe release errors; dropping the
/// guard releases too and only logs them.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
    held: Option<Held>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        let result = match self.held.take() {
            None => Ok(()),
            Some(Held::LockFile) => remove_if_exists(&self.path),
            Some(Held::Flock(file)) => {
                let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
                if res == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            }
        };
        result.map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}
