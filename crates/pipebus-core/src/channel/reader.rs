use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use tracing::trace;

use super::{split_messages, ChannelConfig, ReadMode};
use crate::error::{ChannelError, ChannelResult};
use crate::lock::AdvisoryLock;

const READ_CHUNK: usize = 4096;

/// Reading end of a channel.
///
/// Holds the pipe open in non-blocking mode for its whole lifetime, so a
/// read never parks the calling thread inside the kernel. The pipe file must
/// exist before the reader is opened.
#[derive(Debug)]
pub struct ChannelReader {
    path: PathBuf,
    file: File,
    lock: AdvisoryLock,
    config: ChannelConfig,
}

impl ChannelReader {
    /// Opens `path` for non-blocking reads.
    pub fn open(path: impl Into<PathBuf>, config: ChannelConfig) -> ChannelResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| ChannelError::Open {
                path: path.clone(),
                source,
            })?;
        let lock = AdvisoryLock::for_pipe(&path, config.lock);

        Ok(Self {
            path,
            file,
            lock,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Reads every message currently buffered in the pipe.
    ///
    /// Each attempt takes the read lock, drains the pipe and releases the
    /// lock before deciding whether to sleep and retry, so writers are never
    /// shut out for longer than one drain.
    pub fn read(&self, mode: ReadMode) -> ChannelResult<Vec<String>> {
        let started = Instant::now();
        loop {
            let messages = self.drain_locked()?;
            if !messages.is_empty() {
                trace!(path = %self.path.display(), count = messages.len(), "Drained messages");
                return Ok(messages);
            }

            match mode {
                ReadMode::NonBlocking => return Ok(messages),
                ReadMode::BusyWait => {}
                ReadMode::BusyWaitFor(limit) => {
                    let waited = started.elapsed();
                    if waited >= limit {
                        return Err(ChannelError::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                }
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn drain_locked(&self) -> ChannelResult<Vec<String>> {
        let guard = self.lock.acquire_read()?;
        let drained = self.drain();
        let released = guard.release();
        let bytes = drained?;
        released?;
        Ok(split_messages(&bytes))
    }

    fn drain(&self) -> ChannelResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match (&self.file).read(&mut chunk) {
                // No writer attached and nothing buffered.
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ChannelError::Read {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }
        Ok(out)
    }
}
