use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use tracing::trace;

use super::{ChannelConfig, MAX_MESSAGE_LEN};
use crate::error::{ChannelError, ChannelResult};
use crate::lock::AdvisoryLock;

/// Writing end of a channel.
///
/// The pipe is opened, written once and closed again on every
/// [`write`](Self::write); nothing is held open between messages.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    path: PathBuf,
    lock: AdvisoryLock,
    config: ChannelConfig,
}

/// Outcome of one locked write attempt.
enum Attempt {
    Written,
    /// No reader yet, or no room for the whole line.
    Retry,
}

impl ChannelWriter {
    pub fn new(path: impl Into<PathBuf>, config: ChannelConfig) -> Self {
        let path = path.into();
        let lock = AdvisoryLock::for_pipe(&path, config.lock);
        Self { path, lock, config }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Writes `message` plus a trailing newline as one message.
    ///
    /// Waits for a reader to attach if there is none yet, and for room if
    /// the pipe is full. The lock is released between attempts so readers
    /// can drain. Messages over [`MAX_MESSAGE_LEN`] bytes are refused
    /// before anything is written. An embedded newline splits the message
    /// in two on the reading side.
    pub fn write(&self, message: &str) -> ChannelResult<()> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(ChannelError::MessageTooLong {
                path: self.path.clone(),
                len: message.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');

        let started = Instant::now();
        loop {
            let guard = self.lock.acquire_write()?;
            let attempt = self.try_write(line.as_bytes());
            let released = guard.release();
            let attempt = attempt?;
            released?;

            if let Attempt::Written = attempt {
                trace!(path = %self.path.display(), message, "Wrote message");
                return Ok(());
            }
            if let Some(limit) = self.config.write_timeout {
                let waited = started.elapsed();
                if waited >= limit {
                    return Err(ChannelError::Timeout {
                        path: self.path.clone(),
                        waited,
                    });
                }
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// One non-blocking open and write under the lock.
    ///
    /// The open fails with `ENXIO` while no reader has the pipe open. The
    /// write fails with `EAGAIN` when the line does not fit; a line within
    /// `PIPE_BUF` is never written partially.
    fn try_write(&self, line: &[u8]) -> ChannelResult<Attempt> {
        let mut file = match self.open() {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(Attempt::Retry),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Attempt::Retry),
            Err(source) => {
                return Err(ChannelError::Open {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match file.write(line) {
            Ok(n) if n == line.len() => Ok(Attempt::Written),
            Ok(n) => Err(ChannelError::Write {
                path: self.path.clone(),
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write of {n} of {} bytes", line.len()),
                ),
            }),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Attempt::Retry)
            }
            Err(source) => Err(ChannelError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelReader, ReadMode, MAX_MESSAGE_LEN};
    use crate::fifo::{lock_path_for, make_pipe};
    use crate::lock::{LockConfig, LockMode};
    use std::time::Duration;

    #[test]
    fn test_write_without_reader_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("orphan");
        make_pipe(&pipe).unwrap();

        let writer = ChannelWriter::new(
            &pipe,
            ChannelConfig {
                write_timeout: Some(Duration::from_millis(20)),
                ..ChannelConfig::default()
            },
        );
        let err = writer.write("hello").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_write_to_missing_pipe_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChannelWriter::new(dir.path().join("missing"), ChannelConfig::default());
        assert!(matches!(
            writer.write("x"),
            Err(ChannelError::Open { .. })
        ));
    }

    #[test]
    fn test_writer_waits_for_late_reader() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("late");
        make_pipe(&pipe).unwrap();
        let config = ChannelConfig::default();

        let writer = ChannelWriter::new(&pipe, config);
        let handle = thread::spawn(move || writer.write("42"));

        thread::sleep(Duration::from_millis(30));
        let reader = ChannelReader::open(&pipe, config).unwrap();
        let msgs = reader
            .read(ReadMode::BusyWaitFor(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(msgs, vec!["42"]);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_exclusive_lock_released_after_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig {
            lock: LockConfig {
                mode: LockMode::Exclusive,
                ..LockConfig::default()
            },
            ..ChannelConfig::default()
        };
        let pipe = dir.path().join("missing");
        let writer = ChannelWriter::new(&pipe, config);

        assert!(writer.write("x").is_err());
        assert!(!lock_path_for(&pipe).exists());
    }

    #[test]
    fn test_concurrent_writers_do_not_tear_messages() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("shared");
        make_pipe(&pipe).unwrap();
        let config = ChannelConfig::default();
        let reader = ChannelReader::open(&pipe, config).unwrap();

        let handles: Vec<_> = (1..=4)
            .map(|w| {
                let writer = ChannelWriter::new(&pipe, config);
                thread::spawn(move || {
                    for i in 0..25 {
                        writer.write(&format!("writer-{w}-message-{i}")).unwrap();
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 100 {
            received.extend(
                reader
                    .read(ReadMode::BusyWaitFor(Duration::from_secs(10)))
                    .unwrap(),
            );
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(received.len(), 100);
        for msg in &received {
            assert!(msg.starts_with("writer-"), "torn message: {msg:?}");
            assert_eq!(msg.split('-').count(), 4, "torn message: {msg:?}");
        }
    }

    #[test]
    fn test_oversized_message_rejected_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("chan");
        make_pipe(&pipe).unwrap();
        let config = ChannelConfig::default();
        let reader = ChannelReader::open(&pipe, config).unwrap();
        let writer = ChannelWriter::new(&pipe, config);

        let err = writer.write(&"7".repeat(128 * 1024)).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::MessageTooLong { len, max, .. } if len == 128 * 1024 && max == MAX_MESSAGE_LEN
        ));
        assert!(reader.read(ReadMode::NonBlocking).unwrap().is_empty());

        // The channel is still usable, right up to the limit.
        let largest = "7".repeat(MAX_MESSAGE_LEN);
        writer.write(&largest).unwrap();
        let msgs = reader
            .read(ReadMode::BusyWaitFor(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(msgs, vec![largest]);
    }

    #[test]
    fn test_full_pipe_does_not_lock_out_reader() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("chan");
        make_pipe(&pipe).unwrap();
        let config = ChannelConfig {
            lock: LockConfig {
                timeout: Some(Duration::from_secs(2)),
                ..LockConfig::default()
            },
            ..ChannelConfig::default()
        };
        let reader = ChannelReader::open(&pipe, config).unwrap();

        // Far more than the pipe can buffer at once.
        let writer = ChannelWriter::new(&pipe, config);
        let handle = thread::spawn(move || {
            for i in 0..64 {
                let mut msg = format!("{i:02}-");
                msg.push_str(&"x".repeat(MAX_MESSAGE_LEN - msg.len()));
                writer.write(&msg).unwrap();
            }
        });

        let mut received = Vec::new();
        while received.len() < 64 {
            received.extend(
                reader
                    .read(ReadMode::BusyWaitFor(Duration::from_secs(5)))
                    .unwrap(),
            );
        }
        handle.join().unwrap();

        for (i, msg) in received.iter().enumerate() {
            assert_eq!(msg.len(), MAX_MESSAGE_LEN);
            assert!(msg.starts_with(&format!("{i:02}-")), "out of order: {}", &msg[..3]);
        }
    }

    #[test]
    fn test_write_to_full_pipe_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("chan");
        make_pipe(&pipe).unwrap();
        let config = ChannelConfig {
            write_timeout: Some(Duration::from_millis(50)),
            ..ChannelConfig::default()
        };
        // Attached but never drained.
        let _reader = ChannelReader::open(&pipe, config).unwrap();
        let writer = ChannelWriter::new(&pipe, config);
        let block = "x".repeat(MAX_MESSAGE_LEN);

        let err = (0..1024)
            .find_map(|_| writer.write(&block).err())
            .expect("pipe never filled up");
        assert!(err.is_timeout(), "got {err:?}");
    }
}
