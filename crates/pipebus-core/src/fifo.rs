//! Creation and reclamation of named pipes and their lock files.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ChannelError, ChannelResult};

/// Suffix appended to a pipe path to form its lock-file path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Returns `<pipe>.lock`.
pub fn lock_path_for(pipe: &Path) -> PathBuf {
    let mut name = pipe.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let res = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Creates a fresh pipe at `path`.
///
/// Whatever already sits at `path` and at its lock path is removed first, so
/// leftovers from a crashed run never leak into a new one.
pub fn make_pipe(path: &Path) -> ChannelResult<()> {
    let provision = |source: io::Error| ChannelError::Provision {
        path: path.to_path_buf(),
        source,
    };
    remove_if_exists(path).map_err(provision)?;
    remove_if_exists(&lock_path_for(path)).map_err(provision)?;
    mkfifo(path).map_err(provision)?;
    debug!(path = %path.display(), "Created pipe");
    Ok(())
}

/// Creates the pipe at `path` unless a pipe already exists there.
///
/// Used by the side that may start second: the peer could already have the
/// existing pipe open, so it must be kept.
pub fn ensure_pipe(path: &Path) -> ChannelResult<()> {
    match mkfifo(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Created pipe");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let meta = fs::metadata(path).map_err(|source| ChannelError::Provision {
                path: path.to_path_buf(),
                source,
            })?;
            if meta.file_type().is_fifo() {
                Ok(())
            } else {
                Err(ChannelError::Provision {
                    path: path.to_path_buf(),
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "path exists and is not a named pipe",
                    ),
                })
            }
        }
        Err(source) => Err(ChannelError::Provision {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes a pipe and its lock file. Missing files count as removed.
pub fn remove_pipe(path: &Path) -> ChannelResult<()> {
    let provision = |source: io::Error| ChannelError::Provision {
        path: path.to_path_buf(),
        source,
    };
    remove_if_exists(path).map_err(provision)?;
    remove_if_exists(&lock_path_for(path)).map_err(provision)?;
    Ok(())
}

/// Returns true if `path` is an existing named pipe.
pub fn is_pipe(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}
