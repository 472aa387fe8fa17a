//! pipebus core - locks and channels shared by the broker and its clients.
//!
//! This crate holds the transport layer only:
//! - `lock` - cross-process advisory locks bound to `<pipe>.lock` files
//! - `fifo` - creation and reclamation of named pipes
//! - `channel` - locked line-oriented reader/writer over one named pipe
//! - `identity` - the client identity carried on the registration channel
//!
//! Library code does not panic: no `.unwrap()`, `.expect()`, `panic!()`.
//! All fallible operations return `Result`.

pub mod channel;
pub mod error;
pub mod fifo;
pub mod identity;
pub mod lock;

// Re-exports for convenience
pub use channel::{
    default_pipe_dir, split_messages, ChannelConfig, ChannelPaths, ChannelReader, ChannelWriter,
    ReadMode, DEFAULT_POLL_INTERVAL, DEFAULT_REGISTRATION_PIPE, MAX_MESSAGE_LEN,
};
pub use error::{ChannelError, ChannelResult, LockError};
pub use fifo::{ensure_pipe, is_pipe, lock_path_for, make_pipe, remove_pipe};
pub use identity::{ClientId, IdentityError};
pub use lock::{AdvisoryLock, LockConfig, LockGuard, LockMode};
