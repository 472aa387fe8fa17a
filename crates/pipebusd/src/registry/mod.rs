//! Registration directory: the broker's table of live client sessions.
//!
//! One thread owns the registration pipe. It drains `register <id>` and
//! `unregister <id>` lines and turns them into session starts and stops.
//! Each session then runs on its own thread (see [`crate::session`]).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  register 7   ┌───────────────────────┐  start   ┌──────────────┐
//! │   clients    │──────────────▶│ RegistrationDirectory │─────────▶│ ClientSession│
//! │ (any number) │ register_pipe │  HashMap<ClientId, _> │          │  (per id)    │
//! └──────────────┘               └───────────────────────┘          └──────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Mutex poisoning is recovered, never propagated as a panic
//! - Malformed registration lines are logged and skipped

use serde::{Deserialize, Serialize};

mod directory;
mod errors;

pub use directory::RegistrationDirectory;
pub use errors::RegistryError;

/// Maximum number of concurrent sessions held by one directory.
pub const MAX_SESSIONS: usize = 100;

/// What happens to live sessions when the directory stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shutdown {
    /// Stop every session and remove its pipes.
    #[default]
    StopSessions,
    /// Stop only the registration loop; sessions keep serving.
    LeaveSessions,
}
