//! pipebus daemon - registration directory, client sessions and the broker
//!
//! This crate provides the broker side of pipebus:
//! - `registry` - registration pipe listener and the table of live sessions
//! - `session` - per-client worker answering requests on its own thread
//! - `broker` - composition root bound to the well-known registration pipe
//! - `config` - TOML + environment configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         pipebusd                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │     Broker      │────▶│   RegistrationDirectory     │    │
//! │  │ (register_pipe) │     │ (register / unregister loop)│    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │ one per client    │
//! │                                         ▼                   │
//! │                          ┌─────────────────────────────┐    │
//! │                          │       ClientSession         │    │
//! │                          │ <id>_to_server ▶ handler ▶  │    │
//! │                          │ server_to_<id>              │    │
//! │                          └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Worker threads log their failures instead of unwinding

pub mod broker;
pub mod config;
pub mod registry;
pub mod session;

pub use broker::{Broker, BrokerError};
pub use config::{BrokerConfig, ConfigError};
pub use registry::{RegistrationDirectory, RegistryError, Shutdown, MAX_SESSIONS};
pub use session::{ClientSession, ClientState, SessionSettings, SessionView};
