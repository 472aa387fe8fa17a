//! pipebus client library
//!
//! Registers with a running broker, exchanges one-line requests and
//! responses over a private pair of named pipes, and unregisters on close.
//!
//! ```no_run
//! use pipebus_client::{Client, ClientConfig};
//!
//! fn main() -> pipebus_client::Result<()> {
//!     let mut client = Client::connect(ClientConfig::default())?;
//!     assert_eq!(client.request_value(21)?, 42);
//!     client.close()
//! }
//! ```

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, Result};
