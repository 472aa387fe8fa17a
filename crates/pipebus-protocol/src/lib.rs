//! pipebus protocol - what travels over the pipes
//!
//! - `message` - registration channel grammar (`register <id>`, `unregister <id>`)
//! - `handler` - data channel contract: request handler and response encoding

pub mod handler;
pub mod message;

pub use handler::{Doubler, HandlerError, RequestHandler, Response, ERROR_PREFIX};
pub use message::{ProtocolError, RegistrationMessage, RegistrationOp};
