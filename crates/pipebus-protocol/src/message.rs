//! Registration channel messages.
//!
//! Grammar: `"<op> <id>\n"` with `op` one of `register` / `unregister` and
//! `id` a positive decimal integer.

use std::fmt;
use std::str::FromStr;

use pipebus_core::{ClientId, IdentityError};
use thiserror::Error;

/// Operation carried by a registration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationOp {
    Register,
    Unregister,
}

impl RegistrationOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
        }
    }
}

impl fmt::Display for RegistrationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line on the registration channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationMessage {
    pub op: RegistrationOp,
    pub id: ClientId,
}

impl RegistrationMessage {
    pub fn register(id: ClientId) -> Self {
        Self {
            op: RegistrationOp::Register,
            id,
        }
    }

    pub fn unregister(id: ClientId) -> Self {
        Self {
            op: RegistrationOp::Unregister,
            id,
        }
    }

    /// Encodes the message without its line terminator; the channel writer
    /// appends the newline.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parses one line. Surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.split_whitespace();
        let op = match parts.next() {
            Some("register") => RegistrationOp::Register,
            Some("unregister") => RegistrationOp::Unregister,
            Some(other) => return Err(ProtocolError::UnknownOp(other.to_string())),
            None => return Err(ProtocolError::Empty),
        };
        let id = parts
            .next()
            .ok_or_else(|| ProtocolError::MissingId(line.trim().to_string()))?
            .parse::<ClientId>()?;
        if let Some(extra) = parts.next() {
            return Err(ProtocolError::TrailingInput(extra.to_string()));
        }
        Ok(Self { op, id })
    }
}

impl fmt::Display for RegistrationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.id)
    }
}

impl FromStr for RegistrationMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Malformed registration line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty registration message")]
    Empty,

    #[error("unknown registration op: {0:?}")]
    UnknownOp(String),

    #[error("registration message without client id: {0:?}")]
    MissingId(String),

    #[error("invalid client id: {0}")]
    InvalidId(#[from] IdentityError),

    #[error("unexpected trailing input: {0:?}")]
    TrailingInput(String),
}
