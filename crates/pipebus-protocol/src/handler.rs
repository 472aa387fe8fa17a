//! Request handler contract for the data channel.
//!
//! The broker does not know what a request means. Each session is given a
//! [`RequestHandler`] that maps one request line to one response line. A
//! handler failure is answered with an error response on the same channel;
//! it never ends the session.

use thiserror::Error;

use pipebus_core::MAX_MESSAGE_LEN;

/// Prefix marking an error response on the data channel.
pub const ERROR_PREFIX: &str = "error:";

/// Maps one request to one response.
pub trait RequestHandler: Send + Sync {
    fn process(&self, request: &str) -> Result<String, HandlerError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&str) -> Result<String, HandlerError> + Send + Sync,
{
    fn process(&self, request: &str) -> Result<String, HandlerError> {
        self(request)
    }
}

/// Failure to process one request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The request does not follow the handler's format.
    #[error("malformed request {input:?}: {reason}")]
    Malformed { input: String, reason: String },

    /// The request was understood but could not be served.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn malformed(input: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Reference handler: parses a decimal integer and answers its double.
#[derive(Debug, Clone, Copy, Default)]
pub struct Doubler;

impl RequestHandler for Doubler {
    fn process(&self, request: &str) -> Result<String, HandlerError> {
        let value: i64 = request
            .trim()
            .parse()
            .map_err(|e| HandlerError::malformed(request, e))?;
        value
            .checked_mul(2)
            .map(|doubled| doubled.to_string())
            .ok_or_else(|| HandlerError::Failed(format!("{value} doubled overflows")))
    }
}

/// A response line as seen by the client.
///
/// Success payloads travel as-is, so the reference handler's answer to
/// `21` is the line `42`. That leaves three payloads a client could not
/// tell apart from something else, and [`from_result`](Self::from_result)
/// turns each of them into an error response:
///
/// - empty or whitespace-only: the reader drops blank lines
/// - starting with `error:`: it would decode as an error
/// - longer than [`MAX_MESSAGE_LEN`]: no channel carries it
///
/// Trailing whitespace is not part of a payload; it is trimmed on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Error(String),
}

impl Response {
    pub fn from_result(result: Result<String, HandlerError>) -> Self {
        match result {
            Ok(payload) => Self::checked(payload),
            Err(e) => Self::Error(e.to_string()),
        }
    }

    fn checked(payload: String) -> Self {
        let line = flatten(&payload);
        if line.trim().is_empty() {
            Self::Error("handler returned an empty response".to_string())
        } else if line.starts_with(ERROR_PREFIX) {
            Self::Error(format!(
                "handler response starts with the reserved prefix {ERROR_PREFIX:?}"
            ))
        } else if line.len() > MAX_MESSAGE_LEN {
            Self::Error(format!(
                "handler response of {} bytes exceeds the {MAX_MESSAGE_LEN} byte limit",
                line.len()
            ))
        } else {
            Self::Ok(line)
        }
    }

    /// Encodes the response as a single line.
    ///
    /// Line breaks inside the payload are replaced by spaces: one request
    /// must produce exactly one message. An error reason too long for one
    /// message is cut short.
    pub fn encode(&self) -> String {
        match self {
            Self::Ok(payload) => flatten(payload),
            Self::Error(reason) => {
                let mut line = format!("{ERROR_PREFIX} {}", flatten(reason));
                if line.len() > MAX_MESSAGE_LEN {
                    let mut end = MAX_MESSAGE_LEN;
                    while !line.is_char_boundary(end) {
                        end -= 1;
                    }
                    line.truncate(end);
                }
                line
            }
        }
    }

    pub fn decode(line: &str) -> Self {
        match line.strip_prefix(ERROR_PREFIX) {
            Some(reason) => Self::Error(reason.trim().to_string()),
            None => Self::Ok(line.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

fn flatten(text: &str) -> String {
    text.replace(['\r', '\n'], " ").trim_end().to_string()
}
