//! figc wire protocol definitions
//!
//! Clients talk to the agent over a Unix socket with newline-delimited JSON:
//! one request line per connection, then a stream of event lines until a
//! terminal event, after which the agent closes the connection.
//!
//! The CLI is a thin client that prints these event lines verbatim.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bump when the wire format changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown operation: {0}")]
    UnknownOp(String),

    #[error("malformed request: missing 'op' field")]
    MissingOp,

    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Request sent by a client. Exactly one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    /// Ensure an extracted, verified copy of `id@version` exists locally.
    Ensure { id: String, version: String },
}

impl Request {
    /// Parse one request line.
    ///
    /// An unrecognized `op` is reported by name so the agent can answer with
    /// the mandated `Unknown operation: <op>` error event instead of a
    /// generic parse failure.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let op = value
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or(ProtocolError::MissingOp)?;
        match op {
            "ensure" => Ok(serde_json::from_value(value)?),
            other => Err(ProtocolError::UnknownOp(other.to_string())),
        }
    }

    /// Serialize as a single request line (newline included).
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("request serialization is infallible");
        line.push('\n');
        line
    }
}

/// Event streamed from the agent to every subscriber of a job.
///
/// `completed` and `error` are terminal; `hit` always precedes a `completed`
/// carrying the same path, so subscribers that only care about the outcome
/// can wait for a terminal event alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Start {
        id: String,
        version: String,
    },
    Progress {
        id: String,
        version: String,
        message: String,
    },
    Hit {
        id: String,
        version: String,
        path: Utf8PathBuf,
    },
    Completed {
        id: String,
        version: String,
        path: Utf8PathBuf,
    },
    Error {
        id: String,
        version: String,
        message: String,
    },
}

impl Event {
    /// Whether this event ends the stream for its job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Completed { .. } | Event::Error { .. })
    }

    /// The published package path, for events that carry one.
    pub fn path(&self) -> Option<&Utf8PathBuf> {
        match self {
            Event::Hit { path, .. } | Event::Completed { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Serialize as a single event line (newline included).
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("event serialization is infallible");
        line.push('\n');
        line
    }
}
