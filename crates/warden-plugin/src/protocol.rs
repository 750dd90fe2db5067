//! Wire protocol between the host and a plugin process
//!
//! Frames are single-line JSON documents, one per line:
//!
//! ```text
//! host   -> plugin   {"id":7,"call":{"method":"decide","params":{"connection":{..}}}}
//! plugin -> host     {"id":7,"outcome":{"ok":{"kind":"decision","verdict":5,"reason":".."}}}
//! plugin -> host     {"id":7,"outcome":{"error":{"code":"internal","message":".."}}}
//! ```
//!
//! `cancel` is a notification and never answered. Verdicts travel as their
//! stable wire numbers.

use crate::error::PluginError;
use serde::{Deserialize, Serialize};
use warden_common::{Capability, Connection, DnsQuestion, DnsResponse, Verdict};

/// Protocol schema version spoken by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID, unique per transport
    pub id: u64,
    /// Remote call
    pub call: Call,
}

/// Remote call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Call {
    /// Negotiate schema and capabilities
    Handshake {
        /// Host schema version
        schema_version: u32,
        /// Plugin settings from the host configuration
        #[serde(default)]
        config: serde_json::Value,
    },
    /// Decide on a connection
    Decide {
        /// Connection
        connection: Connection,
    },
    /// Report a connection
    Report {
        /// Connection
        connection: Connection,
    },
    /// Resolve a DNS question
    Resolve {
        /// Question
        question: DnsQuestion,
        /// Connection in progress
        connection: Connection,
    },
    /// Abort an in-flight request
    Cancel {
        /// ID of the request to abort
        request_id: u64,
    },
    /// Stop serving
    Shutdown,
}

impl Call {
    /// Method name for logs
    pub fn method(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Decide { .. } => "decide",
            Self::Report { .. } => "report",
            Self::Resolve { .. } => "resolve",
            Self::Cancel { .. } => "cancel",
            Self::Shutdown => "shutdown",
        }
    }

    /// Capability the call needs, if any
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Self::Decide { .. } => Some(Capability::Decider),
            Self::Report { .. } => Some(Capability::Reporter),
            Self::Resolve { .. } => Some(Capability::Resolver),
            _ => None,
        }
    }
}

/// Response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// ID of the request this answers
    pub id: u64,
    /// Result of the call
    pub outcome: Outcome,
}

impl Response {
    /// Successful response
    pub fn ok(id: u64, reply: Reply) -> Self {
        Self {
            id,
            outcome: Outcome::Ok(reply),
        }
    }

    /// Error response
    pub fn error(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            outcome: Outcome::Error(error),
        }
    }
}

/// Result of a call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Call succeeded
    Ok(Reply),
    /// Call failed inside the plugin
    Error(RemoteError),
}

/// Successful reply payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Handshake answer
    Handshake {
        /// Plugin's own name
        name: String,
        /// Plugin schema version
        schema_version: u32,
        /// Implemented capabilities
        capabilities: Vec<Capability>,
    },
    /// Decide answer
    Decision {
        /// Verdict
        verdict: Verdict,
        /// Reason
        #[serde(default)]
        reason: String,
    },
    /// Report or shutdown acknowledgement
    Ack,
    /// Resolve answer
    Resolution {
        /// Response, absent when the plugin has no opinion
        #[serde(default)]
        response: Option<DnsResponse>,
    },
}

/// Error codes carried in error responses
pub mod codes {
    /// The capability is not implemented by the plugin
    pub const UNIMPLEMENTED: &str = "unimplemented";
    /// The handler failed
    pub const INTERNAL: &str = "internal";
    /// The request could not be decoded
    pub const INVALID_REQUEST: &str = "invalid_request";
    /// The handshake schema version is not supported
    pub const SCHEMA_MISMATCH: &str = "schema_mismatch";
    /// The handler was aborted on request
    pub const CANCELLED: &str = "cancelled";
}

/// Error reported by the plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine readable code
    pub code: String,
    /// Human readable message
    pub message: String,
}

impl RemoteError {
    /// Create remote error
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Response frame decoded only as far as its ID
///
/// Lets the reader route a reply whose payload is malformed to the waiting
/// caller instead of leaving it hanging.
#[derive(Debug, Deserialize)]
pub(crate) struct RawResponse {
    pub id: u64,
    pub outcome: serde_json::Value,
}

/// Encode a frame as one line, without the trailing newline
pub fn encode<T: Serialize>(frame: &T) -> Result<String, PluginError> {
    serde_json::to_string(frame).map_err(|e| PluginError::Protocol(format!("encode: {}", e)))
}

/// Decode a request line
pub fn decode_request(line: &str) -> Result<Request, PluginError> {
    serde_json::from_str(line).map_err(|e| PluginError::Protocol(format!("bad request: {}", e)))
}

/// Decode the outcome part of a response
pub(crate) fn decode_outcome(value: serde_json::Value) -> Result<Outcome, PluginError> {
    serde_json::from_value(value).map_err(|e| PluginError::Protocol(format!("bad response: {}", e)))
}

/// Best-effort extraction of the request ID from an undecodable line
pub(crate) fn peek_id(line: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("id")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_reply_shape() {
        let resp = Response::ok(
            9,
            Reply::Decision {
                verdict: Verdict::Block,
                reason: "port 23".into(),
            },
        );
        let line = encode(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"id":9,"outcome":{"ok":{"kind":"decision","verdict":5,"reason":"port 23"}}}"#
        );

        let raw: RawResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(raw.id, 9);
        assert!(matches!(
            decode_outcome(raw.outcome).unwrap(),
            Outcome::Ok(Reply::Decision { verdict: Verdict::Block, .. })
        ));
    }

    #[test]
    fn test_unknown_verdict_is_malformed() {
        let raw: RawResponse =
            serde_json::from_str(r#"{"id":1,"outcome":{"ok":{"kind":"decision","verdict":99}}}"#)
                .unwrap();
        assert!(matches!(decode_outcome(raw.outcome), Err(PluginError::Protocol(_))));
    }

    #[test]
    fn test_request_shapes() {
        let req = Request {
            id: 3,
            call: Call::Cancel { request_id: 2 },
        };
        let line = encode(&req).unwrap();
        assert_eq!(line, r#"{"id":3,"call":{"method":"cancel","params":{"request_id":2}}}"#);

        let shutdown = decode_request(r#"{"id":4,"call":{"method":"shutdown"}}"#).unwrap();
        assert!(matches!(shutdown.call, Call::Shutdown));
        assert_eq!(peek_id(r#"{"id":12,"call":{"method":"nope"}}"#), Some(12));
        assert_eq!(peek_id("garbage"), None);
    }
}
