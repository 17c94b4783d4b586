//! Kernel message envelopes exchanged over the channel socket.
//!
//! Outbound requests are built as typed structs and serialized to JSON text.
//! Inbound frames are decoded in two steps: a loose outer envelope (only
//! `msg_type` is required) and then a strict per-type decode for the message
//! kinds the client acts on. Anything that fails the strict step is reported
//! as an [`EnvelopeError`] instead of degrading to empty strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PROTOCOL_VERSION: &str = "5.0";
pub const EXECUTE_REQUEST: &str = "execute_request";
pub const SHELL_CHANNEL: &str = "shell";

/// Error returned by [`decode_reply`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The frame is not JSON, or its shape does not match the message type.
    #[error("malformed kernel message: {0}")]
    Json(#[from] serde_json::Error),
    /// A field required for this message type was absent or empty.
    #[error("kernel message missing `{0}`")]
    MissingField(&'static str),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestHeader {
    pub username: String,
    pub version: String,
    pub msg_id: String,
    pub msg_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecuteContent {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Option<Value>,
    pub allow_stdin: bool,
}

/// An `execute_request` sent on the shell channel.
///
/// `parent_header`, `metadata` and `buffers` are always serialized as `null`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestEnvelope {
    pub header: RequestHeader,
    pub parent_header: Option<Value>,
    pub channel: String,
    pub content: ExecuteContent,
    pub metadata: Option<Value>,
    pub buffers: Option<Value>,
}

impl RequestEnvelope {
    /// Build an execute request for `code` with a freshly generated message id.
    #[must_use]
    pub fn execute(code: &str) -> Self {
        Self {
            header: RequestHeader {
                username: String::new(),
                version: PROTOCOL_VERSION.to_owned(),
                msg_id: Uuid::new_v4().to_string(),
                msg_type: EXECUTE_REQUEST.to_owned(),
            },
            parent_header: None,
            channel: SHELL_CHANNEL.to_owned(),
            content: ExecuteContent {
                code: code.to_owned(),
                silent: false,
                store_history: false,
                user_expressions: None,
                allow_stdin: false,
            },
            metadata: None,
            buffers: None,
        }
    }

    #[must_use]
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// Serialize to the JSON text sent over the socket.
    ///
    /// # Errors
    ///
    /// Returns a serialization error; not expected for well-formed envelopes.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
struct RawReply {
    msg_type: String,
    // Kept loose: only `stream` replies need a well-formed parent id.
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct StreamContent {
    text: String,
}

/// Decoded inbound message, reduced to what correlation needs.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Output text produced while executing the request `parent_msg_id`.
    Stream { parent_msg_id: String, text: String },
    /// Kernel-reported error. Its parent is kept when present for logging only.
    Error { parent_msg_id: Option<String>, content: Value },
    /// Any other message type; not acted on.
    Other { msg_type: String },
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`EnvelopeError::Json`] if the frame is not a JSON object with a
/// string `msg_type`, or a `stream` message whose `content.text` is not a
/// string. Returns [`EnvelopeError::MissingField`] for a `stream` message
/// without a non-empty string `parent_header.msg_id`. Other message types
/// are not checked beyond `msg_type`.
pub fn decode_reply(raw: &str) -> Result<Reply, EnvelopeError> {
    let reply: RawReply = serde_json::from_str(raw)?;
    let parent_msg_id = reply
        .parent_header
        .get("msg_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned);

    if reply.msg_type.eq_ignore_ascii_case("stream") {
        let parent_msg_id = parent_msg_id.ok_or(EnvelopeError::MissingField("parent_header.msg_id"))?;
        if reply.content.get("text").is_none() {
            return Err(EnvelopeError::MissingField("content.text"));
        }
        let content: StreamContent = serde_json::from_value(reply.content)?;
        return Ok(Reply::Stream { parent_msg_id, text: content.text });
    }

    if reply.msg_type.eq_ignore_ascii_case("error") {
        return Ok(Reply::Error { parent_msg_id, content: reply.content });
    }

    Ok(Reply::Other { msg_type: reply.msg_type })
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
