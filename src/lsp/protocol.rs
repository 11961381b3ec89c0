// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC message shapes and Content-Length framing.

use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use lsp_types::NumberOrString;
use serde::{Deserialize, Serialize};

/// JSON-RPC `MethodNotFound` error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

const fn default_null() -> serde_json::Value {
    serde_json::Value::Null
}

/// A request sent by either peer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RequestMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// LSP method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

/// A response to a [`RequestMessage`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: Option<RequestId>,
    /// Successful result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    /// Builds a successful response.
    #[must_use]
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message,
                data: None,
            }),
        }
    }
}

/// A notification (no response expected).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationMessage {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// LSP method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null")]
    pub params: serde_json::Value,
}

/// JSON-RPC request id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id (what this client generates).
    Number(i64),
    /// String id (some servers use these for their own requests).
    String(String),
}

/// Error object carried by a failed response.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional extra payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<RequestId> for NumberOrString {
    fn from(id: RequestId) -> Self {
        match id {
            // Client ids start at 1 and stay far below i32::MAX in practice.
            RequestId::Number(n) => i32::try_from(n)
                .map_or_else(|_| Self::String(n.to_string()), Self::Number),
            RequestId::String(s) => Self::String(s),
        }
    }
}

/// A decoded message from the server, classified by shape.
#[derive(Debug)]
pub enum IncomingMessage {
    /// The server asks the client something and expects an answer.
    Request(RequestMessage),
    /// The server informs the client.
    Notification(NotificationMessage),
    /// The server answers one of our requests.
    Response(ResponseMessage),
}

/// Classifies a decoded JSON value into request, notification or response.
///
/// Returns `None` when the value matches none of the three shapes.
#[must_use]
pub fn classify(value: serde_json::Value) -> Option<IncomingMessage> {
    let has_method = value.get("method").and_then(|m| m.as_str()).is_some();
    let has_id = value.get("id").is_some_and(|id| !id.is_null());

    match (has_method, has_id) {
        (true, true) => serde_json::from_value(value)
            .ok()
            .map(IncomingMessage::Request),
        (true, false) => serde_json::from_value(value)
            .ok()
            .map(IncomingMessage::Notification),
        (false, true) => serde_json::from_value(value)
            .ok()
            .map(IncomingMessage::Response),
        (false, false) => None,
    }
}

/// Serialises a message into a Content-Length framed byte buffer.
///
/// # Errors
///
/// Returns an error if the message cannot be serialised.
pub fn encode_message<T: Serialize>(message: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_string(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(body.as_bytes());
    Ok(framed)
}

/// Parses one Content-Length framed message from the front of `buffer`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete message.
///
/// # Errors
///
/// Returns an error if the header block is not UTF-8, the length is not a
/// number, or the body is not UTF-8.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    let Some(header_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };

    let headers =
        std::str::from_utf8(&buffer[..header_end]).context("Failed to parse headers as UTF-8")?;

    let mut content_length = None;
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
        {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .context("Invalid Content-Length value")?,
            );
        }
    }

    let Some(content_length) = content_length else {
        // A header block without a length can never be completed; drop it.
        buffer.advance(header_end + 4);
        return Ok(None);
    };

    let body_start = header_end + 4;
    if buffer.len() < body_start + content_length {
        return Ok(None);
    }

    buffer.advance(body_start);
    let body = buffer.split_to(content_length);
    let message = String::from_utf8(body.to_vec()).context("Message body is not UTF-8")?;
    Ok(Some(message))
}
