// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Error taxonomy shared by sessions, the dispatcher and the registry.
//!
//! Failures are contained at the session boundary: a [`LspError`] coming out
//! of one server never fails a merge that includes other healthy servers.

use std::time::Duration;

use thiserror::Error;

/// JSON-RPC error code a server uses to acknowledge `$/cancelRequest`.
pub const REQUEST_CANCELLED_CODE: i64 = -32800;

/// Errors raised while talking to language servers.
#[derive(Debug, Error)]
pub enum LspError {
    /// The connection could not be created, or the process died right after spawn.
    #[error("unable to start language server '{server}': {reason}")]
    ProcessStart {
        /// Definition id of the server.
        server: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The server did not answer `initialize` in time.
    #[error("language server '{server}' did not answer initialize within {timeout:?}")]
    HandshakeTimeout {
        /// Definition id of the server.
        server: String,
        /// Configured handshake timeout.
        timeout: Duration,
    },

    /// The server answered `initialize` with an error or an unreadable result.
    #[error("language server '{server}' rejected initialize: {reason}")]
    HandshakeProtocol {
        /// Definition id of the server.
        server: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A single request exceeded its deadline.
    #[error("request '{method}' timed out after {timeout:?}")]
    RequestTimeout {
        /// LSP method name.
        method: String,
        /// Configured request timeout.
        timeout: Duration,
    },

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// The server answered with a JSON-RPC error.
    #[error("LSP error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the server.
        message: String,
    },

    /// The server closed its output stream.
    #[error("language server connection closed")]
    ConnectionClosed,

    /// The session is not in the `Started` state.
    #[error("language server '{server}' is not started")]
    NotStarted {
        /// Definition id of the server.
        server: String,
    },

    /// No server definition is registered under the given id.
    #[error("no language server definition with id '{0}'")]
    DefinitionNotFound(String),

    /// A glob pattern in an association could not be compiled.
    #[error("invalid file pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser message.
        reason: String,
    },

    /// A path could not be expressed as a `file://` URI.
    #[error("invalid document path: {0}")]
    InvalidPath(String),

    /// A text edit does not fit the document it targets.
    #[error("invalid edit: {0}")]
    InvalidEdit(String),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be (de)serialised.
    #[error("malformed LSP payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl LspError {
    /// Returns true for errors that represent caller-initiated cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Server { code, .. } => *code == REQUEST_CANCELLED_CODE,
            _ => false,
        }
    }
}

/// Result alias for session and dispatcher operations.
pub type LspResult<T> = Result<T, LspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_classification() {
        assert!(LspError::Cancelled.is_cancelled());
        assert!(
            LspError::Server {
                code: REQUEST_CANCELLED_CODE,
                message: "cancelled".to_string(),
            }
            .is_cancelled()
        );
        assert!(
            !LspError::Server {
                code: -32603,
                message: "boom".to_string(),
            }
            .is_cancelled()
        );
    }
}
