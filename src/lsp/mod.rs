// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Client and server capability handling.
pub mod capabilities;
/// Low-level LSP client for communicating with a server.
pub mod client;
/// Connection providers (process, socket, in-memory).
pub mod connection;
/// Routing of documents to sessions.
pub mod manager;
/// LSP message protocol definitions.
pub mod protocol;
/// One supervised server session.
pub mod session;
/// Session states and status reporting.
pub mod state;
/// Per-document change synchronization.
pub mod sync;

pub use client::LspClient;
pub use connection::{ConnectionProvider, ConnectionSpec};
pub use manager::SessionManager;
pub use session::{ServerSession, SessionOptions};
pub use state::{ScopeKey, ServerState, ServerStatus};
pub use sync::DocumentSynchronizer;
