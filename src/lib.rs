// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Switchyard is the client side of a Language Server Protocol integration.
//!
//! It routes documents to one or more configured language servers, supervises
//! each server session, keeps document state in sync with the servers and fans
//! feature requests out to every eligible server, merging what comes back.

/// Cooperative cancellation of in-flight requests.
pub mod cancellation;
/// Configuration loading and schema.
pub mod config;
/// Multi-server request fan-out and merging.
pub mod dispatch;
/// Editor-side documents, edits and URIs.
pub mod document;
/// Error types.
pub mod error;
/// Typed feature requests over the dispatcher.
pub mod features;
/// Lifecycle events for observers.
pub mod lifecycle;
/// LSP transport, sessions and synchronization.
pub mod lsp;
/// Server definitions and document matching.
pub mod registry;

pub use cancellation::{CancelChecker, CancellationSupport};
pub use config::Config;
pub use dispatch::{Dispatcher, MergedRequest, MergedResult};
pub use document::{DocumentEdit, DocumentRef, TextBuffer};
pub use error::{LspError, LspResult};
pub use lifecycle::{EventBroadcaster, EventKind, LifecycleEvent};
pub use lsp::{ServerSession, SessionManager, ServerState};
pub use registry::{DefinitionRegistry, Language, ServerDefinition};
