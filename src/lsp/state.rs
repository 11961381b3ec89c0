// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Session lifecycle states and status snapshots.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a language server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Session exists but nothing was launched yet.
    NotStarted,
    /// Connection is being established.
    Starting,
    /// `initialize` sent, waiting for the server's capabilities.
    Initializing,
    /// Handshake done; documents and requests are accepted.
    Started,
    /// `shutdown`/`exit` in progress.
    Stopping,
    /// Fully torn down.
    Stopped,
    /// Start, handshake or connection failed. Terminal until restarted.
    Failed,
}

impl ServerState {
    /// Create from atomic u8 value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Initializing,
            3 => Self::Started,
            4 => Self::Stopping,
            5 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    /// Convert to atomic u8 value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Initializing => 2,
            Self::Started => 3,
            Self::Stopping => 4,
            Self::Stopped => 5,
            Self::Failed => 6,
        }
    }

    /// True while the session holds (or is acquiring) a live server.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Initializing | Self::Started)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Identifies the scope a session is shared within.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKey {
    /// Shared by every workspace root of the manager.
    Application,
    /// Bound to one workspace root.
    Project(PathBuf),
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("application"),
            Self::Project(root) => write!(f, "project:{}", root.display()),
        }
    }
}

/// Detailed status for a single session.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Definition id of the server.
    pub server_id: String,
    /// Display label of the server.
    pub label: String,
    /// Scope the session lives in.
    pub scope: ScopeKey,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Message of the error that caused `Failed`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Number of documents currently connected.
    pub open_documents: usize,
    /// Process id when backed by a local process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Seconds since the session last reached `Starting`.
    pub uptime_secs: u64,
}
