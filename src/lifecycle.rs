// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Lifecycle events for observers of language server sessions.
//!
//! Sessions report state transitions, start failures and per-request
//! failures through an [`EventBroadcaster`]. Observers either subscribe to the
//! in-process channel or tail the JSON-lines log the broadcaster can append to.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// An event that can be broadcast to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The specific event data.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Types of lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Session state changed.
    StateChanged {
        /// Definition id of the server.
        server: String,
        /// Scope key of the session.
        scope: String,
        /// The new state.
        state: String,
    },
    /// A session failed to start or lost its connection.
    ServerError {
        /// Definition id of the server.
        server: String,
        /// Error message.
        message: String,
    },
    /// One server's contribution to a fanned-out request failed.
    RequestFailed {
        /// Definition id of the server.
        server: String,
        /// LSP method name.
        method: String,
        /// Error message.
        message: String,
    },
    /// A document was opened on a session.
    DocumentOpened {
        /// Definition id of the server.
        server: String,
        /// Document URI.
        uri: String,
    },
    /// A document was closed on a session.
    DocumentClosed {
        /// Definition id of the server.
        server: String,
        /// Document URI.
        uri: String,
    },
}

/// Returns the default directory for event logs.
#[must_use]
pub fn events_dir() -> PathBuf {
    let state_dir = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir);
    state_dir.join("switchyard")
}

/// Cloneable broadcaster for sharing across sessions.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<LifecycleEvent>,
    events_file: Option<Arc<Mutex<File>>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::noop()
    }
}

impl EventBroadcaster {
    /// A broadcaster that only delivers to in-process subscribers.
    #[must_use]
    pub fn noop() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            events_file: None,
        }
    }

    /// A broadcaster that also appends every event to `path` as JSON lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or the file cannot be created.
    pub fn with_log_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create event dir: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            sender,
            events_file: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// [`EventBroadcaster::with_log_file`] on `events.jsonl` in [`events_dir`].
    ///
    /// # Errors
    ///
    /// Same as [`EventBroadcaster::with_log_file`].
    pub fn with_default_log() -> Result<Self> {
        Self::with_log_file(&events_dir().join("events.jsonl"))
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event.
    pub fn send(&self, kind: EventKind) {
        let event = LifecycleEvent {
            timestamp: Utc::now(),
            kind,
        };

        if let Some(file) = &self.events_file
            && let Ok(mut file) = file.lock()
            && let Ok(json) = serde_json::to_string(&event)
        {
            let _ = writeln!(file, "{json}");
            let _ = file.flush();
        }

        // Nobody listening is not an error.
        let _ = self.sender.send(event);
    }
}
