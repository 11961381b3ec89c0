// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! One supervised language server session.
//!
//! A [`ServerSession`] exists per (definition, scope key). It drives the
//! start/handshake/stop state machine, owns the connected documents and their
//! synchronizers, and is the only path by which notifications and requests
//! reach the server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use lsp_types::notification::{
    DidChangeConfiguration, DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument,
    DidSaveTextDocument, Initialized,
};
use lsp_types::request::{Initialize, Request};
use lsp_types::{
    ClientInfo, Diagnostic, DidChangeConfigurationParams, InitializeParams, InitializedParams,
    ServerCapabilities, Uri, WorkspaceFolder,
};
use tracing::{debug, error, info, warn};

use super::capabilities::{client_capabilities, sync_settings};
use super::client::LspClient;
use super::connection::{ConnectionProvider, ConnectionSpec};
use super::state::{ScopeKey, ServerState, ServerStatus};
use super::sync::DocumentSynchronizer;
use crate::cancellation::CancellationSupport;
use crate::config::{Config, ErrorReporting};
use crate::document::{DocumentEdit, DocumentRef, TextBuffer, path_to_uri};
use crate::error::{LspError, LspResult};
use crate::lifecycle::{EventBroadcaster, EventKind};
use crate::registry::ServerDefinition;

/// Upper bound for the `shutdown` request during a stop.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts and policies shared by every session of a manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Timeout for the `initialize` exchange.
    pub handshake_timeout: Duration,
    /// Wait for a voluntary process exit before killing it.
    pub shutdown_grace: Duration,
    /// How start failures are surfaced.
    pub error_reporting: ErrorReporting,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            handshake_timeout: config.handshake_timeout(),
            shutdown_grace: config.shutdown_grace(),
            error_reporting: config.error_reporting,
        }
    }
}

/// Live connection pieces; present only between a successful start and stop.
struct Running {
    client: Arc<LspClient>,
    capabilities: Arc<ServerCapabilities>,
}

/// A supervised session with one language server.
pub struct ServerSession {
    definition: Arc<ServerDefinition>,
    scope: ScopeKey,
    roots: Vec<PathBuf>,
    connection: ConnectionSpec,
    options: SessionOptions,
    events: EventBroadcaster,

    state: AtomicU8,
    /// Serializes start, stop and restart.
    lifecycle_lock: tokio::sync::Mutex<()>,
    provider: tokio::sync::Mutex<Option<Box<dyn ConnectionProvider>>>,
    running: Mutex<Option<Running>>,
    documents: Mutex<HashMap<Uri, Arc<DocumentSynchronizer>>>,
    last_error: Mutex<Option<String>>,
    started_at: Mutex<Option<Instant>>,
    pid: Mutex<Option<u32>>,

    /// Bumped on every attach and detach; a pending disconnect timer only
    /// fires if it still sees the value it was armed with.
    attach_generation: AtomicU64,
    /// Bumped on every start and stop; stale connection monitors bail out.
    epoch: AtomicU64,
}

impl ServerSession {
    /// Creates a session in `NotStarted`; nothing is launched yet.
    ///
    /// `roots` become the workspace folders; the first one is the working
    /// directory of process connections.
    #[must_use]
    pub fn new(
        definition: Arc<ServerDefinition>,
        scope: ScopeKey,
        roots: Vec<PathBuf>,
        connection: ConnectionSpec,
        options: SessionOptions,
        events: EventBroadcaster,
    ) -> Arc<Self> {
        Arc::new(Self {
            definition,
            scope,
            roots,
            connection,
            options,
            events,
            state: AtomicU8::new(ServerState::NotStarted.as_u8()),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            provider: tokio::sync::Mutex::new(None),
            running: Mutex::new(None),
            documents: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            started_at: Mutex::new(None),
            pid: Mutex::new(None),
            attach_generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        })
    }

    /// Definition id.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.definition.id
    }

    /// The definition this session runs.
    #[must_use]
    pub const fn definition(&self) -> &Arc<ServerDefinition> {
        &self.definition
    }

    /// Scope key of the session.
    #[must_use]
    pub const fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Message of the error that last failed the session.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Capabilities negotiated in the handshake, while started.
    #[must_use]
    pub fn capabilities(&self) -> Option<Arc<ServerCapabilities>> {
        lock(&self.running)
            .as_ref()
            .map(|running| Arc::clone(&running.capabilities))
    }

    /// Number of connected documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        lock(&self.documents).len()
    }

    /// True when `uri` is connected to this session.
    #[must_use]
    pub fn is_connected(&self, uri: &Uri) -> bool {
        lock(&self.documents).contains_key(uri)
    }

    /// Snapshot of the connected documents' synchronizers.
    #[must_use]
    pub fn documents(&self) -> Vec<Arc<DocumentSynchronizer>> {
        lock(&self.documents).values().cloned().collect()
    }

    /// Synchronizer of a connected document.
    #[must_use]
    pub fn synchronizer(&self, uri: &Uri) -> Option<Arc<DocumentSynchronizer>> {
        lock(&self.documents).get(uri).cloned()
    }

    /// Detailed status for reporting.
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.definition.id.clone(),
            label: self.definition.label.clone(),
            scope: self.scope.clone(),
            state: self.state(),
            last_error: self.last_error(),
            open_documents: self.document_count(),
            pid: *lock(&self.pid),
            uptime_secs: lock(&self.started_at).map_or(0, |t| t.elapsed().as_secs()),
        }
    }

    fn client(&self) -> LspResult<Arc<LspClient>> {
        if self.state() != ServerState::Started {
            return Err(self.not_started());
        }
        lock(&self.running)
            .as_ref()
            .map(|running| Arc::clone(&running.client))
            .ok_or_else(|| self.not_started())
    }

    fn not_started(&self) -> LspError {
        LspError::NotStarted {
            server: self.definition.id.clone(),
        }
    }

    fn set_state(&self, state: ServerState) {
        let previous = ServerState::from_u8(self.state.swap(state.as_u8(), Ordering::SeqCst));
        if previous == state {
            return;
        }
        debug!(
            "Session '{}' ({}): {} -> {}",
            self.definition.id, self.scope, previous, state
        );
        self.events.send(EventKind::StateChanged {
            server: self.definition.id.clone(),
            scope: self.scope.to_string(),
            state: state.to_string(),
        });
    }

    /// Moves to `Failed`, records and reports `err`, and hands it back.
    fn fail(&self, err: LspError) -> LspError {
        let message = err.to_string();
        *lock(&self.last_error) = Some(message.clone());
        self.set_state(ServerState::Failed);

        match self.options.error_reporting {
            ErrorReporting::None => debug!("Session '{}' failed: {}", self.definition.id, message),
            ErrorReporting::Notification => {
                warn!("Session '{}' failed: {}", self.definition.id, message);
                self.events.send(EventKind::ServerError {
                    server: self.definition.id.clone(),
                    message,
                });
            }
            ErrorReporting::InLog => {
                error!("Session '{}' failed: {}", self.definition.id, message);
            }
        }
        err
    }

    fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.roots
            .iter()
            .filter_map(|root| match path_to_uri(root) {
                Ok(uri) => Some(WorkspaceFolder {
                    uri,
                    name: root
                        .file_name()
                        .map_or_else(|| "workspace".to_string(), |n| n.to_string_lossy().to_string()),
                }),
                Err(e) => {
                    warn!("Skipping workspace folder {}: {}", root.display(), e);
                    None
                }
            })
            .collect()
    }

    fn initialize_params(&self, workspace_folders: Vec<WorkspaceFolder>) -> InitializeParams {
        InitializeParams {
            process_id: Some(std::process::id()),
            client_info: Some(ClientInfo {
                name: "switchyard".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: client_capabilities(),
            initialization_options: self.definition.initialization_options(),
            workspace_folders: Some(workspace_folders),
            ..Default::default()
        }
    }

    /// Starts the session if it is `NotStarted` or `Stopped`.
    ///
    /// Returns immediately when already started.
    ///
    /// # Errors
    ///
    /// Returns the start or handshake failure, or [`LspError::NotStarted`]
    /// for a `Failed` session (which only [`ServerSession::restart`] revives).
    pub async fn start(self: &Arc<Self>) -> LspResult<()> {
        let _guard = self.lifecycle_lock.lock().await;
        match self.state() {
            ServerState::Started => Ok(()),
            ServerState::Failed => Err(self.not_started()),
            _ => self.start_locked().await,
        }
    }

    async fn start_locked(self: &Arc<Self>) -> LspResult<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.last_error) = None;
        *lock(&self.started_at) = Some(Instant::now());
        self.set_state(ServerState::Starting);

        let root = self
            .roots
            .first()
            .cloned()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        let mut provider = self.connection.create_provider(&self.definition.id, &root);

        let started = async {
            provider.start().await?;
            provider.ensure_is_alive().await?;
            provider.take_streams().ok_or_else(|| LspError::ProcessStart {
                server: self.definition.id.clone(),
                reason: "connection produced no streams".to_string(),
            })
        }
        .await;
        let streams = match started {
            Ok(streams) => streams,
            Err(e) => {
                provider.stop(self.options.shutdown_grace).await;
                return Err(self.fail(e));
            }
        };
        *lock(&self.pid) = provider.pid();
        *self.provider.lock().await = Some(provider);

        let folders = self.workspace_folders();
        let client = Arc::new(LspClient::new(
            streams,
            Arc::clone(&self.definition),
            folders.clone(),
            self.options.request_timeout,
        ));

        self.set_state(ServerState::Initializing);
        let params = self.initialize_params(folders);
        let timeout = self.options.handshake_timeout;
        let result = match client.request_with_timeout::<Initialize>(params, timeout).await {
            Ok(result) => result,
            Err(e) => {
                let err = match e {
                    LspError::RequestTimeout { .. } => LspError::HandshakeTimeout {
                        server: self.definition.id.clone(),
                        timeout,
                    },
                    other => LspError::HandshakeProtocol {
                        server: self.definition.id.clone(),
                        reason: other.to_string(),
                    },
                };
                self.teardown().await;
                return Err(self.fail(err));
            }
        };

        if let Some(info) = &result.server_info {
            info!(
                "Language server '{}' is {} {}",
                self.definition.id,
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }

        if let Err(e) = client.notify::<Initialized>(InitializedParams {}).await {
            self.teardown().await;
            return Err(self.fail(e));
        }

        *lock(&self.running) = Some(Running {
            client: Arc::clone(&client),
            capabilities: Arc::new(result.capabilities),
        });
        self.set_state(ServerState::Started);

        if let Err(e) = self.push_settings().await {
            warn!("Failed to push settings to '{}': {}", self.definition.id, e);
        }

        self.monitor_connection(&client, epoch);
        Ok(())
    }

    /// Watches the reader side; a close while `Started` fails the session.
    fn monitor_connection(self: &Arc<Self>, client: &Arc<LspClient>, epoch: u64) {
        let session = Arc::downgrade(self);
        let mut closed = client.closed_receiver();
        tokio::spawn(async move {
            // A dropped client ends the wait as well; the epoch check sorts it out.
            let _ = closed.wait_for(|closed| *closed).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.epoch.load(Ordering::SeqCst) == epoch
                && session.state() == ServerState::Started
            {
                session.fail(LspError::ConnectionClosed);
                session.teardown().await;
            }
        });
    }

    /// Pushes the definition's settings with `workspace/didChangeConfiguration`.
    ///
    /// Does nothing when the definition has no settings.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::NotStarted`] or a transport error.
    pub async fn push_settings(&self) -> LspResult<()> {
        let Some(settings) = self.definition.settings() else {
            return Ok(());
        };
        self.client()?
            .notify::<DidChangeConfiguration>(DidChangeConfigurationParams { settings })
            .await
    }

    /// Drops the client and the connection without protocol niceties.
    async fn teardown(&self) {
        let running = lock(&self.running).take();
        drop(running);
        if let Some(mut provider) = self.provider.lock().await.take() {
            provider.stop(self.options.shutdown_grace).await;
        }
        *lock(&self.pid) = None;
    }

    /// Stops the session: `shutdown`/`exit`, connection teardown, documents
    /// cleared. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.lifecycle_lock.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let state = self.state();
        if matches!(state, ServerState::NotStarted | ServerState::Stopped) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set_state(ServerState::Stopping);

        let client = lock(&self.running)
            .as_ref()
            .map(|running| Arc::clone(&running.client));
        if let Some(client) = client
            && client.is_alive()
            && let Err(e) = client
                .shutdown(SHUTDOWN_REQUEST_TIMEOUT.min(self.options.request_timeout))
                .await
        {
            debug!("Shutdown of '{}' was not clean: {}", self.definition.id, e);
        }

        self.teardown().await;
        lock(&self.documents).clear();
        *lock(&self.started_at) = None;
        self.set_state(ServerState::Stopped);
        info!("Stopped language server '{}' ({})", self.definition.id, self.scope);
    }

    /// Stops and starts again, silently reopening every connected document
    /// at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::NotStarted`] for a session that never started, or
    /// the failure of the new start.
    pub async fn restart(self: &Arc<Self>) -> LspResult<()> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.state() == ServerState::NotStarted {
            return Err(self.not_started());
        }

        let reopen: Vec<(Uri, String, String)> = self
            .documents()
            .iter()
            .map(|sync| (sync.uri().clone(), sync.language_id().to_string(), sync.last_text()))
            .collect();

        self.stop_locked().await;
        self.start_locked().await?;

        let capabilities = self.capabilities().unwrap_or_default();
        let settings = sync_settings(&capabilities);
        for (uri, language_id, text) in reopen {
            let sync = Arc::new(DocumentSynchronizer::new(
                uri.clone(),
                language_id,
                settings,
                &TextBuffer::new(text),
            ));
            let held = sync.try_lock_send_owned();
            lock(&self.documents).insert(uri, Arc::clone(&sync));
            self.send_open(&sync).await;
            drop(held);
        }
        Ok(())
    }

    /// Connects a document, starting the session first when needed.
    ///
    /// Connecting an already connected document is a no-op that returns the
    /// existing synchronizer; `didOpen` is sent exactly once.
    ///
    /// # Errors
    ///
    /// Returns the start failure, or [`LspError::NotStarted`] for a failed
    /// session.
    pub async fn connect(
        self: &Arc<Self>,
        document: &DocumentRef,
        text: &TextBuffer,
    ) -> LspResult<Arc<DocumentSynchronizer>> {
        self.start().await?;
        self.attach_generation.fetch_add(1, Ordering::SeqCst);

        let capabilities = self.capabilities().ok_or_else(|| self.not_started())?;
        let (sync, held) = {
            let mut documents = lock(&self.documents);
            if let Some(existing) = documents.get(&document.uri) {
                return Ok(Arc::clone(existing));
            }
            let sync = Arc::new(DocumentSynchronizer::new(
                document.uri.clone(),
                self.definition.language_id_for(&document.language),
                sync_settings(&capabilities),
                text,
            ));
            // Held until didOpen is written so no change can overtake it.
            let held = sync.try_lock_send_owned();
            documents.insert(document.uri.clone(), Arc::clone(&sync));
            (sync, held)
        };

        self.send_open(&sync).await;
        drop(held);
        Ok(sync)
    }

    /// Caller holds the document's send lock.
    async fn send_open(&self, sync: &DocumentSynchronizer) {
        match self.client() {
            Ok(client) => {
                if let Err(e) = client.notify::<DidOpenTextDocument>(sync.open_params()).await {
                    warn!("didOpen to '{}' failed: {}", self.definition.id, e);
                    return;
                }
                self.events.send(EventKind::DocumentOpened {
                    server: self.definition.id.clone(),
                    uri: sync.uri().as_str().to_string(),
                });
            }
            Err(e) => debug!("Not opening {}: {}", sync.uri().as_str(), e),
        }
    }

    /// Disconnects a document; the last detach arms the disconnect timer.
    pub async fn disconnect(self: &Arc<Self>, uri: &Uri) {
        let (removed, now_empty) = {
            let mut documents = lock(&self.documents);
            let removed = documents.remove(uri);
            (removed, documents.is_empty())
        };
        let Some(sync) = removed else {
            return;
        };
        self.attach_generation.fetch_add(1, Ordering::SeqCst);

        {
            let _send = sync.lock_send().await;
            if let Ok(client) = self.client() {
                match client.notify::<DidCloseTextDocument>(sync.close_params()).await {
                    Ok(()) => self.events.send(EventKind::DocumentClosed {
                        server: self.definition.id.clone(),
                        uri: uri.as_str().to_string(),
                    }),
                    Err(e) => warn!("didClose to '{}' failed: {}", self.definition.id, e),
                }
            }
        }

        if now_empty {
            self.arm_disconnect_timer();
        }
    }

    fn arm_disconnect_timer(self: &Arc<Self>) {
        let generation = self.attach_generation.load(Ordering::SeqCst);
        let timeout = self.definition.disconnect_timeout;
        let session: Weak<Self> = Arc::downgrade(self);
        debug!(
            "Session '{}' has no documents; stopping in {:?} unless reused",
            self.definition.id, timeout
        );
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.attach_generation.load(Ordering::SeqCst) == generation
                && session.document_count() == 0
                && session.state() == ServerState::Started
            {
                info!(
                    "Stopping idle language server '{}' after {:?}",
                    session.definition.id, timeout
                );
                session.stop().await;
            }
        });
    }

    /// Pre-edit hook for a connected document.
    pub fn before_change(&self, uri: &Uri, buffer: &TextBuffer, edit: &DocumentEdit) {
        if let Some(sync) = self.synchronizer(uri) {
            sync.before_change(buffer, edit);
        }
    }

    /// Post-edit hook for a connected document.
    pub fn after_change(&self, uri: &Uri, buffer: &TextBuffer) {
        if let Some(sync) = self.synchronizer(uri) {
            sync.after_change(buffer);
        }
    }

    /// Sends the pending changes of a document as one `didChange`.
    ///
    /// Returns the committed version, or `None` when nothing was pending or
    /// the document is not connected.
    pub async fn commit(&self, uri: &Uri) -> Option<i32> {
        let sync = self.synchronizer(uri)?;
        let _send = sync.lock_send().await;
        let params = sync.take_commit()?;
        let version = params.text_document.version;
        match self.client() {
            Ok(client) => {
                if let Err(e) = client.notify::<DidChangeTextDocument>(params).await {
                    warn!("didChange to '{}' failed: {}", self.definition.id, e);
                }
            }
            Err(e) => debug!("Dropping didChange for {}: {}", uri.as_str(), e),
        }
        Some(version)
    }

    /// Sends `didSave` for a connected document, when the server wants it.
    pub async fn saved(&self, uri: &Uri, buffer: &TextBuffer) {
        let Some(sync) = self.synchronizer(uri) else {
            return;
        };
        let _send = sync.lock_send().await;
        let Some(params) = sync.save_params(buffer) else {
            return;
        };
        if let Ok(client) = self.client()
            && let Err(e) = client.notify::<DidSaveTextDocument>(params).await
        {
            warn!("didSave to '{}' failed: {}", self.definition.id, e);
        }
    }

    /// Sends a typed request to the server.
    ///
    /// # Errors
    ///
    /// Returns [`LspError::NotStarted`] unless `Started`, otherwise any
    /// request failure from the client.
    pub async fn request<R: Request>(
        &self,
        params: R::Params,
        cancellation: Option<&CancellationSupport>,
    ) -> LspResult<R::Result> {
        self.client()?.request::<R>(params, cancellation).await
    }

    /// Latest diagnostics the server published for `uri`.
    pub async fn diagnostics(&self, uri: &Uri) -> Vec<Diagnostic> {
        match self.client() {
            Ok(client) => client.diagnostics(uri).await,
            Err(_) => Vec::new(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
